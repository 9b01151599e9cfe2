//! Task context for long-running drive operations.
//!
//! A [`TaskCtx`] travels through copy, move, delete and save calls. It
//! carries a cancellation token (polled at every I/O boundary) and a pair of
//! progress counters that observers can watch while the walker discovers
//! more work.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio_util::sync::CancellationToken;

use crate::vfs::{DriveError, DriveResult};

/// Point-in-time view of a task's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub loaded: i64,
    pub total: i64,
}

type Observer = dyn Fn(Progress) + Send + Sync;

struct TaskState {
    loaded: AtomicI64,
    total: AtomicI64,
    observer: Option<Box<Observer>>,
}

/// Cancellation and progress carrier.
///
/// Cloning is cheap and clones share counters and cancellation.
#[derive(Clone)]
pub struct TaskCtx {
    token: CancellationToken,
    state: Arc<TaskState>,
}

impl fmt::Debug for TaskCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCtx")
            .field("cancelled", &self.is_cancelled())
            .field("progress", &self.snapshot())
            .finish()
    }
}

impl Default for TaskCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskCtx {
    /// A fresh context with no observer.
    pub fn new() -> Self {
        Self::build(CancellationToken::new(), None)
    }

    /// A fresh context that reports every counter change to `observer`.
    pub fn with_observer(observer: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        Self::build(CancellationToken::new(), Some(Box::new(observer)))
    }

    fn build(token: CancellationToken, observer: Option<Box<Observer>>) -> Self {
        Self {
            token,
            state: Arc::new(TaskState {
                loaded: AtomicI64::new(0),
                total: AtomicI64::new(0),
                observer,
            }),
        }
    }

    /// A sub-task with its own counters that is cancelled along with `self`.
    pub fn child(&self) -> Self {
        Self::build(self.token.child_token(), None)
    }

    /// Update the loaded counter, either to an absolute value or by a delta.
    pub fn progress(&self, loaded: i64, absolute: bool) {
        if absolute {
            self.state.loaded.store(loaded, Ordering::Relaxed);
        } else {
            self.state.loaded.fetch_add(loaded, Ordering::Relaxed);
        }
        self.notify();
    }

    /// Update the total-work hint, either to an absolute value or by a delta.
    pub fn total(&self, total: i64, absolute: bool) {
        if absolute {
            self.state.total.store(total, Ordering::Relaxed);
        } else {
            self.state.total.fetch_add(total, Ordering::Relaxed);
        }
        self.notify();
    }

    fn notify(&self) {
        if let Some(observer) = &self.state.observer {
            observer(self.snapshot());
        }
    }

    pub fn snapshot(&self) -> Progress {
        Progress {
            loaded: self.state.loaded.load(Ordering::Relaxed),
            total: self.state.total.load(Ordering::Relaxed),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(Cancelled)` once the context has been cancelled.
    pub fn check(&self) -> DriveResult<()> {
        if self.is_cancelled() {
            Err(DriveError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the context is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_progress_relative_and_absolute() {
        let ctx = TaskCtx::new();
        ctx.progress(5, false);
        ctx.progress(3, false);
        assert_eq!(ctx.snapshot().loaded, 8);
        ctx.progress(2, true);
        assert_eq!(ctx.snapshot().loaded, 2);
        ctx.total(10, false);
        ctx.total(4, false);
        assert_eq!(ctx.snapshot().total, 14);
    }

    #[test]
    fn test_observer_sees_updates() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = TaskCtx::with_observer(move |p| sink.lock().unwrap().push(p));
        ctx.total(3, true);
        ctx.progress(1, false);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], Progress { loaded: 1, total: 3 });
    }

    #[test]
    fn test_cancel_propagates_to_child() {
        let ctx = TaskCtx::new();
        let child = ctx.child();
        assert!(child.check().is_ok());
        ctx.cancel();
        assert!(child.is_cancelled());
        assert!(matches!(ctx.check(), Err(DriveError::Cancelled)));
    }

    #[test]
    fn test_child_counters_are_independent() {
        let ctx = TaskCtx::new();
        let child = ctx.child();
        child.progress(100, false);
        assert_eq!(ctx.snapshot().loaded, 0);
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let ctx = TaskCtx::new();
        let waiter = ctx.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        ctx.cancel();
        handle.await.unwrap();
    }
}
