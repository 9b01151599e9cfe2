//! Listener wrapper: reports successful calls to observers.

use std::sync::Arc;

use async_trait::async_trait;

use crate::session::Session;
use crate::task::TaskCtx;
use crate::vfs::entry::{BoxReader, Entry, EntryRef};
use crate::vfs::error::DriveResult;
use crate::vfs::ops::{Drive, DriveRef};
use crate::vfs::types::{DriveMeta, UploadConfig, UploadOptions};

/// Who acted, and on which drive stack.
#[derive(Clone, Copy)]
pub struct ListenerCtx<'a> {
    pub session: &'a Session,
    pub drive: &'a dyn Drive,
}

impl ListenerCtx<'_> {
    /// Name of the acting user, `None` for anonymous callers.
    pub fn username(&self) -> Option<&str> {
        self.session.user().map(|u| u.name.as_str())
    }
}

/// Observer of drive activity. Called inline after the operation succeeds;
/// implementations must return quickly. Errors are logged and dropped.
pub trait DriveListener: Send + Sync {
    fn on_access(&self, _ctx: &ListenerCtx<'_>, _entry: &EntryRef) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_updated(
        &self,
        _ctx: &ListenerCtx<'_>,
        _entry: &EntryRef,
        _copied: bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_deleted(&self, _ctx: &ListenerCtx<'_>, _path: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logs every event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl DriveListener for LoggingListener {
    fn on_access(&self, ctx: &ListenerCtx<'_>, entry: &EntryRef) -> anyhow::Result<()> {
        tracing::debug!(user = ?ctx.username(), path = %entry.path(), "accessed");
        Ok(())
    }

    fn on_updated(
        &self,
        ctx: &ListenerCtx<'_>,
        entry: &EntryRef,
        copied: bool,
    ) -> anyhow::Result<()> {
        tracing::debug!(user = ?ctx.username(), path = %entry.path(), copied, "updated");
        Ok(())
    }

    fn on_deleted(&self, ctx: &ListenerCtx<'_>, path: &str) -> anyhow::Result<()> {
        tracing::debug!(user = ?ctx.username(), path, "deleted");
        Ok(())
    }
}

pub struct ListenerDrive {
    inner: DriveRef,
    session: Session,
    listeners: Vec<Arc<dyn DriveListener>>,
}

impl ListenerDrive {
    pub fn new(inner: DriveRef, session: Session, listeners: Vec<Arc<dyn DriveListener>>) -> Self {
        Self {
            inner,
            session,
            listeners,
        }
    }

    fn emit(
        &self,
        event: &str,
        f: impl Fn(&dyn DriveListener, &ListenerCtx<'_>) -> anyhow::Result<()>,
    ) {
        let ctx = ListenerCtx {
            session: &self.session,
            drive: self.inner.as_ref(),
        };
        for listener in &self.listeners {
            if let Err(e) = f(listener.as_ref(), &ctx) {
                tracing::warn!("{} listener failed: {:#}", event, e);
            }
        }
    }

    fn accessed(&self, entry: &EntryRef) {
        self.emit("access", |l, ctx| l.on_access(ctx, entry));
    }

    fn updated(&self, entry: &EntryRef, copied: bool) {
        self.emit("update", |l, ctx| l.on_updated(ctx, entry, copied));
    }

    fn deleted(&self, path: &str) {
        self.emit("delete", |l, ctx| l.on_deleted(ctx, path));
    }
}

#[async_trait]
impl Drive for ListenerDrive {
    fn meta(&self) -> DriveMeta {
        self.inner.meta()
    }

    async fn get(&self, path: &str) -> DriveResult<EntryRef> {
        let entry = self.inner.get(path).await?;
        self.accessed(&entry);
        Ok(entry)
    }

    async fn list(&self, path: &str) -> DriveResult<Vec<EntryRef>> {
        let children = self.inner.list(path).await?;
        for child in &children {
            self.accessed(child);
        }
        Ok(children)
    }

    async fn save(
        &self,
        ctx: &TaskCtx,
        path: &str,
        size: i64,
        overwrite: bool,
        reader: BoxReader,
    ) -> DriveResult<EntryRef> {
        let entry = self.inner.save(ctx, path, size, overwrite, reader).await?;
        self.updated(&entry, false);
        Ok(entry)
    }

    async fn make_dir(&self, path: &str) -> DriveResult<EntryRef> {
        let entry = self.inner.make_dir(path).await?;
        self.updated(&entry, false);
        Ok(entry)
    }

    async fn copy(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef> {
        let entry = self.inner.copy(ctx, src, dst, overwrite).await?;
        self.updated(&entry, true);
        Ok(entry)
    }

    async fn move_entry(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef> {
        let from = src.path().to_string();
        let entry = self.inner.move_entry(ctx, src, dst, overwrite).await?;
        self.deleted(&from);
        self.updated(&entry, false);
        Ok(entry)
    }

    async fn delete(&self, ctx: &TaskCtx, path: &str) -> DriveResult<()> {
        self.inner.delete(ctx, path).await?;
        self.deleted(path);
        Ok(())
    }

    async fn upload(
        &self,
        path: &str,
        size: i64,
        overwrite: bool,
        opts: &UploadOptions,
    ) -> DriveResult<UploadConfig> {
        self.inner.upload(path, size, overwrite, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::User;
    use crate::vfs::backends::MemoryDrive;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, ctx: &ListenerCtx<'_>, event: String) {
            let user = ctx.username().unwrap_or("-");
            self.events.lock().push(format!("{user}: {event}"));
        }
    }

    impl DriveListener for Recorder {
        fn on_access(&self, ctx: &ListenerCtx<'_>, entry: &EntryRef) -> anyhow::Result<()> {
            self.push(ctx, format!("access {}", entry.path()));
            Ok(())
        }

        fn on_updated(
            &self,
            ctx: &ListenerCtx<'_>,
            entry: &EntryRef,
            copied: bool,
        ) -> anyhow::Result<()> {
            self.push(ctx, format!("update {} {}", entry.path(), copied));
            Ok(())
        }

        fn on_deleted(&self, ctx: &ListenerCtx<'_>, path: &str) -> anyhow::Result<()> {
            self.push(ctx, format!("delete {path}"));
            Ok(())
        }
    }

    struct Failing;

    impl DriveListener for Failing {
        fn on_updated(&self, _: &ListenerCtx<'_>, _: &EntryRef, _: bool) -> anyhow::Result<()> {
            anyhow::bail!("listener down")
        }
    }

    fn bytes(data: &[u8]) -> BoxReader {
        Box::new(std::io::Cursor::new(data.to_vec()))
    }

    #[tokio::test]
    async fn test_events_follow_operations() {
        let recorder = Arc::new(Recorder::default());
        let listeners: Vec<Arc<dyn DriveListener>> = vec![Arc::new(Failing), recorder.clone()];
        let session = Session::for_user(User::new("alice"));
        let drive = ListenerDrive::new(Arc::new(MemoryDrive::new()), session, listeners);
        let ctx = TaskCtx::new();

        drive.save(&ctx, "a", 1, false, bytes(b"x")).await.unwrap();
        let src = drive.get("a").await.unwrap();
        drive.move_entry(&ctx, src, "b", false).await.unwrap();
        drive.delete(&ctx, "b").await.unwrap();

        assert_eq!(
            *recorder.events.lock(),
            vec![
                "alice: update a false",
                "alice: access a",
                "alice: delete a",
                "alice: update b false",
                "alice: delete b",
            ]
        );
    }

    #[tokio::test]
    async fn test_anonymous_caller_and_drive_in_context() {
        struct Witness {
            expected: DriveRef,
            seen: Mutex<Vec<(Option<String>, bool)>>,
        }

        impl DriveListener for Witness {
            fn on_access(&self, ctx: &ListenerCtx<'_>, _: &EntryRef) -> anyhow::Result<()> {
                let same = std::ptr::addr_eq(ctx.drive, Arc::as_ptr(&self.expected));
                self.seen.lock().push((ctx.username().map(str::to_string), same));
                Ok(())
            }
        }

        let inner: DriveRef = Arc::new(MemoryDrive::new());
        inner.save(&TaskCtx::new(), "f", 1, false, bytes(b"x")).await.unwrap();
        let witness = Arc::new(Witness {
            expected: inner.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let listeners: Vec<Arc<dyn DriveListener>> = vec![witness.clone()];
        let drive = ListenerDrive::new(inner, Session::anonymous(), listeners);
        drive.get("f").await.unwrap();
        assert_eq!(*witness.seen.lock(), vec![(None, true)]);
    }

    #[tokio::test]
    async fn test_failed_call_emits_nothing() {
        let recorder = Arc::new(Recorder::default());
        let listeners: Vec<Arc<dyn DriveListener>> = vec![recorder.clone()];
        let drive = ListenerDrive::new(Arc::new(MemoryDrive::new()), Session::anonymous(), listeners);
        assert!(drive.get("missing").await.is_err());
        assert!(recorder.events.lock().is_empty());
    }
}
