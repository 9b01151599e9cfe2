//! The drive contract.
//!
//! Every backend and every wrapper layer implements [`Drive`]. Paths are
//! canonical (see [`super::path::clean_path`]) and relative to the drive's
//! own root; `""` is the root.

use std::sync::Arc;

use async_trait::async_trait;

use super::entry::{BoxReader, EntryRef};
use super::error::DriveResult;
use super::types::{DriveMeta, UploadConfig, UploadOptions};
use crate::task::TaskCtx;

/// Core drive operations.
///
/// Semantics every implementation must honour:
///
/// - `get("")` returns the drive-root directory entry.
/// - `list` fails *not-allowed* on a file and *not-found* on a missing path;
///   the order of children is unspecified.
/// - `save` with `overwrite == false` fails *not-allowed* if anything exists
///   at the path. `size` is [`super::types::SIZE_UNKNOWN`] when unknown.
/// - `make_dir` is idempotent over directories and fails *not-allowed* when a
///   file is in the way.
/// - `copy` may return *unsupported*; the dispatcher then streams instead.
/// - `move_entry` only accepts entries of this drive; anything else is
///   *not-allowed*.
/// - `delete` removes the whole subtree.
#[async_trait]
pub trait Drive: Send + Sync {
    fn meta(&self) -> DriveMeta;

    async fn get(&self, path: &str) -> DriveResult<EntryRef>;

    async fn list(&self, path: &str) -> DriveResult<Vec<EntryRef>>;

    async fn save(
        &self,
        ctx: &TaskCtx,
        path: &str,
        size: i64,
        overwrite: bool,
        reader: BoxReader,
    ) -> DriveResult<EntryRef>;

    async fn make_dir(&self, path: &str) -> DriveResult<EntryRef>;

    async fn copy(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef>;

    async fn move_entry(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef>;

    async fn delete(&self, ctx: &TaskCtx, path: &str) -> DriveResult<()>;

    async fn upload(
        &self,
        path: &str,
        size: i64,
        overwrite: bool,
        opts: &UploadOptions,
    ) -> DriveResult<UploadConfig>;

    /// Release resources. Called when the drive is dropped from the
    /// dispatcher or the process shuts down.
    async fn dispose(&self) -> DriveResult<()> {
        Ok(())
    }

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// `Ok(None)` when the path does not exist; other errors pass through.
    async fn get_opt(&self, path: &str) -> DriveResult<Option<EntryRef>> {
        match self.get(path).await {
            Ok(entry) => Ok(Some(entry)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Shared drive handle.
pub type DriveRef = Arc<dyn Drive>;
