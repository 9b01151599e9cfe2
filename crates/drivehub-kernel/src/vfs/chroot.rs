//! Chroot adapter: exposes a sub-directory of a drive as its root.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::entry::{BoxReader, Entry, EntryRef, RebasedEntry};
use super::error::{DriveError, DriveResult};
use super::ops::{Drive, DriveRef};
use super::path;
use super::types::{DriveMeta, UploadConfig, UploadOptions};
use crate::task::TaskCtx;

/// Marks entries produced by one [`ChrootDrive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChrootTag(Uuid);

pub type ChrootEntry = RebasedEntry<ChrootTag>;

pub struct ChrootDrive {
    tag: ChrootTag,
    inner: DriveRef,
    root: String,
}

impl ChrootDrive {
    pub fn new(inner: DriveRef, root: &str) -> Self {
        Self {
            tag: ChrootTag(Uuid::new_v4()),
            inner,
            root: path::clean_path(root),
        }
    }

    /// Wrap `inner` unless `root` is the drive root already.
    pub fn wrap(inner: DriveRef, root: &str) -> DriveRef {
        if path::clean_path(root).is_empty() {
            inner
        } else {
            Arc::new(Self::new(inner, root))
        }
    }

    /// `path` is cleaned on its own first, so `..` never climbs above the
    /// chroot.
    fn inner_path(&self, path: &str) -> DriveResult<String> {
        Ok(path::join(&self.root, &path::checked_path(path)?))
    }

    fn outer_path(&self, inner: &str) -> DriveResult<String> {
        path::strip_prefix(inner, &self.root)
            .map(str::to_string)
            .ok_or_else(|| {
                DriveError::internal(format!("{inner} is outside the chroot {}", self.root))
            })
    }

    fn wrap_entry(&self, entry: EntryRef) -> DriveResult<EntryRef> {
        let outer = self.outer_path(entry.path())?;
        Ok(Arc::new(RebasedEntry::new(outer, entry, self.tag)))
    }

    /// Peel our own layer off `entry`; foreign entries pass unchanged.
    fn unwrap_entry(&self, entry: EntryRef) -> EntryRef {
        match entry.as_any().downcast_ref::<ChrootEntry>() {
            Some(own) if *own.tag() == self.tag => own.inner_entry().clone(),
            _ => entry,
        }
    }
}

#[async_trait]
impl Drive for ChrootDrive {
    fn meta(&self) -> DriveMeta {
        self.inner.meta()
    }

    async fn get(&self, path: &str) -> DriveResult<EntryRef> {
        let entry = self.inner.get(&self.inner_path(path)?).await?;
        self.wrap_entry(entry)
    }

    async fn list(&self, path: &str) -> DriveResult<Vec<EntryRef>> {
        self.inner
            .list(&self.inner_path(path)?)
            .await?
            .into_iter()
            .map(|e| self.wrap_entry(e))
            .collect()
    }

    async fn save(
        &self,
        ctx: &TaskCtx,
        path: &str,
        size: i64,
        overwrite: bool,
        reader: BoxReader,
    ) -> DriveResult<EntryRef> {
        let entry = self
            .inner
            .save(ctx, &self.inner_path(path)?, size, overwrite, reader)
            .await?;
        self.wrap_entry(entry)
    }

    async fn make_dir(&self, path: &str) -> DriveResult<EntryRef> {
        let entry = self.inner.make_dir(&self.inner_path(path)?).await?;
        self.wrap_entry(entry)
    }

    async fn copy(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef> {
        let entry = self
            .inner
            .copy(ctx, self.unwrap_entry(src), &self.inner_path(dst)?, overwrite)
            .await?;
        self.wrap_entry(entry)
    }

    async fn move_entry(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef> {
        let entry = self
            .inner
            .move_entry(ctx, self.unwrap_entry(src), &self.inner_path(dst)?, overwrite)
            .await?;
        self.wrap_entry(entry)
    }

    async fn delete(&self, ctx: &TaskCtx, path: &str) -> DriveResult<()> {
        if path.is_empty() {
            return Err(DriveError::not_allowed("cannot delete the drive root"));
        }
        self.inner.delete(ctx, &self.inner_path(path)?).await
    }

    async fn upload(
        &self,
        path: &str,
        size: i64,
        overwrite: bool,
        opts: &UploadOptions,
    ) -> DriveResult<UploadConfig> {
        self.inner
            .upload(&self.inner_path(path)?, size, overwrite, opts)
            .await
    }

    async fn dispose(&self) -> DriveResult<()> {
        self.inner.dispose().await
    }
}
