//! Permission wrapper.
//!
//! Every call is checked against the caller's effective permission on the
//! target path. Missing permission surfaces as not-found so callers cannot
//! probe for paths they may not see. Listings drop children the caller
//! cannot read, and every entry's `can_read`/`can_write` is intersected with
//! the caller's permission.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::OverlayEntry;
use crate::permission::{Permission, PermissionStore};
use crate::session::Session;
use crate::task::TaskCtx;
use crate::vfs::entry::{BoxReader, Entry, EntryRef};
use crate::vfs::error::{DriveError, DriveResult};
use crate::vfs::ops::{Drive, DriveRef};
use crate::vfs::path;
use crate::vfs::types::{DriveMeta, UploadConfig, UploadOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PermissionTag(Uuid);

type PermissionEntry = OverlayEntry<PermissionTag>;

pub struct PermissionDrive {
    tag: PermissionTag,
    inner: DriveRef,
    rules: Arc<PermissionStore>,
    subjects: Vec<String>,
}

impl PermissionDrive {
    pub fn new(inner: DriveRef, rules: Arc<PermissionStore>, session: &Session) -> Self {
        Self {
            tag: PermissionTag(Uuid::new_v4()),
            inner,
            rules,
            subjects: session.subjects(),
        }
    }

    /// The caller's permission on `path`, or not-found when it lacks
    /// `required`.
    fn require(&self, path: &str, required: Permission) -> DriveResult<Permission> {
        let perm = self.rules.resolve(path, &self.subjects);
        if perm.contains(required) {
            Ok(perm)
        } else {
            tracing::debug!("{} denied on {} (have {})", required, path, perm);
            Err(DriveError::not_found(path))
        }
    }

    /// Like [`Self::require`], but also fails when a rule somewhere beneath
    /// `path` withholds `required`.
    fn require_tree(&self, path: &str, required: Permission) -> DriveResult<Permission> {
        let perm = self.require(path, required)?;
        if let Some(denied) = self.rules.denied_descendant(path, &self.subjects, required) {
            tracing::debug!("{} denied beneath {} at {}", required, path, denied);
            return Err(DriveError::not_found(path));
        }
        Ok(perm)
    }

    fn wrap(&self, entry: EntryRef, perm: Permission) -> EntryRef {
        let mut meta = entry.meta();
        meta.can_read &= perm.can_read();
        meta.can_write &= perm.can_write();
        PermissionEntry::wrap(entry, meta, self.tag)
    }

    fn peel(&self, entry: EntryRef) -> EntryRef {
        PermissionEntry::peel(entry, &self.tag)
    }
}

#[async_trait]
impl Drive for PermissionDrive {
    fn meta(&self) -> DriveMeta {
        self.inner.meta()
    }

    async fn get(&self, path: &str) -> DriveResult<EntryRef> {
        let path = path::checked_path(path)?;
        let perm = self.require(&path, Permission::READ)?;
        let entry = self.inner.get(&path).await?;
        Ok(self.wrap(entry, perm))
    }

    async fn list(&self, path: &str) -> DriveResult<Vec<EntryRef>> {
        let path = path::checked_path(path)?;
        let perm = self.require(&path, Permission::READ)?;
        let overrides = self.rules.resolve_children(&path, &self.subjects);
        let children = self.inner.list(&path).await?;

        Ok(children
            .into_iter()
            .filter_map(|child| {
                let child_perm = overrides.get(child.path()).copied().unwrap_or(perm);
                child_perm
                    .can_read()
                    .then(|| self.wrap(child, child_perm))
            })
            .collect())
    }

    async fn save(
        &self,
        ctx: &TaskCtx,
        path: &str,
        size: i64,
        overwrite: bool,
        reader: BoxReader,
    ) -> DriveResult<EntryRef> {
        let path = path::checked_path(path)?;
        let perm = self.require(&path, Permission::READ_WRITE)?;
        let entry = self.inner.save(ctx, &path, size, overwrite, reader).await?;
        Ok(self.wrap(entry, perm))
    }

    async fn make_dir(&self, path: &str) -> DriveResult<EntryRef> {
        let path = path::checked_path(path)?;
        let perm = self.require(&path, Permission::READ_WRITE)?;
        let entry = self.inner.make_dir(&path).await?;
        Ok(self.wrap(entry, perm))
    }

    async fn copy(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef> {
        let dst = path::checked_path(dst)?;
        if src.kind().is_dir() {
            self.require_tree(src.path(), Permission::READ)?;
        } else {
            self.require(src.path(), Permission::READ)?;
        }
        let perm = self.require(&dst, Permission::READ_WRITE)?;
        let entry = self.inner.copy(ctx, self.peel(src), &dst, overwrite).await?;
        Ok(self.wrap(entry, perm))
    }

    async fn move_entry(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef> {
        let dst = path::checked_path(dst)?;
        self.require_tree(src.path(), Permission::READ_WRITE)?;
        let perm = self.require(&dst, Permission::READ_WRITE)?;
        let entry = self
            .inner
            .move_entry(ctx, self.peel(src), &dst, overwrite)
            .await?;
        Ok(self.wrap(entry, perm))
    }

    async fn delete(&self, ctx: &TaskCtx, path: &str) -> DriveResult<()> {
        let path = path::checked_path(path)?;
        self.require_tree(&path, Permission::READ_WRITE)?;
        self.inner.delete(ctx, &path).await
    }

    async fn upload(
        &self,
        path: &str,
        size: i64,
        overwrite: bool,
        opts: &UploadOptions,
    ) -> DriveResult<UploadConfig> {
        let path = path::checked_path(path)?;
        self.require(&path, Permission::READ_WRITE)?;
        self.inner.upload(&path, size, overwrite, opts).await
    }
}
