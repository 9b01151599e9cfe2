//! Path-meta wrapper: merged ancestry metadata on entries, the password gate
//! on listings, and hidden-name filtering for anonymous callers.

use async_trait::async_trait;
use regex::Regex;
use uuid::Uuid;

use super::OverlayEntry;
use crate::path_meta::{MergedPathMeta, PathMetaStore};
use crate::session::Session;
use crate::task::TaskCtx;
use crate::vfs::entry::{BoxReader, Entry, EntryRef};
use crate::vfs::error::{DriveError, DriveResult};
use crate::vfs::ops::{Drive, DriveRef};
use crate::vfs::path;
use crate::vfs::types::{DriveMeta, UploadConfig, UploadOptions};

/// Error data key set when a listing needs a password.
pub const PASSWORD_REQUIRED: &str = "passwordRequired";

/// Session key under which a caller presents the password for `path`.
pub fn password_key(path: &str) -> String {
    format!("password:{path}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PathMetaTag(Uuid);

type PathMetaEntry = OverlayEntry<PathMetaTag>;

pub struct PathMetaDrive {
    tag: PathMetaTag,
    inner: DriveRef,
    meta: PathMetaStore,
    session: Session,
}

impl PathMetaDrive {
    pub fn new(inner: DriveRef, meta: PathMetaStore, session: Session) -> Self {
        Self {
            tag: PathMetaTag(Uuid::new_v4()),
            inner,
            meta,
            session,
        }
    }

    fn check_password(&self, path: &str, merged: &MergedPathMeta) -> DriveResult<()> {
        if merged.password.is_empty() || !self.session.is_anonymous() {
            return Ok(());
        }
        let presented = self.session.value(&password_key(&merged.password_path));
        if presented == Some(merged.password.as_str()) {
            return Ok(());
        }
        Err(DriveError::not_allowed(format!("{path} is password protected"))
            .with_data(PASSWORD_REQUIRED, true))
    }

    /// Compiled hidden pattern, for anonymous callers only.
    fn hidden(&self, merged: &MergedPathMeta) -> Option<Regex> {
        if merged.hidden_pattern.is_empty() || !self.session.is_anonymous() {
            return None;
        }
        match Regex::new(&merged.hidden_pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!("ignoring bad hidden pattern {:?}: {}", merged.hidden_pattern, e);
                None
            }
        }
    }

    fn wrap(&self, entry: EntryRef, merged: &MergedPathMeta) -> EntryRef {
        let mut meta = entry.meta();
        meta.props.extend(merged.props());
        PathMetaEntry::wrap(entry, meta, self.tag)
    }

    fn peel(&self, entry: EntryRef) -> EntryRef {
        PathMetaEntry::peel(entry, &self.tag)
    }

    fn wrap_one(&self, entry: EntryRef) -> DriveResult<EntryRef> {
        let merged = self.meta.merged(entry.path())?;
        Ok(self.wrap(entry, &merged))
    }
}

#[async_trait]
impl Drive for PathMetaDrive {
    fn meta(&self) -> DriveMeta {
        self.inner.meta()
    }

    async fn get(&self, path: &str) -> DriveResult<EntryRef> {
        let path = path::checked_path(path)?;
        let entry = self.inner.get(&path).await?;
        self.wrap_one(entry)
    }

    async fn list(&self, path: &str) -> DriveResult<Vec<EntryRef>> {
        let path = path::checked_path(path)?;
        let merged = self.meta.merged(&path)?;
        self.check_password(&path, &merged)?;

        let mut children = self.inner.list(&path).await?;
        if let Some(hidden) = self.hidden(&merged) {
            children.retain(|c| !hidden.is_match(c.name()));
        }

        let paths: Vec<String> = children.iter().map(|c| c.path().to_string()).collect();
        let metas = self.meta.merged_many(&paths)?;
        Ok(children
            .into_iter()
            .zip(metas.iter())
            .map(|(child, merged)| self.wrap(child, merged))
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
        let entry = self.inner.save(ctx, path, size, overwrite, reader).await?;
        self.wrap_one(entry)
    }

    async fn make_dir(&self, path: &str) -> DriveResult<EntryRef> {
        let entry = self.inner.make_dir(path).await?;
        self.wrap_one(entry)
    }

    async fn copy(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef> {
        let entry = self.inner.copy(ctx, self.peel(src), dst, overwrite).await?;
        self.wrap_one(entry)
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
            .move_entry(ctx, self.peel(src), dst, overwrite)
            .await?;
        self.wrap_one(entry)
    }

    async fn delete(&self, ctx: &TaskCtx, path: &str) -> DriveResult<()> {
        self.inner.delete(ctx, path).await
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
