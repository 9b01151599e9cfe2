//! Drive caches.
//!
//! A [`DriveCache`] stores entry snapshots and directory listings for one
//! drive. [`CachedDrive`] wraps a drive with a cache: reads go through it,
//! mutations evict the affected keys once the inner call succeeds. Cache
//! failures are logged and treated as misses.

mod memory;
mod sqlite;

pub use memory::MemoryDriveCache;
pub use sqlite::{SqliteDriveCache, spawn_cache_cleaner};

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::entry::{BoxReader, Entry, EntryContent, EntryRef, find_entry, open_reader, snapshot};
use super::error::DriveResult;
use super::ops::{Drive, DriveRef};
use super::path;
use super::types::{DriveMeta, EntryMeta, EntrySnapshot, EntryType, UploadConfig, UploadOptions};
use crate::task::TaskCtx;

/// Storage for cached entries and listings.
///
/// A `ttl` of `None` never expires.
pub trait DriveCache: Send + Sync {
    fn put_entry(&self, entry: &EntrySnapshot, ttl: Option<Duration>) -> DriveResult<()>;

    /// Store every child as an entry, plus the list of child paths under
    /// `parent`.
    fn put_children(
        &self,
        parent: &str,
        children: &[EntrySnapshot],
        ttl: Option<Duration>,
    ) -> DriveResult<()>;

    fn get_entry(&self, path: &str) -> DriveResult<Option<EntrySnapshot>>;

    /// A miss unless the list and every listed entry are present.
    fn get_children(&self, path: &str) -> DriveResult<Option<Vec<EntrySnapshot>>>;

    /// Drop both kinds at `path`, and everything beneath it when
    /// `descendants` is set.
    fn evict(&self, path: &str, descendants: bool) -> DriveResult<()>;

    fn clear(&self) -> DriveResult<()>;
}

/// Shared cache handle.
pub type CacheRef = Arc<dyn DriveCache>;

/// Entry served from the cache. Content is fetched from the inner drive on
/// demand.
pub struct CachedEntry {
    owner: Uuid,
    snapshot: EntrySnapshot,
    drive: DriveRef,
}

impl std::fmt::Debug for CachedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedEntry")
            .field("owner", &self.owner)
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

impl Entry for CachedEntry {
    fn path(&self) -> &str {
        &self.snapshot.path
    }

    fn kind(&self) -> EntryType {
        self.snapshot.kind
    }

    fn size(&self) -> i64 {
        self.snapshot.size
    }

    fn mod_time(&self) -> i64 {
        self.snapshot.mod_time
    }

    fn meta(&self) -> EntryMeta {
        self.snapshot.meta.clone()
    }

    fn content(&self) -> Option<&dyn EntryContent> {
        if self.snapshot.kind.is_file() { Some(self) } else { None }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl EntryContent for CachedEntry {
    async fn reader(&self) -> DriveResult<BoxReader> {
        let fresh = self.drive.get(&self.snapshot.path).await?;
        open_reader(fresh.as_ref()).await
    }
}

/// Drive wrapper that caches `get` and `list`.
pub struct CachedDrive {
    id: Uuid,
    inner: DriveRef,
    cache: CacheRef,
    ttl: Option<Duration>,
}

impl CachedDrive {
    /// Wrap `inner`. `ttl == None` caches without expiry.
    pub fn new(inner: DriveRef, cache: CacheRef, ttl: Option<Duration>) -> Self {
        Self {
            id: Uuid::new_v4(),
            inner,
            cache,
            ttl,
        }
    }

    /// Wrap `inner` unless `ttl` is zero, which disables caching.
    pub fn wrap(inner: DriveRef, cache: CacheRef, ttl: Duration) -> DriveRef {
        if ttl.is_zero() {
            inner
        } else {
            Arc::new(Self::new(inner, cache, Some(ttl)))
        }
    }

    pub fn cache(&self) -> &CacheRef {
        &self.cache
    }

    fn cached(&self, snapshot: EntrySnapshot) -> EntryRef {
        Arc::new(CachedEntry {
            owner: self.id,
            snapshot,
            drive: self.inner.clone(),
        })
    }

    /// Replace a cache hit of ours with the inner drive's real entry, so the
    /// backend recognises it.
    async fn real(&self, entry: EntryRef) -> DriveResult<EntryRef> {
        match find_entry::<CachedEntry>(entry.as_ref()) {
            Some(cached) if cached.owner == self.id => self.inner.get(&cached.snapshot.path).await,
            _ => Ok(entry),
        }
    }

    fn evict(&self, path: &str, descendants: bool) {
        if let Err(e) = self.cache.evict(path, descendants) {
            tracing::warn!("cache evict {} failed: {}", path, e);
        }
    }

    /// Evict `path` (and what lies beneath) plus the parent's listing.
    fn evict_with_parent(&self, path: &str) {
        self.evict(path, true);
        self.evict(path::parent(path), false);
    }

    /// Evict `path` (and what lies beneath) plus every ancestor. Writes
    /// create missing parent directories, so any ancestor listing may change.
    fn evict_with_ancestors(&self, path: &str) {
        self.evict(path, true);
        for ancestor in path::ancestors(path) {
            if ancestor != path {
                self.evict(&ancestor, false);
            }
        }
    }
}

#[async_trait]
impl Drive for CachedDrive {
    fn meta(&self) -> DriveMeta {
        self.inner.meta()
    }

    async fn get(&self, path: &str) -> DriveResult<EntryRef> {
        match self.cache.get_entry(path) {
            Ok(Some(snap)) => {
                tracing::debug!("cache hit: entry {}", path);
                return Ok(self.cached(snap));
            }
            Ok(None) => tracing::debug!("cache miss: entry {}", path),
            Err(e) => tracing::warn!("cache read {} failed: {}", path, e),
        }
        let entry = self.inner.get(path).await?;
        if let Err(e) = self.cache.put_entry(&snapshot(entry.as_ref()), self.ttl) {
            tracing::warn!("cache write {} failed: {}", path, e);
        }
        Ok(entry)
    }

    async fn list(&self, path: &str) -> DriveResult<Vec<EntryRef>> {
        match self.cache.get_children(path) {
            Ok(Some(children)) => {
                tracing::debug!("cache hit: children {}", path);
                return Ok(children.into_iter().map(|s| self.cached(s)).collect());
            }
            Ok(None) => tracing::debug!("cache miss: children {}", path),
            Err(e) => tracing::warn!("cache read {} failed: {}", path, e),
        }
        let children = self.inner.list(path).await?;
        let snaps: Vec<_> = children.iter().map(|c| snapshot(c.as_ref())).collect();
        if let Err(e) = self.cache.put_children(path, &snaps, self.ttl) {
            tracing::warn!("cache write {} failed: {}", path, e);
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
        self.evict_with_ancestors(path);
        Ok(entry)
    }

    async fn make_dir(&self, path: &str) -> DriveResult<EntryRef> {
        let entry = self.inner.make_dir(path).await?;
        self.evict_with_ancestors(path);
        Ok(entry)
    }

    async fn copy(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef> {
        let src = self.real(src).await?;
        let entry = self.inner.copy(ctx, src, dst, overwrite).await?;
        self.evict_with_ancestors(dst);
        Ok(entry)
    }

    async fn move_entry(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef> {
        let src = self.real(src).await?;
        let from = src.path().to_string();
        let entry = self.inner.move_entry(ctx, src, dst, overwrite).await?;
        self.evict_with_parent(&from);
        self.evict_with_ancestors(dst);
        Ok(entry)
    }

    async fn delete(&self, ctx: &TaskCtx, path: &str) -> DriveResult<()> {
        self.inner.delete(ctx, path).await?;
        self.evict_with_parent(path);
        Ok(())
    }

    async fn upload(
        &self,
        path: &str,
        size: i64,
        overwrite: bool,
        opts: &UploadOptions,
    ) -> DriveResult<UploadConfig> {
        let config = self.inner.upload(path, size, overwrite, opts).await?;
        // Completing a multipart upload creates the file.
        if opts.contains_key("action") {
            self.evict_with_ancestors(path);
        }
        Ok(config)
    }

    async fn dispose(&self) -> DriveResult<()> {
        if let Err(e) = self.cache.clear() {
            tracing::warn!("cache clear failed: {}", e);
        }
        self.inner.dispose().await
    }
}
