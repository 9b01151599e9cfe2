//! Persistent cache over the `drive_cache` table.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::DriveCache;
use crate::db::Store;
use crate::vfs::error::DriveResult;
use crate::vfs::types::{EntrySnapshot, now_millis};

const KIND_ENTRY: &str = "entry";
const KIND_CHILDREN: &str = "children";

/// Cache rows for one drive, stored as JSON under the drive's namespace.
#[derive(Debug, Clone)]
pub struct SqliteDriveCache {
    store: Arc<Store>,
    namespace: String,
}

impl SqliteDriveCache {
    pub fn new(store: Arc<Store>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    fn expires_at(ttl: Option<Duration>) -> i64 {
        // Zero marks rows that never expire.
        match ttl {
            Some(ttl) => now_millis() + ttl.as_millis() as i64,
            None => 0,
        }
    }
}

impl DriveCache for SqliteDriveCache {
    fn put_entry(&self, entry: &EntrySnapshot, ttl: Option<Duration>) -> DriveResult<()> {
        let value = serde_json::to_string(entry)?;
        self.store.cache_put(
            &self.namespace,
            KIND_ENTRY,
            &entry.path,
            &value,
            Self::expires_at(ttl),
        )?;
        Ok(())
    }

    fn put_children(
        &self,
        parent: &str,
        children: &[EntrySnapshot],
        ttl: Option<Duration>,
    ) -> DriveResult<()> {
        for child in children {
            self.put_entry(child, ttl)?;
        }
        let paths: Vec<&str> = children.iter().map(|c| c.path.as_str()).collect();
        self.store.cache_put(
            &self.namespace,
            KIND_CHILDREN,
            parent,
            &serde_json::to_string(&paths)?,
            Self::expires_at(ttl),
        )?;
        Ok(())
    }

    fn get_entry(&self, path: &str) -> DriveResult<Option<EntrySnapshot>> {
        let Some(value) = self
            .store
            .cache_get(&self.namespace, KIND_ENTRY, path, now_millis())?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&value)?))
    }

    fn get_children(&self, path: &str) -> DriveResult<Option<Vec<EntrySnapshot>>> {
        let Some(value) = self
            .store
            .cache_get(&self.namespace, KIND_CHILDREN, path, now_millis())?
        else {
            return Ok(None);
        };
        let paths: Vec<String> = serde_json::from_str(&value)?;
        let mut children = Vec::with_capacity(paths.len());
        for child in &paths {
            match self.get_entry(child)? {
                Some(entry) => children.push(entry),
                None => return Ok(None),
            }
        }
        Ok(Some(children))
    }

    fn evict(&self, path: &str, descendants: bool) -> DriveResult<()> {
        self.store.cache_evict(&self.namespace, path, descendants)?;
        Ok(())
    }

    fn clear(&self) -> DriveResult<()> {
        self.store.cache_clear(&self.namespace)?;
        Ok(())
    }
}

/// Purge expired cache rows every `interval` until `shutdown` fires.
pub fn spawn_cache_cleaner(
    store: Arc<Store>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("cache cleaner shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match store.cache_purge_expired(now_millis()) {
                        Ok(0) => {}
                        Ok(n) => tracing::debug!("purged {} expired cache rows", n),
                        Err(e) => tracing::warn!("cache purge failed: {}", e),
                    }
                }
            }
        }
    })
}
