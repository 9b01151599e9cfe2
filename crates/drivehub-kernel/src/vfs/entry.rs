//! Entries: descriptors for one file or directory at a moment in time.
//!
//! Layers compose entries by wrapping. A wrapper owns its inner entry and
//! exposes it through [`Entry::inner`]; nothing points back up the chain.
//! [`find_entry`] walks the chain to find the layer of a given concrete type,
//! which is how a drive recognises its own entries.
//!
//! Content access is an optional capability ([`EntryContent`]), not a field
//! every entry has to fill.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use super::error::{DriveError, DriveResult};
use super::path;
use super::types::{ContentUrl, EntryMeta, EntrySnapshot, EntryType, SIZE_UNKNOWN, TIME_UNKNOWN};

/// Owned byte stream used for reads and writes.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Shared entry handle.
pub type EntryRef = Arc<dyn Entry>;

/// Content access for entries that have bytes behind them.
#[async_trait]
pub trait EntryContent: Send + Sync {
    /// Open the content as a stream.
    async fn reader(&self) -> DriveResult<BoxReader>;

    /// Location the client can download from, if the backend offers one.
    fn url(&self) -> Option<ContentUrl> {
        None
    }
}

/// One node of the virtual tree.
pub trait Entry: Send + Sync + fmt::Debug {
    /// Canonical path relative to the owning drive's root.
    fn path(&self) -> &str;

    fn name(&self) -> &str {
        path::base_name(self.path())
    }

    fn kind(&self) -> EntryType;

    /// Size in bytes, [`SIZE_UNKNOWN`] for directories.
    fn size(&self) -> i64;

    /// Milliseconds since the epoch, [`TIME_UNKNOWN`] when unknown.
    fn mod_time(&self) -> i64;

    fn meta(&self) -> EntryMeta;

    /// Content capability, if this entry (or a layer beneath it) has one.
    fn content(&self) -> Option<&dyn EntryContent> {
        None
    }

    /// The wrapped entry, for wrapper layers.
    fn inner(&self) -> Option<&EntryRef> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Find the first layer of type `T`, starting at `entry` and unwrapping
/// inward.
pub fn find_entry<T: Entry + 'static>(entry: &dyn Entry) -> Option<&T> {
    let mut current = entry;
    loop {
        if let Some(found) = current.as_any().downcast_ref::<T>() {
            return Some(found);
        }
        current = current.inner()?.as_ref();
    }
}

/// Open an entry's content, failing with not-allowed when it has none.
pub async fn open_reader(entry: &dyn Entry) -> DriveResult<BoxReader> {
    match entry.content() {
        Some(content) => content.reader().await,
        None => Err(DriveError::not_allowed(format!(
            "{} has no readable content",
            entry.path()
        ))),
    }
}

/// Snapshot an entry for caching.
pub fn snapshot(entry: &dyn Entry) -> EntrySnapshot {
    EntrySnapshot {
        path: entry.path().to_string(),
        kind: entry.kind(),
        size: entry.size(),
        mod_time: entry.mod_time(),
        meta: entry.meta(),
    }
}

/// Entry with no content and no backend behind it: drive roots, synthetic
/// directories for drive names and mount points.
#[derive(Debug, Clone)]
pub struct BasicEntry {
    pub path: String,
    pub kind: EntryType,
    pub size: i64,
    pub mod_time: i64,
    pub meta: EntryMeta,
}

impl BasicEntry {
    /// Synthetic directory with unknown size and time.
    pub fn dir(path: impl Into<String>, meta: EntryMeta) -> Self {
        Self {
            path: path.into(),
            kind: EntryType::Dir,
            size: SIZE_UNKNOWN,
            mod_time: TIME_UNKNOWN,
            meta,
        }
    }

    /// The synthetic root directory of a drive.
    pub fn root(can_write: bool) -> Self {
        Self::dir(
            "",
            EntryMeta {
                can_read: true,
                can_write,
                ..Default::default()
            },
        )
    }

    pub fn into_ref(self) -> EntryRef {
        Arc::new(self)
    }
}

impl From<EntrySnapshot> for BasicEntry {
    fn from(snap: EntrySnapshot) -> Self {
        Self {
            path: snap.path,
            kind: snap.kind,
            size: snap.size,
            mod_time: snap.mod_time,
            meta: snap.meta,
        }
    }
}

impl Entry for BasicEntry {
    fn path(&self) -> &str {
        &self.path
    }

    fn kind(&self) -> EntryType {
        self.kind
    }

    fn size(&self) -> i64 {
        self.size
    }

    fn mod_time(&self) -> i64 {
        self.mod_time
    }

    fn meta(&self) -> EntryMeta {
        self.meta.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Wrapper that re-bases an entry under a different path. Used by the chroot
/// adapter and the dispatcher, which only ever rewrite the path.
#[derive(Debug)]
pub struct RebasedEntry<Tag: fmt::Debug + Send + Sync + 'static> {
    path: String,
    inner: EntryRef,
    tag: Tag,
}

impl<Tag: fmt::Debug + Send + Sync + 'static> RebasedEntry<Tag> {
    pub fn new(path: String, inner: EntryRef, tag: Tag) -> Self {
        Self { path, inner, tag }
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub fn inner_entry(&self) -> &EntryRef {
        &self.inner
    }
}

impl<Tag: fmt::Debug + Send + Sync + 'static> Entry for RebasedEntry<Tag> {
    fn path(&self) -> &str {
        &self.path
    }

    fn kind(&self) -> EntryType {
        self.inner.kind()
    }

    fn size(&self) -> i64 {
        self.inner.size()
    }

    fn mod_time(&self) -> i64 {
        self.inner.mod_time()
    }

    fn meta(&self) -> EntryMeta {
        self.inner.meta()
    }

    fn content(&self) -> Option<&dyn EntryContent> {
        self.inner.content()
    }

    fn inner(&self) -> Option<&EntryRef> {
        Some(&self.inner)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Marker;

    #[test]
    fn test_basic_root() {
        let root = BasicEntry::root(true);
        assert_eq!(root.path(), "");
        assert!(root.kind().is_dir());
        assert_eq!(root.size(), SIZE_UNKNOWN);
        assert_eq!(root.mod_time(), TIME_UNKNOWN);
        assert!(root.meta().can_write);
    }

    #[test]
    fn test_find_entry_unwraps_layers() {
        let base: EntryRef = Arc::new(BasicEntry::dir("x/y", EntryMeta::read_only()));
        let mid: EntryRef = Arc::new(RebasedEntry::new("y".into(), base, Marker));
        let top: EntryRef = Arc::new(RebasedEntry::new("d/y".into(), mid, ()));

        let found = find_entry::<BasicEntry>(top.as_ref()).unwrap();
        assert_eq!(found.path, "x/y");
        let marker = find_entry::<RebasedEntry<Marker>>(top.as_ref()).unwrap();
        assert_eq!(marker.path(), "y");
        assert!(find_entry::<RebasedEntry<u8>>(top.as_ref()).is_none());
    }

    #[tokio::test]
    async fn test_open_reader_without_content() {
        let entry = BasicEntry::dir("d", EntryMeta::read_only());
        let err = open_reader(&entry).await.err().unwrap();
        assert!(matches!(err, DriveError::NotAllowed { .. }));
    }

    #[test]
    fn test_snapshot_roundtrip_into_basic() {
        let entry = BasicEntry::dir("a", EntryMeta::read_write());
        let snap = snapshot(&entry);
        let back = BasicEntry::from(snap.clone());
        assert_eq!(back.path, "a");
        assert_eq!(snapshot(&back), snap);
    }
}
