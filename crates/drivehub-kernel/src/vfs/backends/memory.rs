//! In-memory drive.
//!
//! Ephemeral storage for scratch space and tests. It has no native copy, so
//! copies onto it always go through the dispatcher's streaming fallback.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::task::TaskCtx;
use crate::vfs::entry::{BasicEntry, BoxReader, Entry, EntryContent, EntryRef, find_entry};
use crate::vfs::error::{DriveError, DriveResult};
use crate::vfs::ops::Drive;
use crate::vfs::path;
use crate::vfs::stream::{COPY_BUFFER_SIZE, copy_stream};
use crate::vfs::types::{
    DriveMeta, EntryMeta, EntryType, SIZE_UNKNOWN, UploadConfig, UploadOptions, now_millis,
};

#[derive(Debug, Clone)]
enum Node {
    Dir { mod_time: i64 },
    File { data: Arc<Vec<u8>>, mod_time: i64 },
}

impl Node {
    fn is_dir(&self) -> bool {
        matches!(self, Node::Dir { .. })
    }
}

/// Entry of a [`MemoryDrive`].
pub struct MemoryEntry {
    drive_id: Uuid,
    path: String,
    node: Node,
}

impl fmt::Debug for MemoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEntry")
            .field("path", &self.path)
            .field("kind", &self.kind())
            .field("size", &self.size())
            .finish()
    }
}

impl Entry for MemoryEntry {
    fn path(&self) -> &str {
        &self.path
    }

    fn kind(&self) -> EntryType {
        if self.node.is_dir() {
            EntryType::Dir
        } else {
            EntryType::File
        }
    }

    fn size(&self) -> i64 {
        match &self.node {
            Node::Dir { .. } => SIZE_UNKNOWN,
            Node::File { data, .. } => data.len() as i64,
        }
    }

    fn mod_time(&self) -> i64 {
        match &self.node {
            Node::Dir { mod_time } | Node::File { mod_time, .. } => *mod_time,
        }
    }

    fn meta(&self) -> EntryMeta {
        EntryMeta::read_write()
    }

    fn content(&self) -> Option<&dyn EntryContent> {
        match self.node {
            Node::File { .. } => Some(self),
            Node::Dir { .. } => None,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl EntryContent for MemoryEntry {
    async fn reader(&self) -> DriveResult<BoxReader> {
        match &self.node {
            Node::File { data, .. } => Ok(Box::new(std::io::Cursor::new(data.as_ref().clone()))),
            Node::Dir { .. } => Err(DriveError::not_allowed(format!("{} is a directory", self.path))),
        }
    }
}

/// In-memory drive.
///
/// The tree is a sorted map from canonical path to node; the root `""` is
/// always present.
pub struct MemoryDrive {
    id: Uuid,
    nodes: RwLock<BTreeMap<String, Node>>,
}

impl fmt::Debug for MemoryDrive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDrive")
            .field("id", &self.id)
            .field("nodes", &self.nodes.read().len())
            .finish()
    }
}

impl Default for MemoryDrive {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDrive {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(String::new(), Node::Dir { mod_time: now_millis() });
        Self {
            id: Uuid::new_v4(),
            nodes: RwLock::new(nodes),
        }
    }

    fn entry(&self, path: &str, node: Node) -> EntryRef {
        if path.is_empty() {
            return BasicEntry::root(true).into_ref();
        }
        Arc::new(MemoryEntry {
            drive_id: self.id,
            path: path.to_string(),
            node,
        })
    }

    /// Create every missing ancestor directory of `path` (exclusive).
    fn ensure_parents(nodes: &mut BTreeMap<String, Node>, path: &str) -> DriveResult<()> {
        let parent = path::parent(path);
        for ancestor in path::ancestors(parent) {
            match nodes.get(&ancestor) {
                Some(Node::Dir { .. }) => {}
                Some(Node::File { .. }) => {
                    return Err(DriveError::not_allowed(format!("{ancestor} is a file")));
                }
                None => {
                    nodes.insert(ancestor, Node::Dir { mod_time: now_millis() });
                }
            }
        }
        Ok(())
    }

    /// Keys of `path` and everything beneath it.
    fn subtree_keys(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
        nodes
            .range(path.to_string()..)
            .take_while(|(k, _)| k.starts_with(path))
            .filter(|(k, _)| path::is_self_or_descendant(k, path))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

#[async_trait]
impl Drive for MemoryDrive {
    fn meta(&self) -> DriveMeta {
        DriveMeta::writable()
    }

    async fn get(&self, path: &str) -> DriveResult<EntryRef> {
        let node = self
            .nodes
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| DriveError::not_found(path))?;
        Ok(self.entry(path, node))
    }

    async fn list(&self, path: &str) -> DriveResult<Vec<EntryRef>> {
        let nodes = self.nodes.read();
        match nodes.get(path) {
            None => return Err(DriveError::not_found(path)),
            Some(Node::File { .. }) => {
                return Err(DriveError::not_allowed(format!("{path} is not a directory")));
            }
            Some(Node::Dir { .. }) => {}
        }
        let depth = path::path_depth(path) + 1;
        Ok(nodes
            .iter()
            .filter(|(k, _)| {
                !k.is_empty()
                    && path::path_depth(k) == depth
                    && path::is_self_or_descendant(k, path)
            })
            .map(|(k, n)| self.entry(k, n.clone()))
            .collect())
    }

    async fn save(
        &self,
        ctx: &TaskCtx,
        path: &str,
        _size: i64,
        overwrite: bool,
        mut reader: BoxReader,
    ) -> DriveResult<EntryRef> {
        if path.is_empty() {
            return Err(DriveError::not_allowed("cannot write to the drive root"));
        }
        match self.nodes.read().get(path) {
            Some(Node::Dir { .. }) => {
                return Err(DriveError::not_allowed(format!("{path} is a directory")));
            }
            Some(_) if !overwrite => {
                return Err(DriveError::not_allowed(format!("{path} already exists")));
            }
            _ => {}
        }

        let mut data = Vec::new();
        copy_stream(ctx, &mut reader, &mut data, COPY_BUFFER_SIZE).await?;

        let node = Node::File {
            data: Arc::new(data),
            mod_time: now_millis(),
        };
        let mut nodes = self.nodes.write();
        if !overwrite && nodes.contains_key(path) {
            return Err(DriveError::not_allowed(format!("{path} already exists")));
        }
        Self::ensure_parents(&mut nodes, path)?;
        nodes.insert(path.to_string(), node.clone());
        Ok(self.entry(path, node))
    }

    async fn make_dir(&self, path: &str) -> DriveResult<EntryRef> {
        let mut nodes = self.nodes.write();
        match nodes.get(path) {
            Some(node @ Node::Dir { .. }) => return Ok(self.entry(path, node.clone())),
            Some(Node::File { .. }) => {
                return Err(DriveError::not_allowed(format!("{path} is a file")));
            }
            None => {}
        }
        Self::ensure_parents(&mut nodes, path)?;
        let node = Node::Dir { mod_time: now_millis() };
        nodes.insert(path.to_string(), node.clone());
        Ok(self.entry(path, node))
    }

    async fn copy(
        &self,
        _ctx: &TaskCtx,
        _src: EntryRef,
        _dst: &str,
        _overwrite: bool,
    ) -> DriveResult<EntryRef> {
        Err(DriveError::Unsupported)
    }

    async fn move_entry(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef> {
        ctx.check()?;
        let from = match find_entry::<MemoryEntry>(src.as_ref()) {
            Some(e) if e.drive_id == self.id => e.path.clone(),
            _ => return Err(DriveError::not_allowed("source entry belongs to another drive")),
        };
        if path::overlaps(dst, &from) {
            return Err(DriveError::not_allowed(format!("cannot move {from} into {dst}")));
        }

        let mut nodes = self.nodes.write();
        if !nodes.contains_key(&from) {
            return Err(DriveError::not_found(from));
        }
        if nodes.contains_key(dst) {
            if !overwrite {
                return Err(DriveError::not_allowed(format!("{dst} already exists")));
            }
            for key in Self::subtree_keys(&nodes, dst) {
                nodes.remove(&key);
            }
        }
        Self::ensure_parents(&mut nodes, dst)?;

        for key in Self::subtree_keys(&nodes, &from) {
            if let Some(node) = nodes.remove(&key) {
                let rest = path::strip_prefix(&key, &from).unwrap_or_default();
                nodes.insert(path::join(dst, rest), node);
            }
        }
        let node = nodes
            .get(dst)
            .cloned()
            .ok_or_else(|| DriveError::internal(format!("{dst} vanished during move")))?;
        Ok(self.entry(dst, node))
    }

    async fn delete(&self, ctx: &TaskCtx, path: &str) -> DriveResult<()> {
        ctx.check()?;
        if path.is_empty() {
            return Err(DriveError::not_allowed("cannot delete the drive root"));
        }
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(path) {
            return Err(DriveError::not_found(path));
        }
        for key in Self::subtree_keys(&nodes, path) {
            nodes.remove(&key);
        }
        Ok(())
    }

    async fn upload(
        &self,
        _path: &str,
        _size: i64,
        _overwrite: bool,
        _opts: &UploadOptions,
    ) -> DriveResult<UploadConfig> {
        Ok(UploadConfig::local())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::entry::open_reader;
    use tokio::io::AsyncReadExt;

    fn bytes(data: &[u8]) -> BoxReader {
        Box::new(std::io::Cursor::new(data.to_vec()))
    }

    async fn read(drive: &MemoryDrive, path: &str) -> Vec<u8> {
        let entry = drive.get(path).await.unwrap();
        let mut out = Vec::new();
        open_reader(entry.as_ref())
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        out
    }

    #[tokio::test]
    async fn test_root_entry() {
        let drive = MemoryDrive::new();
        let root = drive.get("").await.unwrap();
        assert_eq!(root.path(), "");
        assert!(root.kind().is_dir());
        assert_eq!(root.size(), SIZE_UNKNOWN);
    }

    #[tokio::test]
    async fn test_save_and_read() {
        let drive = MemoryDrive::new();
        let ctx = TaskCtx::new();
        let entry = drive
            .save(&ctx, "a/b.txt", 5, false, bytes(b"hello"))
            .await
            .unwrap();
        assert_eq!(entry.path(), "a/b.txt");
        assert_eq!(entry.size(), 5);
        assert_eq!(read(&drive, "a/b.txt").await, b"hello");
        assert!(drive.get("a").await.unwrap().kind().is_dir());
    }

    #[tokio::test]
    async fn test_save_without_overwrite() {
        let drive = MemoryDrive::new();
        let ctx = TaskCtx::new();
        drive.save(&ctx, "f", 1, false, bytes(b"1")).await.unwrap();
        let err = drive.save(&ctx, "f", 1, false, bytes(b"2")).await.unwrap_err();
        assert!(matches!(err, DriveError::NotAllowed { .. }));
        drive.save(&ctx, "f", 1, true, bytes(b"2")).await.unwrap();
        assert_eq!(read(&drive, "f").await, b"2");

        drive.make_dir("d").await.unwrap();
        assert!(drive.save(&ctx, "d", 1, true, bytes(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_list_direct_children() {
        let drive = MemoryDrive::new();
        let ctx = TaskCtx::new();
        drive.save(&ctx, "d/x", 1, false, bytes(b"x")).await.unwrap();
        drive.save(&ctx, "d/sub/y", 1, false, bytes(b"y")).await.unwrap();
        drive.save(&ctx, "dd", 1, false, bytes(b"z")).await.unwrap();

        let mut names: Vec<_> = drive
            .list("d")
            .await
            .unwrap()
            .iter()
            .map(|e| e.path().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["d/sub", "d/x"]);

        let top: Vec<_> = drive.list("").await.unwrap().iter().map(|e| e.path().to_string()).collect();
        assert_eq!(top, vec!["d", "dd"]);

        assert!(drive.list("missing").await.unwrap_err().is_not_found());
        assert!(matches!(
            drive.list("dd").await.unwrap_err(),
            DriveError::NotAllowed { .. }
        ));
    }

    #[tokio::test]
    async fn test_make_dir_idempotent() {
        let drive = MemoryDrive::new();
        let ctx = TaskCtx::new();
        drive.make_dir("a/b").await.unwrap();
        drive.make_dir("a/b").await.unwrap();
        drive.save(&ctx, "f", 1, false, bytes(b"x")).await.unwrap();
        assert!(drive.make_dir("f").await.is_err());
        assert!(drive.make_dir("f/g").await.is_err());
    }

    #[tokio::test]
    async fn test_move_subtree() {
        let drive = MemoryDrive::new();
        let ctx = TaskCtx::new();
        drive.save(&ctx, "src/a", 1, false, bytes(b"a")).await.unwrap();
        drive.save(&ctx, "src/sub/b", 1, false, bytes(b"b")).await.unwrap();

        let src = drive.get("src").await.unwrap();
        let moved = drive.move_entry(&ctx, src, "dst", false).await.unwrap();
        assert_eq!(moved.path(), "dst");
        assert!(drive.get("src").await.unwrap_err().is_not_found());
        assert_eq!(read(&drive, "dst/sub/b").await, b"b");
    }

    #[tokio::test]
    async fn test_move_onto_ancestor_keeps_source() {
        let drive = MemoryDrive::new();
        let ctx = TaskCtx::new();
        drive.save(&ctx, "a/b/f", 1, false, bytes(b"f")).await.unwrap();

        for overwrite in [false, true] {
            let src = drive.get("a/b").await.unwrap();
            let err = drive.move_entry(&ctx, src, "a", overwrite).await.unwrap_err();
            assert!(matches!(err, DriveError::NotAllowed { .. }));
        }
        let src = drive.get("a/b").await.unwrap();
        assert!(drive.move_entry(&ctx, src, "", true).await.is_err());
        assert_eq!(read(&drive, "a/b/f").await, b"f");
    }

    #[tokio::test]
    async fn test_move_overwrites_directory() {
        let drive = MemoryDrive::new();
        let ctx = TaskCtx::new();
        drive.save(&ctx, "src/f", 1, false, bytes(b"s")).await.unwrap();
        drive.save(&ctx, "dst/old", 1, false, bytes(b"o")).await.unwrap();

        let src = drive.get("src").await.unwrap();
        drive.move_entry(&ctx, src, "dst", true).await.unwrap();
        assert_eq!(read(&drive, "dst/f").await, b"s");
        assert!(drive.get("dst/old").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_move_rejects_foreign_entry() {
        let a = MemoryDrive::new();
        let b = MemoryDrive::new();
        let ctx = TaskCtx::new();
        a.save(&ctx, "f", 1, false, bytes(b"x")).await.unwrap();
        let src = a.get("f").await.unwrap();
        let err = b.move_entry(&ctx, src, "f", false).await.unwrap_err();
        assert!(matches!(err, DriveError::NotAllowed { .. }));
    }

    #[tokio::test]
    async fn test_copy_unsupported() {
        let drive = MemoryDrive::new();
        let ctx = TaskCtx::new();
        drive.save(&ctx, "f", 1, false, bytes(b"x")).await.unwrap();
        let src = drive.get("f").await.unwrap();
        assert!(drive.copy(&ctx, src, "g", false).await.unwrap_err().is_unsupported());
    }

    #[tokio::test]
    async fn test_delete_subtree() {
        let drive = MemoryDrive::new();
        let ctx = TaskCtx::new();
        drive.save(&ctx, "d/a", 1, false, bytes(b"a")).await.unwrap();
        drive.save(&ctx, "d/b/c", 1, false, bytes(b"c")).await.unwrap();
        drive.save(&ctx, "dx", 1, false, bytes(b"x")).await.unwrap();
        drive.delete(&ctx, "d").await.unwrap();
        assert!(drive.get("d/b/c").await.unwrap_err().is_not_found());
        assert!(drive.get("dx").await.is_ok());
        assert!(drive.delete(&ctx, "d").await.unwrap_err().is_not_found());
        assert!(drive.delete(&ctx, "").await.is_err());
    }
}
