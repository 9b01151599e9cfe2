//! Local filesystem drive.
//!
//! Provides access to a directory on disk, with path security to prevent
//! escaping the root through symlinks.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::fs;
use uuid::Uuid;

use crate::task::TaskCtx;
use crate::vfs::entry::{BasicEntry, BoxReader, Entry, EntryContent, EntryRef, find_entry};
use crate::vfs::error::{DriveError, DriveResult};
use crate::vfs::ops::Drive;
use crate::vfs::path;
use crate::vfs::stream::{COPY_BUFFER_SIZE, stage_to_temp};
use crate::vfs::tree::{CopyHooks, build_tree, copy_all};
use crate::vfs::types::{
    DriveMeta, EntryMeta, EntryType, PROVIDER_LOCAL_CHUNK, SIZE_UNKNOWN, TIME_UNKNOWN,
    UploadConfig, UploadOptions, system_time_millis,
};

/// Default size above which uploads are staged in chunks.
pub const DEFAULT_CHUNK_THRESHOLD: i64 = 5 * 1024 * 1024;

/// Entry of a [`LocalDrive`].
#[derive(Debug, Clone)]
pub struct LocalEntry {
    drive_id: Uuid,
    path: String,
    full: PathBuf,
    kind: EntryType,
    size: i64,
    mod_time: i64,
}

impl LocalEntry {
    /// Absolute location on disk.
    pub fn full_path(&self) -> &Path {
        &self.full
    }
}

impl Entry for LocalEntry {
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
        EntryMeta::read_write()
    }

    fn content(&self) -> Option<&dyn EntryContent> {
        if self.kind.is_file() { Some(self) } else { None }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl EntryContent for LocalEntry {
    async fn reader(&self) -> DriveResult<BoxReader> {
        let file = fs::File::open(&self.full).await?;
        Ok(Box::new(file))
    }
}

/// Local filesystem drive.
///
/// All operations are relative to `root`. For example, if `root` is
/// `/srv/files`, then `get("docs/a.txt")` stats `/srv/files/docs/a.txt`.
#[derive(Debug, Clone)]
pub struct LocalDrive {
    id: Uuid,
    root: PathBuf,
    chunk_threshold: i64,
    buffer_size: usize,
}

impl LocalDrive {
    /// Open a drive over an existing directory.
    ///
    /// The root is canonicalized at construction time to handle symlinks
    /// (e.g. macOS `/tmp` → `/private/tmp`).
    pub fn new(root: impl AsRef<Path>) -> DriveResult<Self> {
        let root = dunce::canonicalize(root.as_ref())?;
        if !root.is_dir() {
            return Err(DriveError::bad_request(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            root,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            buffer_size: COPY_BUFFER_SIZE,
        })
    }

    pub fn with_chunk_threshold(mut self, threshold: i64) -> Self {
        self.chunk_threshold = threshold;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a canonical drive path to an absolute path within the root.
    ///
    /// The deepest existing ancestor is canonicalized so a symlink cannot
    /// lead outside the root.
    fn resolve(&self, path: &str) -> DriveResult<PathBuf> {
        if path.is_empty() {
            return Ok(self.root.clone());
        }
        let full = self.root.join(path);

        let mut probe = full.as_path();
        while !probe.exists() {
            probe = match probe.parent() {
                Some(parent) => parent,
                None => break,
            };
        }
        let canonical = dunce::canonicalize(probe)?;
        if !canonical.starts_with(&self.root) {
            return Err(DriveError::permission_denied(format!(
                "{} is not under {}",
                canonical.display(),
                self.root.display()
            )));
        }
        Ok(full)
    }

    fn to_entry(&self, path: &str, full: PathBuf, meta: &std::fs::Metadata) -> EntryRef {
        let kind = if meta.is_dir() {
            EntryType::Dir
        } else {
            EntryType::File
        };
        Arc::new(LocalEntry {
            drive_id: self.id,
            path: path.to_string(),
            full,
            kind,
            size: if meta.is_dir() { SIZE_UNKNOWN } else { meta.len() as i64 },
            mod_time: meta
                .modified()
                .map(system_time_millis)
                .unwrap_or(TIME_UNKNOWN),
        })
    }

    async fn stat(&self, path: &str) -> DriveResult<EntryRef> {
        if path.is_empty() {
            return Ok(BasicEntry::root(true).into_ref());
        }
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full).await?;
        Ok(self.to_entry(path, full, &meta))
    }

    /// The entry as one of ours, or `None` when it came from another drive.
    fn own<'a>(&self, entry: &'a EntryRef) -> Option<&'a LocalEntry> {
        find_entry::<LocalEntry>(entry.as_ref()).filter(|e| e.drive_id == self.id)
    }

    /// Clear `dst` for a copy or move. Fails when it exists and `overwrite`
    /// is off.
    async fn prepare_target(&self, dst: &str, full: &Path, overwrite: bool) -> DriveResult<()> {
        if dst.is_empty() {
            return Err(DriveError::not_allowed("cannot replace the drive root"));
        }
        match fs::metadata(full).await {
            Ok(_) if !overwrite => Err(DriveError::not_allowed(format!("{dst} already exists"))),
            Ok(meta) if meta.is_dir() => Ok(fs::remove_dir_all(full).await?),
            Ok(_) => Ok(fs::remove_file(full).await?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent).await?;
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Per-file copy within one local drive.
struct LocalCopy<'a> {
    drive: &'a LocalDrive,
}

#[async_trait]
impl CopyHooks for LocalCopy<'_> {
    async fn copy_one(
        &self,
        ctx: &TaskCtx,
        src: &EntryRef,
        _dst: &dyn Drive,
        dst_path: &str,
    ) -> DriveResult<()> {
        ctx.check()?;
        let from = self
            .drive
            .own(src)
            .ok_or_else(|| DriveError::internal("copy source left the drive"))?;
        let to = self.drive.resolve(dst_path)?;
        let n = fs::copy(from.full_path(), &to).await?;
        ctx.progress(n as i64, false);
        Ok(())
    }
}

#[async_trait]
impl Drive for LocalDrive {
    fn meta(&self) -> DriveMeta {
        DriveMeta::writable()
    }

    async fn get(&self, path: &str) -> DriveResult<EntryRef> {
        self.stat(path).await
    }

    async fn list(&self, path: &str) -> DriveResult<Vec<EntryRef>> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full).await?;
        if !meta.is_dir() {
            return Err(DriveError::not_allowed(format!("{path} is not a directory")));
        }

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&full).await?;
        while let Some(child) = dir.next_entry().await? {
            let name = child.file_name().to_string_lossy().into_owned();
            let child_path = path::join(path, &name);
            // Follow symlinks, but skip dangling ones.
            let meta = match fs::metadata(child.path()).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            entries.push(self.to_entry(&child_path, child.path(), &meta));
        }
        Ok(entries)
    }

    async fn save(
        &self,
        ctx: &TaskCtx,
        path: &str,
        _size: i64,
        overwrite: bool,
        reader: BoxReader,
    ) -> DriveResult<EntryRef> {
        if path.is_empty() {
            return Err(DriveError::not_allowed("cannot write to the drive root"));
        }
        let full = self.resolve(path)?;
        match fs::metadata(&full).await {
            Ok(meta) if meta.is_dir() => {
                return Err(DriveError::not_allowed(format!("{path} is a directory")));
            }
            Ok(_) if !overwrite => {
                return Err(DriveError::not_allowed(format!("{path} already exists")));
            }
            _ => {}
        }
        let parent = full
            .parent()
            .ok_or_else(|| DriveError::internal(format!("{path} has no parent")))?;
        fs::create_dir_all(parent).await?;

        // Stage beside the target so the final rename is atomic.
        let staged = stage_to_temp(ctx, parent, reader, self.buffer_size).await?;
        staged.persist(&full)?;
        self.stat(path).await
    }

    async fn make_dir(&self, path: &str) -> DriveResult<EntryRef> {
        let full = self.resolve(path)?;
        match fs::metadata(&full).await {
            Ok(meta) if meta.is_dir() => return self.stat(path).await,
            Ok(_) => return Err(DriveError::not_allowed(format!("{path} is a file"))),
            Err(_) => {}
        }
        fs::create_dir_all(&full).await?;
        self.stat(path).await
    }

    async fn copy(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef> {
        let Some(local) = self.own(&src) else {
            return Err(DriveError::Unsupported);
        };
        let source = self.stat(&local.path).await?;
        if path::overlaps(dst, &local.path) {
            return Err(DriveError::not_allowed(format!("cannot copy {} to {dst}", local.path)));
        }

        if source.kind().is_file() {
            let to = self.resolve(dst)?;
            self.prepare_target(dst, &to, overwrite).await?;
            ctx.check()?;
            fs::copy(&local.full, &to).await?;
        } else {
            let tree = build_tree(ctx, self, source).await?;
            copy_all(ctx, &tree, self, dst, overwrite, &LocalCopy { drive: self }).await?;
        }
        self.stat(dst).await
    }

    async fn move_entry(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef> {
        let Some(local) = self.own(&src) else {
            return Err(DriveError::not_allowed("source entry belongs to another drive"));
        };
        if path::overlaps(dst, &local.path) {
            return Err(DriveError::not_allowed(format!("cannot move {} to {dst}", local.path)));
        }
        ctx.check()?;
        let from = self.resolve(&local.path)?;
        let to = self.resolve(dst)?;
        self.prepare_target(dst, &to, overwrite).await?;
        fs::rename(&from, &to).await?;
        self.stat(dst).await
    }

    async fn delete(&self, ctx: &TaskCtx, path: &str) -> DriveResult<()> {
        if path.is_empty() {
            return Err(DriveError::not_allowed("cannot delete the drive root"));
        }
        ctx.check()?;
        let full = self.resolve(path)?;
        let meta = fs::symlink_metadata(&full).await?;
        if meta.is_dir() {
            fs::remove_dir_all(&full).await?;
        } else {
            fs::remove_file(&full).await?;
        }
        Ok(())
    }

    async fn upload(
        &self,
        path: &str,
        size: i64,
        overwrite: bool,
        _opts: &UploadOptions,
    ) -> DriveResult<UploadConfig> {
        if !overwrite && fs::metadata(self.resolve(path)?).await.is_ok() {
            return Err(DriveError::not_allowed(format!("{path} already exists")));
        }
        if size > self.chunk_threshold {
            return Ok(UploadConfig::new(
                PROVIDER_LOCAL_CHUNK,
                json!({ "chunkSize": self.chunk_threshold }),
            ));
        }
        Ok(UploadConfig::local())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::entry::open_reader;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn bytes(data: &[u8]) -> BoxReader {
        Box::new(std::io::Cursor::new(data.to_vec()))
    }

    async fn read(drive: &LocalDrive, path: &str) -> Vec<u8> {
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
    async fn test_save_read_list() {
        let dir = TempDir::new().unwrap();
        let drive = LocalDrive::new(dir.path()).unwrap();
        let ctx = TaskCtx::new();

        let saved = drive
            .save(&ctx, "docs/a.txt", 5, false, bytes(b"hello"))
            .await
            .unwrap();
        assert_eq!(saved.path(), "docs/a.txt");
        assert_eq!(saved.size(), 5);
        assert!(saved.mod_time() > 0);
        assert_eq!(read(&drive, "docs/a.txt").await, b"hello");

        let listed = drive.list("docs").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path(), "docs/a.txt");
        assert_eq!(listed[0].size(), 5);

        // Only the saved file remains; the staging file was renamed away.
        assert_eq!(std::fs::read_dir(dir.path().join("docs")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_root_and_errors() {
        let dir = TempDir::new().unwrap();
        let drive = LocalDrive::new(dir.path()).unwrap();
        let ctx = TaskCtx::new();

        let root = drive.get("").await.unwrap();
        assert!(root.kind().is_dir());
        assert_eq!(root.size(), SIZE_UNKNOWN);

        assert!(drive.get("missing").await.unwrap_err().is_not_found());
        assert!(drive.list("missing").await.unwrap_err().is_not_found());

        drive.save(&ctx, "f", 1, false, bytes(b"x")).await.unwrap();
        assert!(matches!(
            drive.list("f").await.unwrap_err(),
            DriveError::NotAllowed { .. }
        ));
        assert!(matches!(
            drive.save(&ctx, "f", 1, false, bytes(b"y")).await.unwrap_err(),
            DriveError::NotAllowed { .. }
        ));
        assert!(matches!(
            drive.make_dir("f").await.unwrap_err(),
            DriveError::NotAllowed { .. }
        ));
        assert!(drive.delete(&ctx, "").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_blocked() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"s").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let drive = LocalDrive::new(dir.path()).unwrap();
        let err = drive.get("link/secret").await.unwrap_err();
        assert!(matches!(err, DriveError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_native_copy_and_move() {
        let dir = TempDir::new().unwrap();
        let drive = LocalDrive::new(dir.path()).unwrap();
        let ctx = TaskCtx::new();
        drive.save(&ctx, "src/a", 1, false, bytes(b"a")).await.unwrap();
        drive.save(&ctx, "src/sub/b", 2, false, bytes(b"bb")).await.unwrap();

        let src = drive.get("src").await.unwrap();
        let copied = drive.copy(&ctx, src, "copy", false).await.unwrap();
        assert!(copied.kind().is_dir());
        assert_eq!(read(&drive, "copy/sub/b").await, b"bb");

        let file = drive.get("src/a").await.unwrap();
        assert!(drive.copy(&ctx, file.clone(), "copy/a", false).await.is_err());
        drive.copy(&ctx, file, "copy/a", true).await.unwrap();

        let src = drive.get("src").await.unwrap();
        drive.move_entry(&ctx, src, "moved", false).await.unwrap();
        assert!(drive.get("src").await.unwrap_err().is_not_found());
        assert_eq!(read(&drive, "moved/a").await, b"a");
    }

    #[tokio::test]
    async fn test_copy_and_move_onto_ancestor_keep_source() {
        let dir = TempDir::new().unwrap();
        let drive = LocalDrive::new(dir.path()).unwrap();
        let ctx = TaskCtx::new();
        drive.save(&ctx, "a/b/f", 1, false, bytes(b"f")).await.unwrap();

        for overwrite in [false, true] {
            let src = drive.get("a/b").await.unwrap();
            let err = drive.move_entry(&ctx, src.clone(), "a", overwrite).await.unwrap_err();
            assert!(matches!(err, DriveError::NotAllowed { .. }));
            let err = drive.copy(&ctx, src, "a", overwrite).await.unwrap_err();
            assert!(matches!(err, DriveError::NotAllowed { .. }));
        }
        assert_eq!(std::fs::read(dir.path().join("a/b/f")).unwrap(), b"f");
    }

    #[tokio::test]
    async fn test_move_overwrites_directory() {
        let dir = TempDir::new().unwrap();
        let drive = LocalDrive::new(dir.path()).unwrap();
        let ctx = TaskCtx::new();
        drive.save(&ctx, "src/f", 1, false, bytes(b"s")).await.unwrap();
        drive.save(&ctx, "dst/old", 1, false, bytes(b"o")).await.unwrap();

        let src = drive.get("src").await.unwrap();
        drive.move_entry(&ctx, src, "dst", true).await.unwrap();
        assert_eq!(read(&drive, "dst/f").await, b"s");
        assert!(!dir.path().join("dst/old").exists());
        assert!(!dir.path().join("src").exists());
    }

    #[tokio::test]
    async fn test_foreign_entries() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = LocalDrive::new(dir_a.path()).unwrap();
        let b = LocalDrive::new(dir_b.path()).unwrap();
        let ctx = TaskCtx::new();
        a.save(&ctx, "f", 1, false, bytes(b"x")).await.unwrap();
        let src = a.get("f").await.unwrap();

        assert!(b.copy(&ctx, src.clone(), "f", false).await.unwrap_err().is_unsupported());
        assert!(matches!(
            b.move_entry(&ctx, src, "f", false).await.unwrap_err(),
            DriveError::NotAllowed { .. }
        ));
    }

    #[tokio::test]
    async fn test_upload_provider_by_size() {
        let dir = TempDir::new().unwrap();
        let drive = LocalDrive::new(dir.path()).unwrap();
        let opts = UploadOptions::new();
        let small = drive.upload("a", 10, false, &opts).await.unwrap();
        assert_eq!(small.provider, "local");
        let big = drive
            .upload("b", DEFAULT_CHUNK_THRESHOLD + 1, false, &opts)
            .await
            .unwrap();
        assert_eq!(big.provider, PROVIDER_LOCAL_CHUNK);
    }
}
