//! Dispatcher: routes `<drive>/<sub-path>` to the named drive.
//!
//! The drive map is replaced wholesale by [`Dispatcher::set_drives`]; callers
//! grab the current map and keep using it for the rest of their call, so a
//! reload never pulls a drive out from under a running operation.
//!
//! Path mounts alias `<path>/<name>` to another virtual path. Aliases are
//! rewritten before routing and may chain.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::entry::{BasicEntry, BoxReader, Entry, EntryRef, RebasedEntry};
use super::error::{DriveError, DriveResult};
use super::ops::{Drive, DriveRef};
use super::path;
use super::stream::{COPY_BUFFER_SIZE, default_temp_dir};
use super::tree::{CopyHooks, StagedCopy, build_tree, copy_all};
use super::types::{DriveMeta, EntryMeta, UploadConfig, UploadOptions};
use crate::task::TaskCtx;

static VIRTUAL_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/?([^/]+)(/(.*))?$").expect("virtual path regex"));

/// Longest alias chain followed before giving up.
const MAX_MOUNT_HOPS: usize = 8;

/// Makes `<path>/<name>` an alias of the virtual path `mount_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMount {
    pub path: String,
    pub name: String,
    pub mount_at: String,
}

impl PathMount {
    pub fn new(path: &str, name: &str, mount_at: &str) -> Self {
        Self {
            path: path::clean_path(path),
            name: name.to_string(),
            mount_at: path::clean_path(mount_at),
        }
    }

    /// The virtual path this mount occupies.
    pub fn alias(&self) -> String {
        path::join(&self.path, &self.name)
    }
}

/// Tags entries with the drive they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveName(pub String);

pub type DispatchedEntry = RebasedEntry<DriveName>;

type DriveMap = Arc<HashMap<String, DriveRef>>;

/// A virtual path resolved to a drive.
struct Route {
    name: String,
    drive: DriveRef,
    sub: String,
}

pub struct Dispatcher {
    drives: Mutex<DriveMap>,
    mounts: RwLock<Arc<Vec<PathMount>>>,
    temp_dir: PathBuf,
    buffer_size: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.drives.lock().keys().cloned().collect();
        names.sort();
        f.debug_struct("Dispatcher")
            .field("drives", &names)
            .field("mounts", &self.mounts.read().len())
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Create a dispatcher with no drives, staging copies in the default temp
    /// directory.
    pub fn new() -> Self {
        Self {
            drives: Mutex::new(Arc::new(HashMap::new())),
            mounts: RwLock::new(Arc::new(Vec::new())),
            temp_dir: default_temp_dir(),
            buffer_size: COPY_BUFFER_SIZE,
        }
    }

    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    // ========================================================================
    // Drive and mount tables
    // ========================================================================

    /// Replace the drive map. Drives that were dropped or replaced are
    /// disposed; disposal failures are logged.
    pub async fn set_drives(&self, drives: HashMap<String, DriveRef>) {
        let new = Arc::new(drives);
        let old = std::mem::replace(&mut *self.drives.lock(), new.clone());

        for (name, drive) in old.iter() {
            let kept = new.get(name).is_some_and(|d| Arc::ptr_eq(d, drive));
            if kept {
                continue;
            }
            tracing::debug!("disposing drive {}", name);
            if let Err(e) = drive.dispose().await {
                tracing::warn!("failed to dispose drive {}: {}", name, e);
            }
        }
    }

    /// Dispose every drive and empty the map.
    pub async fn shutdown(&self) {
        self.set_drives(HashMap::new()).await;
    }

    pub fn set_mounts(&self, mounts: Vec<PathMount>) {
        *self.mounts.write() = Arc::new(mounts);
    }

    pub fn mounts(&self) -> Arc<Vec<PathMount>> {
        self.mounts.read().clone()
    }

    /// Current drive names, sorted.
    pub fn drive_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.drives().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn drive(&self, name: &str) -> Option<DriveRef> {
        self.drives().get(name).cloned()
    }

    fn drives(&self) -> DriveMap {
        self.drives.lock().clone()
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Rewrite mount aliases in `path` until none applies.
    fn unalias(&self, path: &str) -> DriveResult<String> {
        let mounts = self.mounts();
        let mut current = path.to_string();
        for _ in 0..MAX_MOUNT_HOPS {
            let hit = mounts
                .iter()
                .filter_map(|m| {
                    let alias = m.alias();
                    path::strip_prefix(&current, &alias)
                        .map(|rest| (path::path_depth(&alias), path::join(&m.mount_at, rest)))
                })
                .max_by_key(|(depth, _)| *depth);
            match hit {
                Some((_, target)) => current = target,
                None => return Ok(current),
            }
        }
        Err(DriveError::bad_request(format!(
            "too many mount hops resolving {path}"
        )))
    }

    /// Resolve a canonical virtual path. `Ok(None)` is the virtual root.
    fn route(&self, path: &str) -> DriveResult<Option<Route>> {
        let target = self.unalias(path)?;
        if target.is_empty() {
            return Ok(None);
        }
        let caps = VIRTUAL_PATH
            .captures(&target)
            .ok_or_else(|| DriveError::not_found(path))?;
        let name = caps.get(1).map_or("", |m| m.as_str()).to_string();
        let sub = caps.get(3).map_or("", |m| m.as_str()).to_string();
        let drive = self
            .drive(&name)
            .ok_or_else(|| DriveError::not_found(path))?;
        Ok(Some(Route { name, drive, sub }))
    }

    fn route_drive(&self, path: &str) -> DriveResult<Route> {
        self.route(path)?
            .ok_or_else(|| DriveError::not_allowed("the virtual root is read-only"))
    }

    fn dispatched(name: &str, path: String, entry: EntryRef) -> EntryRef {
        Arc::new(RebasedEntry::new(path, entry, DriveName(name.to_string())))
    }

    /// Synthetic directories for mounts under `path`.
    fn mount_entries(&self, path: &str) -> Vec<EntryRef> {
        self.mounts()
            .iter()
            .filter(|m| m.path == path)
            .map(|m| BasicEntry::dir(m.alias(), EntryMeta::read_only()).into_ref())
            .collect()
    }

    fn list_root(&self) -> Vec<EntryRef> {
        let mut entries: Vec<EntryRef> = self
            .drives()
            .iter()
            .map(|(name, drive)| {
                let meta = EntryMeta {
                    can_read: true,
                    can_write: drive.meta().can_write,
                    ..Default::default()
                };
                BasicEntry::dir(name.clone(), meta).into_ref()
            })
            .collect();
        entries.extend(self.mount_entries(""));
        entries
    }

    // ========================================================================
    // Copy fallback
    // ========================================================================

    /// Stream `src` to `dst` through temp files.
    async fn copy_through_temp(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst_route: &Route,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef> {
        if !overwrite && dst_route.drive.get_opt(&dst_route.sub).await?.is_some() {
            return Err(DriveError::not_allowed(format!("{dst} already exists")));
        }
        let hooks = StagedCopy::new(&self.temp_dir).with_buffer_size(self.buffer_size);
        if src.kind().is_file() {
            hooks
                .copy_one(ctx, &src, dst_route.drive.as_ref(), &dst_route.sub)
                .await?;
        } else {
            let tree = build_tree(ctx, self, src).await?;
            copy_all(
                ctx,
                &tree,
                dst_route.drive.as_ref(),
                &dst_route.sub,
                overwrite,
                &hooks,
            )
            .await?;
        }
        let entry = dst_route.drive.get(&dst_route.sub).await?;
        Ok(Self::dispatched(&dst_route.name, dst.to_string(), entry))
    }
}

#[async_trait]
impl Drive for Dispatcher {
    fn meta(&self) -> DriveMeta {
        DriveMeta::default()
    }

    #[tracing::instrument(skip(self), name = "dispatcher.get")]
    async fn get(&self, path: &str) -> DriveResult<EntryRef> {
        let path = path::checked_path(path)?;
        match self.route(&path)? {
            None => Ok(BasicEntry::root(false).into_ref()),
            Some(route) => {
                let entry = route.drive.get(&route.sub).await?;
                Ok(Self::dispatched(&route.name, path, entry))
            }
        }
    }

    #[tracing::instrument(skip(self), name = "dispatcher.list")]
    async fn list(&self, path: &str) -> DriveResult<Vec<EntryRef>> {
        let path = path::checked_path(path)?;
        let Some(route) = self.route(&path)? else {
            return Ok(self.list_root());
        };
        let mounted = self.mount_entries(&path);
        let children = match route.drive.list(&route.sub).await {
            Ok(children) => children,
            Err(e) if e.is_not_found() && !mounted.is_empty() => Vec::new(),
            Err(e) => return Err(e),
        };
        let mut entries: Vec<EntryRef> = children
            .into_iter()
            .map(|child| {
                let child_path = path::join(&path, child.name());
                Self::dispatched(&route.name, child_path, child)
            })
            .collect();
        entries.extend(mounted);
        Ok(entries)
    }

    #[tracing::instrument(skip(self, ctx, reader), name = "dispatcher.save")]
    async fn save(
        &self,
        ctx: &TaskCtx,
        path: &str,
        size: i64,
        overwrite: bool,
        reader: BoxReader,
    ) -> DriveResult<EntryRef> {
        let path = path::checked_path(path)?;
        let route = self.route_drive(&path)?;
        let entry = route
            .drive
            .save(ctx, &route.sub, size, overwrite, reader)
            .await?;
        Ok(Self::dispatched(&route.name, path, entry))
    }

    #[tracing::instrument(skip(self), name = "dispatcher.make_dir")]
    async fn make_dir(&self, path: &str) -> DriveResult<EntryRef> {
        let path = path::checked_path(path)?;
        let route = self.route_drive(&path)?;
        let entry = route.drive.make_dir(&route.sub).await?;
        Ok(Self::dispatched(&route.name, path, entry))
    }

    #[tracing::instrument(skip(self, ctx, src), fields(src = %src.path()), name = "dispatcher.copy")]
    async fn copy(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef> {
        let dst = path::checked_path(dst)?;
        if path::overlaps(&dst, src.path()) {
            return Err(DriveError::not_allowed(format!("cannot copy {} to {dst}", src.path())));
        }
        let dst_route = self.route_drive(&dst)?;

        let same_drive = src
            .as_any()
            .downcast_ref::<DispatchedEntry>()
            .filter(|own| own.tag().0 == dst_route.name)
            .map(|own| own.inner_entry().clone());
        if let Some(inner) = same_drive {
            match dst_route
                .drive
                .copy(ctx, inner, &dst_route.sub, overwrite)
                .await
            {
                Ok(entry) => return Ok(Self::dispatched(&dst_route.name, dst, entry)),
                Err(e) if e.is_unsupported() => {
                    tracing::debug!("{} has no native copy, streaming", dst_route.name);
                }
                Err(e) => return Err(e),
            }
        }
        self.copy_through_temp(ctx, src, &dst_route, &dst, overwrite)
            .await
    }

    #[tracing::instrument(skip(self, ctx, src), fields(src = %src.path()), name = "dispatcher.move")]
    async fn move_entry(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef> {
        let dst = path::checked_path(dst)?;
        if path::overlaps(&dst, src.path()) {
            return Err(DriveError::not_allowed(format!("cannot move {} to {dst}", src.path())));
        }
        let dst_route = self.route_drive(&dst)?;
        let inner = match src.as_any().downcast_ref::<DispatchedEntry>() {
            Some(own) if own.tag().0 == dst_route.name => own.inner_entry().clone(),
            _ => {
                return Err(DriveError::not_allowed(format!(
                    "cannot move {} across drives",
                    src.path()
                )));
            }
        };
        let entry = dst_route
            .drive
            .move_entry(ctx, inner, &dst_route.sub, overwrite)
            .await?;
        Ok(Self::dispatched(&dst_route.name, dst, entry))
    }

    #[tracing::instrument(skip(self, ctx), name = "dispatcher.delete")]
    async fn delete(&self, ctx: &TaskCtx, path: &str) -> DriveResult<()> {
        let path = path::checked_path(path)?;
        let route = self.route_drive(&path)?;
        route.drive.delete(ctx, &route.sub).await
    }

    async fn upload(
        &self,
        path: &str,
        size: i64,
        overwrite: bool,
        opts: &UploadOptions,
    ) -> DriveResult<UploadConfig> {
        let path = path::checked_path(path)?;
        let route = self.route_drive(&path)?;
        route.drive.upload(&route.sub, size, overwrite, opts).await
    }

    async fn dispose(&self) -> DriveResult<()> {
        self.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::backends::MemoryDrive;
    use crate::vfs::entry::open_reader;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    fn bytes(data: &[u8]) -> BoxReader {
        Box::new(std::io::Cursor::new(data.to_vec()))
    }

    async fn read(drive: &dyn Drive, path: &str) -> Vec<u8> {
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

    async fn dispatcher() -> (Dispatcher, Arc<MemoryDrive>, Arc<MemoryDrive>) {
        let a = Arc::new(MemoryDrive::new());
        let b = Arc::new(MemoryDrive::new());
        let d = Dispatcher::new().with_temp_dir(std::env::temp_dir().join("drivehub-test"));
        let mut drives: HashMap<String, DriveRef> = HashMap::new();
        drives.insert("A".into(), a.clone());
        drives.insert("B".into(), b.clone());
        d.set_drives(drives).await;
        (d, a, b)
    }

    #[tokio::test]
    async fn test_routing() {
        let (d, a, _) = dispatcher().await;
        a.save(&TaskCtx::new(), "x/y", 1, false, bytes(b"1"))
            .await
            .unwrap();

        let entry = d.get("A/x/y").await.unwrap();
        assert_eq!(entry.path(), "A/x/y");
        assert_eq!(d.get("/A/x/y").await.unwrap().path(), "A/x/y");
        assert!(d.get("C/x").await.unwrap_err().is_not_found());

        let mut names: Vec<_> = d
            .list("")
            .await
            .unwrap()
            .iter()
            .map(|e| e.path().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["A", "B"]);

        let root = d.get("A").await.unwrap();
        assert_eq!(root.path(), "A");
        assert!(root.kind().is_dir());
    }

    #[tokio::test]
    async fn test_list_prefixes_drive_name() {
        let (d, a, _) = dispatcher().await;
        a.save(&TaskCtx::new(), "dir/f", 1, false, bytes(b"1"))
            .await
            .unwrap();
        let listed = d.list("A/dir").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path(), "A/dir/f");
    }

    #[tokio::test]
    async fn test_virtual_root_is_read_only() {
        let (d, _, _) = dispatcher().await;
        let err = d.delete(&TaskCtx::new(), "").await.unwrap_err();
        assert!(matches!(err, DriveError::NotAllowed { .. }));
        assert!(!d.get("").await.unwrap().meta().can_write);
    }

    #[tokio::test]
    async fn test_cross_drive_copy_streams() {
        let (d, _, b) = dispatcher().await;
        let ctx = TaskCtx::new();
        d.save(&ctx, "B/file.txt", 5, false, bytes(b"hello"))
            .await
            .unwrap();

        let src = d.get("B/file.txt").await.unwrap();
        let copied = d.copy(&ctx, src, "A/new.txt", false).await.unwrap();
        assert_eq!(copied.path(), "A/new.txt");
        assert_eq!(copied.size(), 5);
        assert_eq!(read(&d, "A/new.txt").await, b"hello");
        assert!(b.get("file.txt").await.is_ok());
    }

    #[tokio::test]
    async fn test_same_drive_copy_falls_back_when_unsupported() {
        let (d, _, _) = dispatcher().await;
        let ctx = TaskCtx::new();
        d.save(&ctx, "A/dir/one", 1, false, bytes(b"1")).await.unwrap();
        d.save(&ctx, "A/dir/sub/two", 1, false, bytes(b"2"))
            .await
            .unwrap();

        let src = d.get("A/dir").await.unwrap();
        d.copy(&ctx, src, "A/copy", false).await.unwrap();
        assert_eq!(read(&d, "A/copy/one").await, b"1");
        assert_eq!(read(&d, "A/copy/sub/two").await, b"2");
    }

    #[tokio::test]
    async fn test_copy_refuses_existing_destination() {
        let (d, _, _) = dispatcher().await;
        let ctx = TaskCtx::new();
        d.save(&ctx, "A/f", 1, false, bytes(b"1")).await.unwrap();
        d.save(&ctx, "B/f", 1, false, bytes(b"2")).await.unwrap();
        let src = d.get("A/f").await.unwrap();
        let err = d.copy(&ctx, src.clone(), "B/f", false).await.unwrap_err();
        assert!(matches!(err, DriveError::NotAllowed { .. }));
        d.copy(&ctx, src, "B/f", true).await.unwrap();
        assert_eq!(read(&d, "B/f").await, b"1");
    }

    #[tokio::test]
    async fn test_move_within_and_across_drives() {
        let (d, _, _) = dispatcher().await;
        let ctx = TaskCtx::new();
        d.save(&ctx, "A/f", 1, false, bytes(b"1")).await.unwrap();

        let src = d.get("A/f").await.unwrap();
        let err = d.move_entry(&ctx, src.clone(), "B/f", false).await.unwrap_err();
        assert!(matches!(err, DriveError::NotAllowed { .. }));

        let moved = d.move_entry(&ctx, src, "A/g", false).await.unwrap();
        assert_eq!(moved.path(), "A/g");
        assert!(d.get("A/f").await.unwrap_err().is_not_found());
    }

    struct CountingDrive {
        inner: MemoryDrive,
        disposed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Drive for CountingDrive {
        fn meta(&self) -> DriveMeta {
            self.inner.meta()
        }
        async fn get(&self, path: &str) -> DriveResult<EntryRef> {
            self.inner.get(path).await
        }
        async fn list(&self, path: &str) -> DriveResult<Vec<EntryRef>> {
            self.inner.list(path).await
        }
        async fn save(
            &self,
            ctx: &TaskCtx,
            path: &str,
            size: i64,
            overwrite: bool,
            reader: BoxReader,
        ) -> DriveResult<EntryRef> {
            self.inner.save(ctx, path, size, overwrite, reader).await
        }
        async fn make_dir(&self, path: &str) -> DriveResult<EntryRef> {
            self.inner.make_dir(path).await
        }
        async fn copy(
            &self,
            ctx: &TaskCtx,
            src: EntryRef,
            dst: &str,
            overwrite: bool,
        ) -> DriveResult<EntryRef> {
            self.inner.copy(ctx, src, dst, overwrite).await
        }
        async fn move_entry(
            &self,
            ctx: &TaskCtx,
            src: EntryRef,
            dst: &str,
            overwrite: bool,
        ) -> DriveResult<EntryRef> {
            self.inner.move_entry(ctx, src, dst, overwrite).await
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
        async fn dispose(&self) -> DriveResult<()> {
            self.disposed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_set_drives_disposes_superseded() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let kept: DriveRef = Arc::new(CountingDrive {
            inner: MemoryDrive::new(),
            disposed: disposed.clone(),
        });
        let dropped: DriveRef = Arc::new(CountingDrive {
            inner: MemoryDrive::new(),
            disposed: disposed.clone(),
        });

        let d = Dispatcher::new();
        d.set_drives(HashMap::from([
            ("kept".to_string(), kept.clone()),
            ("dropped".to_string(), dropped),
        ]))
        .await;
        d.set_drives(HashMap::from([("kept".to_string(), kept)]))
            .await;
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert_eq!(d.drive_names(), vec!["kept"]);

        d.shutdown().await;
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mounts_alias_and_list() {
        let (d, _, b) = dispatcher().await;
        let ctx = TaskCtx::new();
        b.save(&ctx, "shared/doc", 3, false, bytes(b"doc"))
            .await
            .unwrap();
        d.set_mounts(vec![PathMount::new("A/links", "shared", "B/shared")]);

        // The mount point shows up even though A/links does not exist.
        let listed = d.list("A/links").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path(), "A/links/shared");

        let entry = d.get("A/links/shared/doc").await.unwrap();
        assert_eq!(entry.path(), "A/links/shared/doc");
        assert_eq!(read(&d, "A/links/shared/doc").await, b"doc");

        let children = d.list("A/links/shared").await.unwrap();
        assert_eq!(children[0].path(), "A/links/shared/doc");
    }

    #[tokio::test]
    async fn test_mount_loop_is_rejected() {
        let (d, _, _) = dispatcher().await;
        d.set_mounts(vec![
            PathMount::new("A", "x", "B/y"),
            PathMount::new("B", "y", "A/x"),
        ]);
        let err = d.get("A/x").await.unwrap_err();
        assert!(matches!(err, DriveError::BadRequest(_)));
    }
}
