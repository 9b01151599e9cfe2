//! Object-store drive.
//!
//! Maps the drive tree onto flat keys under an optional key prefix. A file
//! `a/b` is the object `a/b`; a directory is either an explicit zero-byte
//! marker `a/` or implied by any key beneath it.

mod client;

pub use client::{
    CompletedPart, DeleteFailure, MemoryObjectClient, ObjectClient, ObjectError, ObjectInfo,
    ObjectListing, ObjectResult,
};

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::task::TaskCtx;
use crate::vfs::entry::{BasicEntry, BoxReader, Entry, EntryContent, EntryRef, find_entry};
use crate::vfs::error::{DriveError, DriveResult};
use crate::vfs::ops::Drive;
use crate::vfs::path;
use crate::vfs::stream::{COPY_BUFFER_SIZE, stage_to_temp};
use crate::vfs::tree::{CopyHooks, build_tree, copy_all, flatten_post_order};
use crate::vfs::types::{
    ContentUrl, DriveMeta, EntryMeta, EntryType, PROVIDER_S3, PROVIDER_S3_MULTIPART,
    SIZE_UNKNOWN, TIME_UNKNOWN, UploadConfig, UploadOptions,
};

/// Largest batch a delete request may carry.
pub const DELETE_BATCH: usize = 1000;

const LIST_PAGE: usize = 1000;
const DELIMITER: &str = "/";

/// Object drive settings.
#[derive(Debug, Clone)]
pub struct ObjectDriveOptions {
    /// Key prefix inside the bucket, without slashes at either end.
    pub prefix: String,
    /// Uploads above this size are multipart; also the part size.
    pub chunk_threshold: i64,
    /// Lifetime of presigned URLs.
    pub presign_expiry: Duration,
    /// Downloads must be proxied rather than fetched from the store directly.
    pub proxy: bool,
    /// Staging directory for saves of unknown length.
    pub temp_dir: std::path::PathBuf,
}

impl Default for ObjectDriveOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            chunk_threshold: 5 * 1024 * 1024,
            presign_expiry: Duration::from_secs(3600),
            proxy: false,
            temp_dir: crate::vfs::stream::default_temp_dir(),
        }
    }
}

/// Entry of an [`ObjectDrive`].
pub struct ObjectEntry {
    drive_id: Uuid,
    path: String,
    key: String,
    kind: EntryType,
    size: i64,
    mod_time: i64,
    client: Arc<dyn ObjectClient>,
    expiry: Duration,
    proxy: bool,
}

impl fmt::Debug for ObjectEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectEntry")
            .field("path", &self.path)
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .finish()
    }
}

impl Entry for ObjectEntry {
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
impl EntryContent for ObjectEntry {
    async fn reader(&self) -> DriveResult<BoxReader> {
        Ok(self.client.get_object(&self.key).await?)
    }

    fn url(&self) -> Option<ContentUrl> {
        self.client
            .presign_get(&self.key, self.expiry)
            .map(|url| ContentUrl {
                url,
                proxy: self.proxy,
                headers: Default::default(),
            })
    }
}

/// S3-style drive over an [`ObjectClient`].
pub struct ObjectDrive {
    id: Uuid,
    client: Arc<dyn ObjectClient>,
    options: ObjectDriveOptions,
}

impl fmt::Debug for ObjectDrive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDrive")
            .field("id", &self.id)
            .field("options", &self.options)
            .finish()
    }
}

impl ObjectDrive {
    pub fn new(client: Arc<dyn ObjectClient>, mut options: ObjectDriveOptions) -> Self {
        options.prefix = path::clean_path(&options.prefix);
        Self {
            id: Uuid::new_v4(),
            client,
            options,
        }
    }

    fn key(&self, path: &str) -> String {
        path::join(&self.options.prefix, path)
    }

    fn dir_key(&self, path: &str) -> String {
        let key = self.key(path);
        if key.is_empty() { key } else { format!("{key}/") }
    }

    /// Drive path for a store key (file key or dir marker/prefix).
    fn path_of(&self, key: &str) -> Option<String> {
        let key = key.trim_end_matches('/');
        path::strip_prefix(key, &self.options.prefix).map(str::to_string)
    }

    fn entry(&self, path: String, key: String, kind: EntryType, size: i64, mod_time: i64) -> EntryRef {
        Arc::new(ObjectEntry {
            drive_id: self.id,
            path,
            key,
            kind,
            size,
            mod_time,
            client: self.client.clone(),
            expiry: self.options.presign_expiry,
            proxy: self.options.proxy,
        })
    }

    fn own<'a>(&self, entry: &'a EntryRef) -> Option<&'a ObjectEntry> {
        find_entry::<ObjectEntry>(entry.as_ref()).filter(|e| e.drive_id == self.id)
    }

    /// Probe the file form, then the marker form, then any key beneath.
    async fn stat(&self, path: &str) -> DriveResult<EntryRef> {
        if path.is_empty() {
            return Ok(BasicEntry::root(true).into_ref());
        }
        let key = self.key(path);
        match self.client.head_object(&key).await {
            Ok(info) => {
                return Ok(self.entry(path.to_string(), key, EntryType::File, info.size, info.last_modified));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let marker = self.dir_key(path);
        match self.client.head_object(&marker).await {
            Ok(info) => {
                return Ok(self.entry(path.to_string(), marker, EntryType::Dir, SIZE_UNKNOWN, info.last_modified));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let probe = self.client.list_objects(&marker, None, None, 1).await?;
        if probe.objects.is_empty() && probe.prefixes.is_empty() {
            return Err(DriveError::not_found(path));
        }
        Ok(self.entry(path.to_string(), marker, EntryType::Dir, SIZE_UNKNOWN, TIME_UNKNOWN))
    }

    async fn put(&self, ctx: &TaskCtx, key: &str, size: i64, reader: BoxReader) -> DriveResult<()> {
        tokio::select! {
            result = self.client.put_object(key, size, reader) => Ok(result?),
            _ = ctx.cancelled() => Err(DriveError::Cancelled),
        }
    }

    /// Delete keys in batches, failing on the first batch that reports any
    /// per-key failure.
    async fn delete_keys(&self, ctx: &TaskCtx, keys: &[String]) -> DriveResult<()> {
        for batch in keys.chunks(DELETE_BATCH) {
            ctx.check()?;
            let failures = self.client.delete_objects(batch).await?;
            if let Some(first) = failures.first() {
                return Err(DriveError::remote(
                    500,
                    format!(
                        "failed to delete {} of {} keys, first {}: {} {}",
                        failures.len(),
                        batch.len(),
                        first.key,
                        first.code,
                        first.message
                    ),
                ));
            }
            ctx.progress(batch.len() as i64, false);
        }
        Ok(())
    }

    async fn copy_tree(
        &self,
        ctx: &TaskCtx,
        src: &ObjectEntry,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<()> {
        if path::overlaps(dst, &src.path) {
            return Err(DriveError::not_allowed(format!("cannot copy {} to {dst}", src.path)));
        }
        let source = self.stat(&src.path).await?;
        if source.kind().is_file() {
            match self.stat(dst).await {
                Ok(e) if e.kind().is_dir() => {
                    return Err(DriveError::not_allowed(format!("{dst} is a directory")));
                }
                Ok(_) if !overwrite => {
                    return Err(DriveError::not_allowed(format!("{dst} already exists")));
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            ctx.check()?;
            self.client.copy_object(&src.key, &self.key(dst)).await?;
            return Ok(());
        }
        let tree = build_tree(ctx, self, source).await?;
        copy_all(ctx, &tree, self, dst, overwrite, &ServerSideCopy { drive: self }).await?;
        Ok(())
    }

    async fn complete_upload(&self, path: &str, opts: &UploadOptions) -> DriveResult<UploadConfig> {
        let upload_id = opts
            .get("uploadId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriveError::bad_request("uploadId is required"))?;
        let parts: Vec<CompletedPart> = serde_json::from_value(
            opts.get("parts").cloned().unwrap_or(Value::Array(Vec::new())),
        )?;
        self.client
            .complete_multipart(&self.key(path), upload_id, &parts)
            .await?;
        Ok(UploadConfig::new(PROVIDER_S3_MULTIPART, json!({ "completed": true })))
    }
}

/// Per-file server-side copy within one store.
struct ServerSideCopy<'a> {
    drive: &'a ObjectDrive,
}

#[async_trait]
impl CopyHooks for ServerSideCopy<'_> {
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
        self.drive
            .client
            .copy_object(&from.key, &self.drive.key(dst_path))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Drive for ObjectDrive {
    fn meta(&self) -> DriveMeta {
        DriveMeta::writable()
    }

    async fn get(&self, path: &str) -> DriveResult<EntryRef> {
        self.stat(path).await
    }

    async fn list(&self, path: &str) -> DriveResult<Vec<EntryRef>> {
        if !path.is_empty() {
            let entry = self.stat(path).await?;
            if entry.kind().is_file() {
                return Err(DriveError::not_allowed(format!("{path} is not a directory")));
            }
        }
        let prefix = self.dir_key(path);
        let mut entries = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects(&prefix, Some(DELIMITER), token.as_deref(), LIST_PAGE)
                .await?;
            for object in page.objects {
                // The directory's own marker.
                if object.key == prefix {
                    continue;
                }
                if let Some(child) = self.path_of(&object.key) {
                    entries.push(self.entry(child, object.key, EntryType::File, object.size, object.last_modified));
                }
            }
            for common in page.prefixes {
                if let Some(child) = self.path_of(&common) {
                    entries.push(self.entry(child, common, EntryType::Dir, SIZE_UNKNOWN, TIME_UNKNOWN));
                }
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn save(
        &self,
        ctx: &TaskCtx,
        path: &str,
        size: i64,
        overwrite: bool,
        reader: BoxReader,
    ) -> DriveResult<EntryRef> {
        if path.is_empty() {
            return Err(DriveError::not_allowed("cannot write to the drive root"));
        }
        match self.get_opt(path).await? {
            Some(e) if e.kind().is_dir() => {
                return Err(DriveError::not_allowed(format!("{path} is a directory")));
            }
            Some(_) if !overwrite => {
                return Err(DriveError::not_allowed(format!("{path} already exists")));
            }
            _ => {}
        }

        let key = self.key(path);
        if size < 0 {
            // The store needs an exact length up front.
            let staged =
                stage_to_temp(ctx, &self.options.temp_dir, reader, COPY_BUFFER_SIZE).await?;
            let size = staged.size() as i64;
            self.put(ctx, &key, size, staged.reader().await?).await?;
        } else {
            self.put(ctx, &key, size, reader).await?;
        }
        self.stat(path).await
    }

    async fn make_dir(&self, path: &str) -> DriveResult<EntryRef> {
        match self.get_opt(path).await? {
            Some(e) if e.kind().is_dir() => return Ok(e),
            Some(_) => return Err(DriveError::not_allowed(format!("{path} is a file"))),
            None => {}
        }
        let marker = self.dir_key(path);
        self.client
            .put_object(&marker, 0, Box::new(tokio::io::empty()))
            .await?;
        self.stat(path).await
    }

    async fn copy(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef> {
        let Some(object) = self.own(&src) else {
            return Err(DriveError::Unsupported);
        };
        self.copy_tree(ctx, object, dst, overwrite).await?;
        self.stat(dst).await
    }

    async fn move_entry(
        &self,
        ctx: &TaskCtx,
        src: EntryRef,
        dst: &str,
        overwrite: bool,
    ) -> DriveResult<EntryRef> {
        let Some(object) = self.own(&src) else {
            return Err(DriveError::not_allowed("source entry belongs to another drive"));
        };
        if object.path.is_empty() || dst.is_empty() {
            return Err(DriveError::not_allowed("cannot move the drive root"));
        }
        // No rename in object stores: copy, then remove the source.
        self.copy_tree(ctx, object, dst, overwrite).await?;
        self.delete(ctx, &object.path).await?;
        self.stat(dst).await
    }

    async fn delete(&self, ctx: &TaskCtx, path: &str) -> DriveResult<()> {
        if path.is_empty() {
            return Err(DriveError::not_allowed("cannot delete the drive root"));
        }
        let entry = self.stat(path).await?;
        if entry.kind().is_file() {
            return self.delete_keys(ctx, &[self.key(path)]).await;
        }
        let tree = build_tree(ctx, self, entry).await?;
        let keys: Vec<String> = flatten_post_order(&tree)
            .iter()
            .map(|e| {
                if e.kind().is_dir() {
                    self.dir_key(e.path())
                } else {
                    self.key(e.path())
                }
            })
            .collect();
        self.delete_keys(ctx, &keys).await
    }

    async fn upload(
        &self,
        path: &str,
        size: i64,
        overwrite: bool,
        opts: &UploadOptions,
    ) -> DriveResult<UploadConfig> {
        let key = self.key(path);
        match opts.get("action").and_then(Value::as_str) {
            Some("complete") => return self.complete_upload(path, opts).await,
            Some("abort") => {
                let upload_id = opts
                    .get("uploadId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| DriveError::bad_request("uploadId is required"))?;
                self.client.abort_multipart(&key, upload_id).await?;
                return Ok(UploadConfig::new(PROVIDER_S3_MULTIPART, json!({ "aborted": true })));
            }
            Some(other) => {
                return Err(DriveError::bad_request(format!("unknown upload action: {other}")));
            }
            None => {}
        }

        if !overwrite && self.get_opt(path).await?.is_some() {
            return Err(DriveError::not_allowed(format!("{path} already exists")));
        }
        let expiry = self.options.presign_expiry;
        if size > self.options.chunk_threshold {
            let part_size = self.options.chunk_threshold.max(1);
            let count = ((size + part_size - 1) / part_size) as u32;
            let upload_id = self.client.create_multipart(&key).await?;
            let parts = (1..=count)
                .map(|n| {
                    let url = self.client.presign_part(&key, &upload_id, n, expiry)?;
                    Ok(json!({ "partNumber": n, "url": url }))
                })
                .collect::<ObjectResult<Vec<_>>>()?;
            return Ok(UploadConfig::new(
                PROVIDER_S3_MULTIPART,
                json!({
                    "uploadId": upload_id,
                    "partSize": part_size,
                    "parts": parts,
                }),
            ));
        }
        let url = self.client.presign_put(&key, expiry)?;
        Ok(UploadConfig::new(PROVIDER_S3, json!({ "url": url, "method": "PUT" })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::entry::open_reader;
    use tokio::io::AsyncReadExt;

    fn drive_with(prefix: &str) -> (Arc<MemoryObjectClient>, ObjectDrive) {
        let client = Arc::new(MemoryObjectClient::new("bucket"));
        let drive = ObjectDrive::new(
            client.clone(),
            ObjectDriveOptions {
                prefix: prefix.to_string(),
                ..Default::default()
            },
        );
        (client, drive)
    }

    fn bytes(data: &[u8]) -> BoxReader {
        Box::new(std::io::Cursor::new(data.to_vec()))
    }

    #[tokio::test]
    async fn test_file_and_marker_probing() {
        let (client, drive) = drive_with("root");
        let ctx = TaskCtx::new();
        drive.save(&ctx, "a.txt", 3, false, bytes(b"abc")).await.unwrap();
        drive.make_dir("dir").await.unwrap();
        client
            .put_object("root/implied/x", 1, bytes(b"x"))
            .await
            .unwrap();

        let file = drive.get("a.txt").await.unwrap();
        assert!(file.kind().is_file());
        assert_eq!(file.size(), 3);
        assert!(drive.get("dir").await.unwrap().kind().is_dir());
        assert!(drive.get("implied").await.unwrap().kind().is_dir());
        assert!(drive.get("nothing").await.unwrap_err().is_not_found());

        assert!(client.keys().contains(&"root/dir/".to_string()));
    }

    #[tokio::test]
    async fn test_list_children() {
        let (_, drive) = drive_with("");
        let ctx = TaskCtx::new();
        drive.make_dir("d").await.unwrap();
        drive.save(&ctx, "d/a", 1, false, bytes(b"a")).await.unwrap();
        drive.save(&ctx, "d/sub/b", 1, false, bytes(b"b")).await.unwrap();

        let mut paths: Vec<_> = drive
            .list("d")
            .await
            .unwrap()
            .iter()
            .map(|e| (e.path().to_string(), e.kind()))
            .collect();
        paths.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            paths,
            vec![("d/a".to_string(), EntryType::File), ("d/sub".to_string(), EntryType::Dir)]
        );
        assert!(matches!(
            drive.list("d/a").await.unwrap_err(),
            DriveError::NotAllowed { .. }
        ));
    }

    #[tokio::test]
    async fn test_save_unknown_size_and_read() {
        let (_, drive) = drive_with("");
        let ctx = TaskCtx::new();
        drive
            .save(&ctx, "f", SIZE_UNKNOWN, false, bytes(b"hello"))
            .await
            .unwrap();
        let entry = drive.get("f").await.unwrap();
        assert_eq!(entry.size(), 5);
        let mut out = Vec::new();
        open_reader(entry.as_ref())
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, b"hello");
        assert!(entry.content().unwrap().url().unwrap().url.starts_with("memory://bucket/f"));
    }

    #[tokio::test]
    async fn test_server_side_copy_and_move() {
        let (client, drive) = drive_with("");
        let ctx = TaskCtx::new();
        drive.save(&ctx, "src/a", 1, false, bytes(b"a")).await.unwrap();
        drive.save(&ctx, "src/sub/b", 1, false, bytes(b"b")).await.unwrap();

        let src = drive.get("src").await.unwrap();
        drive.copy(&ctx, src, "copy", false).await.unwrap();
        assert!(drive.get("copy/sub/b").await.is_ok());

        let src = drive.get("copy").await.unwrap();
        drive.move_entry(&ctx, src, "moved", false).await.unwrap();
        assert!(drive.get("copy").await.unwrap_err().is_not_found());
        assert!(drive.get("moved/a").await.is_ok());
        assert!(!client.keys().iter().any(|k| k.starts_with("copy")));
    }

    #[tokio::test]
    async fn test_move_onto_ancestor_keeps_source() {
        let (client, drive) = drive_with("");
        let ctx = TaskCtx::new();
        drive.save(&ctx, "a/b/f", 1, false, bytes(b"f")).await.unwrap();

        let src = drive.get("a/b").await.unwrap();
        let err = drive.move_entry(&ctx, src, "a", true).await.unwrap_err();
        assert!(matches!(err, DriveError::NotAllowed { .. }));
        assert!(drive.get("a/b/f").await.is_ok());
        assert!(!client.keys().iter().any(|k| k == "a/f"));
    }

    #[tokio::test]
    async fn test_delete_batches_in_post_order() {
        let (client, drive) = drive_with("");
        let ctx = TaskCtx::new();
        drive.make_dir("big").await.unwrap();
        for i in 0..1200 {
            client
                .put_object(&format!("big/{i:04}"), 0, Box::new(tokio::io::empty()))
                .await
                .unwrap();
        }
        drive.delete(&ctx, "big").await.unwrap();
        assert!(client.keys().is_empty());
    }

    #[tokio::test]
    async fn test_delete_reports_partial_failure() {
        let (client, drive) = drive_with("");
        let ctx = TaskCtx::new();
        drive.save(&ctx, "d/a", 1, false, bytes(b"a")).await.unwrap();
        drive.save(&ctx, "d/b", 1, false, bytes(b"b")).await.unwrap();
        client.deny_delete("d/b");
        let err = drive.delete(&ctx, "d").await.unwrap_err();
        assert!(matches!(err, DriveError::RemoteApi { .. }));
        assert!(client.keys().contains(&"d/b".to_string()));
    }

    #[tokio::test]
    async fn test_upload_configs() {
        let (client, drive) = drive_with("");
        let opts = UploadOptions::new();
        let small = drive.upload("s", 10, false, &opts).await.unwrap();
        assert_eq!(small.provider, PROVIDER_S3);

        let size = 12 * 1024 * 1024;
        let big = drive.upload("b", size, false, &opts).await.unwrap();
        assert_eq!(big.provider, PROVIDER_S3_MULTIPART);
        let config = big.config.unwrap();
        assert_eq!(config["parts"].as_array().unwrap().len(), 3);
        let upload_id = config["uploadId"].as_str().unwrap().to_string();

        let etag = client.upload_part(&upload_id, 1, b"data".to_vec()).unwrap();
        let mut complete = UploadOptions::new();
        complete.insert("action".into(), json!("complete"));
        complete.insert("uploadId".into(), json!(upload_id));
        complete.insert("parts".into(), json!([{ "partNumber": 1, "etag": etag }]));
        drive.upload("b", size, false, &complete).await.unwrap();
        assert_eq!(drive.get("b").await.unwrap().size(), 4);
    }

    #[tokio::test]
    async fn test_foreign_copy_is_unsupported() {
        let (_, a) = drive_with("");
        let (_, b) = drive_with("");
        let ctx = TaskCtx::new();
        a.save(&ctx, "f", 1, false, bytes(b"x")).await.unwrap();
        let src = a.get("f").await.unwrap();
        assert!(b.copy(&ctx, src, "f", false).await.unwrap_err().is_unsupported());
    }
}
