//! Object-store client seam.
//!
//! [`ObjectClient`] is the narrow slice of an S3-style API the object drive
//! needs. The wire protocol lives behind it; [`MemoryObjectClient`] is the
//! in-process implementation.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::vfs::entry::BoxReader;
use crate::vfs::error::DriveError;
use crate::vfs::types::now_millis;

/// Native error reported by an object store.
#[derive(Debug, Clone, Error)]
#[error("{code} ({status}): {message}")]
pub struct ObjectError {
    /// Store error code, e.g. `NoSuchKey`.
    pub code: String,
    pub status: u16,
    pub message: String,
}

impl ObjectError {
    pub fn new(code: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            status,
            message: message.into(),
        }
    }

    pub fn no_such_key(key: &str) -> Self {
        Self::new("NoSuchKey", 404, format!("no such key: {key}"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.code.as_str(),
            "NoSuchKey" | "NoSuchBucket" | "NoSuchUpload" | "NotFound"
        )
    }
}

impl From<ObjectError> for DriveError {
    fn from(e: ObjectError) -> Self {
        if e.is_not_found() {
            return DriveError::not_found(e.message);
        }
        match e.code.as_str() {
            "AccessDenied" => DriveError::permission_denied(e.message),
            _ => DriveError::remote(e.status, format!("{}: {}", e.code, e.message)),
        }
    }
}

pub type ObjectResult<T> = Result<T, ObjectError>;

/// Object summary from a HEAD or a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: i64,
    /// Epoch milliseconds.
    pub last_modified: i64,
}

/// One page of a delimiter listing.
#[derive(Debug, Clone, Default)]
pub struct ObjectListing {
    pub objects: Vec<ObjectInfo>,
    /// Common prefixes, each ending with the delimiter.
    pub prefixes: Vec<String>,
    pub next_token: Option<String>,
}

/// A key the store refused to delete in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    pub key: String,
    pub code: String,
    pub message: String,
}

/// A finished part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// S3-style object API.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn head_object(&self, key: &str) -> ObjectResult<ObjectInfo>;

    async fn list_objects(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
        max_keys: usize,
    ) -> ObjectResult<ObjectListing>;

    async fn get_object(&self, key: &str) -> ObjectResult<BoxReader>;

    /// `size` is the exact content length.
    async fn put_object(&self, key: &str, size: i64, body: BoxReader) -> ObjectResult<()>;

    async fn copy_object(&self, src: &str, dst: &str) -> ObjectResult<()>;

    /// Delete up to 1000 keys. Per-key failures are returned, not raised.
    async fn delete_objects(&self, keys: &[String]) -> ObjectResult<Vec<DeleteFailure>>;

    /// Start a multipart upload, returning its id.
    async fn create_multipart(&self, key: &str) -> ObjectResult<String>;

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> ObjectResult<()>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> ObjectResult<()>;

    fn presign_put(&self, key: &str, expires: Duration) -> ObjectResult<String>;

    fn presign_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        expires: Duration,
    ) -> ObjectResult<String>;

    /// Direct download URL, when the store can hand one out.
    fn presign_get(&self, _key: &str, _expires: Duration) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    last_modified: i64,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

/// In-process object store.
///
/// Objects live in a sorted map so listings come back in key order the way
/// real stores return them. Multipart parts are fed through
/// [`MemoryObjectClient::upload_part`], which stands in for the client's
/// direct upload to a presigned URL.
#[derive(Debug)]
pub struct MemoryObjectClient {
    bucket: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    uploads: DashMap<String, PendingUpload>,
    denied: DashMap<String, ()>,
}

impl MemoryObjectClient {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
            uploads: DashMap::new(),
            denied: DashMap::new(),
        }
    }

    /// Make every delete of `key` fail with `AccessDenied`.
    pub fn deny_delete(&self, key: impl Into<String>) {
        self.denied.insert(key.into(), ());
    }

    /// Store one part of a pending multipart upload and return its etag.
    pub fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> ObjectResult<String> {
        let mut upload = self.uploads.get_mut(upload_id).ok_or_else(|| {
            ObjectError::new("NoSuchUpload", 404, format!("no such upload: {upload_id}"))
        })?;
        let etag = format!("\"{upload_id}-{part_number}\"");
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    /// All keys currently stored, in order.
    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    fn url(&self, key: &str, query: &str) -> String {
        format!("memory://{}/{}?{}", self.bucket, key, query)
    }
}

#[async_trait]
impl ObjectClient for MemoryObjectClient {
    async fn head_object(&self, key: &str) -> ObjectResult<ObjectInfo> {
        let objects = self.objects.read();
        let object = objects.get(key).ok_or_else(|| ObjectError::no_such_key(key))?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size: object.data.len() as i64,
            last_modified: object.last_modified,
        })
    }

    async fn list_objects(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
        max_keys: usize,
    ) -> ObjectResult<ObjectListing> {
        let objects = self.objects.read();
        let mut listing = ObjectListing::default();
        let mut count = 0usize;
        let mut last_key: Option<String> = None;

        let lower = match continuation {
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Included(prefix.to_string()),
        };
        for (key, object) in objects.range((lower, Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                break;
            }
            let rest = &key[prefix.len()..];
            let common = delimiter
                .and_then(|d| rest.find(d).map(|idx| format!("{prefix}{}", &rest[..idx + d.len()])));

            // Keys folded into the previous common prefix do not count.
            if common.is_some() && listing.prefixes.last() == common.as_ref() {
                last_key = Some(key.clone());
                continue;
            }
            if count >= max_keys {
                listing.next_token = last_key;
                break;
            }
            match common {
                Some(common) => listing.prefixes.push(common),
                None => listing.objects.push(ObjectInfo {
                    key: key.clone(),
                    size: object.data.len() as i64,
                    last_modified: object.last_modified,
                }),
            }
            count += 1;
            last_key = Some(key.clone());
        }
        Ok(listing)
    }

    async fn get_object(&self, key: &str) -> ObjectResult<BoxReader> {
        let data = self
            .objects
            .read()
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| ObjectError::no_such_key(key))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn put_object(&self, key: &str, size: i64, mut body: BoxReader) -> ObjectResult<()> {
        let mut data = Vec::new();
        body.read_to_end(&mut data)
            .await
            .map_err(|e| ObjectError::new("IncompleteBody", 400, e.to_string()))?;
        if size >= 0 && data.len() as i64 != size {
            return Err(ObjectError::new(
                "IncompleteBody",
                400,
                format!("expected {size} bytes, got {}", data.len()),
            ));
        }
        self.objects.write().insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified: now_millis(),
            },
        );
        Ok(())
    }

    async fn copy_object(&self, src: &str, dst: &str) -> ObjectResult<()> {
        let mut objects = self.objects.write();
        let mut object = objects
            .get(src)
            .cloned()
            .ok_or_else(|| ObjectError::no_such_key(src))?;
        object.last_modified = now_millis();
        objects.insert(dst.to_string(), object);
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> ObjectResult<Vec<DeleteFailure>> {
        if keys.len() > 1000 {
            return Err(ObjectError::new(
                "MalformedXML",
                400,
                "at most 1000 keys per delete",
            ));
        }
        let mut objects = self.objects.write();
        let mut failures = Vec::new();
        for key in keys {
            if self.denied.contains_key(key) {
                failures.push(DeleteFailure {
                    key: key.clone(),
                    code: "AccessDenied".into(),
                    message: "access denied".into(),
                });
                continue;
            }
            objects.remove(key);
        }
        Ok(failures)
    }

    async fn create_multipart(&self, key: &str) -> ObjectResult<String> {
        let upload_id = Uuid::new_v4().simple().to_string();
        self.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> ObjectResult<()> {
        let (_, upload) = self.uploads.remove(upload_id).ok_or_else(|| {
            ObjectError::new("NoSuchUpload", 404, format!("no such upload: {upload_id}"))
        })?;
        if upload.key != key {
            return Err(ObjectError::new("InvalidRequest", 400, "upload key mismatch"));
        }
        let mut data = Vec::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, bytes)) if *etag == part.etag => data.extend_from_slice(bytes),
                _ => {
                    return Err(ObjectError::new(
                        "InvalidPart",
                        400,
                        format!("part {} missing or etag mismatch", part.part_number),
                    ));
                }
            }
        }
        self.objects.write().insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified: now_millis(),
            },
        );
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> ObjectResult<()> {
        self.uploads.remove(upload_id);
        Ok(())
    }

    fn presign_put(&self, key: &str, expires: Duration) -> ObjectResult<String> {
        Ok(self.url(key, &format!("X-Expires={}", expires.as_secs())))
    }

    fn presign_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        expires: Duration,
    ) -> ObjectResult<String> {
        Ok(self.url(
            key,
            &format!(
                "uploadId={upload_id}&partNumber={part_number}&X-Expires={}",
                expires.as_secs()
            ),
        ))
    }

    fn presign_get(&self, key: &str, expires: Duration) -> Option<String> {
        Some(self.url(key, &format!("X-Expires={}", expires.as_secs())))
    }
}
