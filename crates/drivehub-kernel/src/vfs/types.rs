//! Core drive types.
//!
//! Plain value types shared by every layer. They serialize with serde so the
//! persistent cache can store entry snapshots as JSON.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Size reported for directories and for files of unknown length.
pub const SIZE_UNKNOWN: i64 = -1;

/// Modification time reported when the backend does not know it.
pub const TIME_UNKNOWN: i64 = -1;

/// Entry type enumeration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntryType {
    /// Regular file.
    File,
    /// Directory.
    Dir,
}

impl EntryType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, EntryType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, EntryType::Dir)
    }
}

/// Per-entry metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub can_read: bool,
    pub can_write: bool,
    /// Open-ended property bag.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub props: Map<String, Value>,
}

impl EntryMeta {
    /// Readable and writable, no properties.
    pub fn read_write() -> Self {
        Self {
            can_read: true,
            can_write: true,
            props: Map::new(),
        }
    }

    /// Readable only, no properties.
    pub fn read_only() -> Self {
        Self {
            can_read: true,
            can_write: false,
            props: Map::new(),
        }
    }
}

/// Per-drive metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriveMeta {
    pub can_write: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub props: Map<String, Value>,
}

impl DriveMeta {
    pub fn writable() -> Self {
        Self {
            can_write: true,
            props: Map::new(),
        }
    }
}

/// Download location advertised by an entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentUrl {
    pub url: String,
    /// The client cannot fetch `url` directly; the server must proxy it.
    pub proxy: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// Upload provider: stream straight to `save`.
pub const PROVIDER_LOCAL: &str = "local";
/// Upload provider: staged upload with a resumable chunk endpoint.
pub const PROVIDER_LOCAL_CHUNK: &str = "local-chunk";
/// Upload provider: single presigned object PUT.
pub const PROVIDER_S3: &str = "s3";
/// Upload provider: object-store multipart upload.
pub const PROVIDER_S3_MULTIPART: &str = "s3-multipart";

/// How a client should upload a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    pub provider: String,
    /// Provider-specific blob, returned verbatim to the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl UploadConfig {
    /// Stream the body straight to `save`.
    pub fn local() -> Self {
        Self {
            provider: PROVIDER_LOCAL.to_string(),
            config: None,
        }
    }

    pub fn new(provider: impl Into<String>, config: Value) -> Self {
        Self {
            provider: provider.into(),
            config: Some(config),
        }
    }
}

/// Provider-specific options sent by the client when negotiating an upload.
pub type UploadOptions = Map<String, Value>;

/// Serializable snapshot of an entry, as stored by the drive caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryType,
    pub size: i64,
    pub mod_time: i64,
    #[serde(default)]
    pub meta: EntryMeta,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    system_time_millis(SystemTime::now())
}

/// Convert a [`SystemTime`] to epoch milliseconds, [`TIME_UNKNOWN`] if it
/// predates the epoch.
pub fn system_time_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(TIME_UNKNOWN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_type() {
        assert!(EntryType::File.is_file());
        assert!(!EntryType::File.is_dir());
        assert!(EntryType::Dir.is_dir());
        assert_eq!(EntryType::Dir.to_string(), "dir");
        assert_eq!("file".parse::<EntryType>().unwrap(), EntryType::File);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let snap = EntrySnapshot {
            path: "a/b.txt".into(),
            kind: EntryType::File,
            size: 3,
            mod_time: 1000,
            meta: EntryMeta::read_only(),
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["meta"]["can_write"], false);
        assert!(json["meta"].get("props").is_none());
    }

    #[test]
    fn test_upload_config_local() {
        let cfg = UploadConfig::local();
        assert_eq!(cfg.provider, PROVIDER_LOCAL);
        assert!(cfg.config.is_none());
    }
}
