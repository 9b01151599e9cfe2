//! Gateway configuration, loaded from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::vfs::backends::DEFAULT_CHUNK_THRESHOLD;
use crate::vfs::{COPY_BUFFER_SIZE, default_temp_dir};

/// Overrides `data_dir` when set.
pub const DATA_DIR_ENV: &str = "DRIVEHUB_DATA_DIR";

const DB_FILE: &str = "drivehub.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Staging directory for streamed copies.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub upload: UploadSettings,

    #[serde(default = "default_copy_buffer_size")]
    pub copy_buffer_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CacheKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_kind")]
    pub kind: CacheKind,

    /// Entries per drive for the memory cache.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// TTL for drives that do not set `cache_ttl`. Zero disables caching.
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,

    /// How often expired rows are purged from the sqlite cache.
    #[serde(default = "default_cleaner_interval")]
    pub cleaner_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSettings {
    /// Files above this size get a chunked upload provider.
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: i64,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("drivehub")
}

fn default_copy_buffer_size() -> usize {
    COPY_BUFFER_SIZE
}

fn default_cache_kind() -> CacheKind {
    CacheKind::Memory
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_cleaner_interval() -> u64 {
    600
}

fn default_chunk_threshold() -> i64 {
    DEFAULT_CHUNK_THRESHOLD
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: default_cache_kind(),
            capacity: default_cache_capacity(),
            default_ttl_secs: default_cache_ttl(),
            cleaner_interval_secs: default_cleaner_interval(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn cleaner_interval(&self) -> Duration {
        Duration::from_secs(self.cleaner_interval_secs.max(1))
    }
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            chunk_threshold: default_chunk_threshold(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            temp_dir: default_temp_dir(),
            cache: CacheConfig::default(),
            upload: UploadSettings::default(),
            copy_buffer_size: default_copy_buffer_size(),
        }
    }
}

impl Config {
    /// Load from `path`, falling back to defaults when the file does not
    /// exist. The environment override is applied either way.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        } else {
            tracing::debug!("no config at {}, using defaults", path.display());
            Self::default()
        };
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("drivehub")
            .join("config.toml")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.cache.kind, CacheKind::Memory);
        assert_eq!(config.upload.chunk_threshold, 5 * 1024 * 1024);
        assert_eq!(config.copy_buffer_size, 32 * 1024);
        assert!(config.db_path().ends_with("drivehub.db"));
    }

    #[test]
    fn test_parse_sections() {
        let config = Config::parse(
            r#"
            data_dir = "/srv/drivehub"

            [cache]
            kind = "sqlite"
            default_ttl_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/drivehub"));
        assert_eq!(config.cache.kind, CacheKind::Sqlite);
        assert!(config.cache.default_ttl().is_zero());
        assert_eq!(config.cache.capacity, 10_000);
    }

    #[test]
    fn test_bad_kind_is_an_error() {
        assert!(Config::parse("[cache]\nkind = \"redis\"").is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.cache.default_ttl_secs, 60);
    }
}
