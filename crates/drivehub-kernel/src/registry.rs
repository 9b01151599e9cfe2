//! Drive factories and the manager that instantiates configured drives.
//!
//! A [`DriveRegistry`] maps a drive type (`local`, `memory`, `s3`, ...) to
//! the factory that builds it. [`DriveManager::reload`] reads the enabled
//! drives from the store, builds each one, wraps it in the configured cache
//! and chroot, and swaps the result into the dispatcher.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use rusqlite::Result as SqliteResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{CacheKind, Config};
use crate::db::{DriveRecord, Store};
use crate::vfs::backends::{
    LocalDrive, MemoryDrive, MemoryObjectClient, ObjectClient, ObjectDrive, ObjectDriveOptions,
};
use crate::vfs::cache::CacheRef;
use crate::vfs::{
    CachedDrive, ChrootDrive, Dispatcher, DriveError, DriveRef, DriveResult, MemoryDriveCache,
    SqliteDriveCache,
};

/// Drive config key: sub-directory of the backend exposed as the drive root.
pub const CONFIG_ROOT: &str = "root";
/// Drive config key: cache TTL in seconds. Zero disables caching.
pub const CONFIG_CACHE_TTL: &str = "cache_ttl";

// ============================================================================
// Factory description
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormItemType {
    Text,
    Password,
    Textarea,
    Select,
}

/// One field of a drive's configuration form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormItem {
    pub label: String,
    #[serde(rename = "type")]
    pub kind: FormItemType,
    pub field: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

impl FormItem {
    pub fn new(field: &str, label: &str, kind: FormItemType) -> Self {
        Self {
            label: label.to_string(),
            kind,
            field: field.to_string(),
            required: false,
            description: String::new(),
            options: Vec::new(),
            default_value: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn default_value(mut self, value: &str) -> Self {
        self.default_value = Some(value.to_string());
        self
    }
}

/// What a factory builds and how it is configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactoryInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub display_name: String,
    #[serde(default)]
    pub readme: String,
    pub config_form: Vec<FormItem>,
}

/// Per-drive services handed to a factory.
#[derive(Debug, Clone)]
pub struct DriveUtils {
    pub name: String,
    pub temp_dir: PathBuf,
    pub chunk_threshold: i64,
    pub buffer_size: usize,
    store: Arc<Store>,
}

impl DriveUtils {
    /// Persistent key/value state of this drive.
    pub fn data(&self, key: &str) -> SqliteResult<Option<String>> {
        self.store.get_drive_data(&self.name, key)
    }

    pub fn set_data(&self, key: &str, value: &str) -> SqliteResult<()> {
        self.store.set_drive_data(&self.name, key, value)
    }
}

/// Builds drives of one type.
#[async_trait]
pub trait DriveFactory: Send + Sync {
    fn info(&self) -> FactoryInfo;

    async fn create(&self, config: &Map<String, Value>, utils: &DriveUtils) -> DriveResult<DriveRef>;
}

fn config_str<'a>(config: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn required_str<'a>(config: &'a Map<String, Value>, key: &str) -> DriveResult<&'a str> {
    config_str(config, key).ok_or_else(|| DriveError::bad_request(format!("missing `{key}`")))
}

fn config_bool(config: &Map<String, Value>, key: &str) -> bool {
    match config.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true",
        _ => false,
    }
}

fn config_u64(config: &Map<String, Value>, key: &str) -> Option<u64> {
    match config.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ============================================================================
// Built-in factories
// ============================================================================

/// A directory on the local disk.
#[derive(Debug, Default)]
pub struct LocalDriveFactory;

#[async_trait]
impl DriveFactory for LocalDriveFactory {
    fn info(&self) -> FactoryInfo {
        FactoryInfo {
            kind: "local".into(),
            display_name: "Local".into(),
            readme: "Serves a directory of the server's filesystem.".into(),
            config_form: vec![
                FormItem::new("path", "Path", FormItemType::Text)
                    .required()
                    .describe("Absolute path of the directory to serve"),
            ],
        }
    }

    async fn create(&self, config: &Map<String, Value>, utils: &DriveUtils) -> DriveResult<DriveRef> {
        let root = required_str(config, "path")?;
        tokio::fs::create_dir_all(root).await?;
        let drive = LocalDrive::new(root)?
            .with_chunk_threshold(utils.chunk_threshold)
            .with_buffer_size(utils.buffer_size);
        Ok(Arc::new(drive))
    }
}

/// A drive kept in process memory. Contents are lost on reload.
#[derive(Debug, Default)]
pub struct MemoryDriveFactory;

#[async_trait]
impl DriveFactory for MemoryDriveFactory {
    fn info(&self) -> FactoryInfo {
        FactoryInfo {
            kind: "memory".into(),
            display_name: "Memory".into(),
            readme: "Scratch space held in memory.".into(),
            config_form: Vec::new(),
        }
    }

    async fn create(&self, _config: &Map<String, Value>, _utils: &DriveUtils) -> DriveResult<DriveRef> {
        Ok(Arc::new(MemoryDrive::new()))
    }
}

/// Opens an [`ObjectClient`] from a drive's configuration.
pub type ObjectConnector =
    dyn Fn(&Map<String, Value>) -> DriveResult<Arc<dyn ObjectClient>> + Send + Sync;

/// An S3-compatible bucket. The client comes from the supplied connector.
pub struct ObjectDriveFactory {
    connector: Arc<ObjectConnector>,
}

impl ObjectDriveFactory {
    pub fn new(connector: Arc<ObjectConnector>) -> Self {
        Self { connector }
    }

    /// Buckets held in process memory, one per configured drive.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(|config: &Map<String, Value>| {
            let bucket = required_str(config, "bucket")?;
            let client: Arc<dyn ObjectClient> = Arc::new(MemoryObjectClient::new(bucket));
            Ok(client)
        }))
    }
}

impl std::fmt::Debug for ObjectDriveFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectDriveFactory").finish_non_exhaustive()
    }
}

#[async_trait]
impl DriveFactory for ObjectDriveFactory {
    fn info(&self) -> FactoryInfo {
        FactoryInfo {
            kind: "s3".into(),
            display_name: "S3".into(),
            readme: "An S3-compatible bucket. Large uploads go multipart.".into(),
            config_form: vec![
                FormItem::new("bucket", "Bucket", FormItemType::Text).required(),
                FormItem::new("prefix", "Prefix", FormItemType::Text)
                    .describe("Key prefix inside the bucket"),
                FormItem::new("endpoint", "Endpoint", FormItemType::Text),
                FormItem::new("access_key", "Access key", FormItemType::Text),
                FormItem::new("secret_key", "Secret key", FormItemType::Password),
                FormItem::new("proxy", "Proxy downloads", FormItemType::Select)
                    .default_value("false"),
                FormItem::new("presign_expiry", "URL expiry (seconds)", FormItemType::Text)
                    .default_value("3600"),
            ],
        }
    }

    async fn create(&self, config: &Map<String, Value>, utils: &DriveUtils) -> DriveResult<DriveRef> {
        let client = (self.connector)(config)?;
        let mut options = ObjectDriveOptions {
            prefix: config_str(config, "prefix").unwrap_or_default().to_string(),
            chunk_threshold: utils.chunk_threshold,
            proxy: config_bool(config, "proxy"),
            temp_dir: utils.temp_dir.clone(),
            ..Default::default()
        };
        if let Some(secs) = config_u64(config, "presign_expiry") {
            options.presign_expiry = Duration::from_secs(secs);
        }
        Ok(Arc::new(ObjectDrive::new(client, options)))
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Drive factories by type, in registration order.
#[derive(Default)]
pub struct DriveRegistry {
    factories: IndexMap<String, Arc<dyn DriveFactory>>,
}

impl std::fmt::Debug for DriveRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveRegistry")
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DriveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `local` and `memory`.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LocalDriveFactory));
        registry.register(Arc::new(MemoryDriveFactory));
        registry
    }

    /// Register a factory under its type, replacing any previous one.
    pub fn register(&mut self, factory: Arc<dyn DriveFactory>) {
        self.factories.insert(factory.info().kind, factory);
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn DriveFactory>> {
        self.factories.get(kind)
    }

    pub fn infos(&self) -> Vec<FactoryInfo> {
        self.factories.values().map(|f| f.info()).collect()
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Outcome of a reload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadReport {
    pub loaded: Vec<String>,
    /// Drive name and the reason it was skipped.
    pub failed: Vec<(String, String)>,
}

pub struct DriveManager {
    registry: DriveRegistry,
    store: Arc<Store>,
    dispatcher: Arc<Dispatcher>,
    config: Config,
}

impl std::fmt::Debug for DriveManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveManager")
            .field("registry", &self.registry)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl DriveManager {
    pub fn new(
        registry: DriveRegistry,
        store: Arc<Store>,
        dispatcher: Arc<Dispatcher>,
        config: Config,
    ) -> Self {
        Self {
            registry,
            store,
            dispatcher,
            config,
        }
    }

    pub fn registry(&self) -> &DriveRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    fn utils(&self, name: &str) -> DriveUtils {
        DriveUtils {
            name: name.to_string(),
            temp_dir: self.config.temp_dir.clone(),
            chunk_threshold: self.config.upload.chunk_threshold,
            buffer_size: self.config.copy_buffer_size,
            store: self.store.clone(),
        }
    }

    fn cache_for(&self, name: &str) -> CacheRef {
        match self.config.cache.kind {
            CacheKind::Memory => Arc::new(MemoryDriveCache::new(self.config.cache.capacity)),
            CacheKind::Sqlite => Arc::new(SqliteDriveCache::new(self.store.clone(), name)),
        }
    }

    /// Build one drive with its cache and chroot layers.
    async fn build(&self, record: &DriveRecord) -> DriveResult<DriveRef> {
        let factory = self
            .registry
            .get(&record.kind)
            .ok_or_else(|| DriveError::bad_request(format!("unknown drive type {}", record.kind)))?;
        let drive = factory.create(&record.config, &self.utils(&record.name)).await?;

        let ttl = config_u64(&record.config, CONFIG_CACHE_TTL)
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.cache.default_ttl());
        let drive = CachedDrive::wrap(drive, self.cache_for(&record.name), ttl);

        let root = config_str(&record.config, CONFIG_ROOT).unwrap_or_default();
        Ok(ChrootDrive::wrap(drive, root))
    }

    /// Rebuild every enabled drive and install the result, together with the
    /// stored path mounts. A drive that fails to build is left out.
    #[tracing::instrument(skip(self), name = "drives.reload")]
    pub async fn reload(&self) -> DriveResult<ReloadReport> {
        let records = self.store.list_drives()?;
        let mut drives = HashMap::new();
        let mut report = ReloadReport::default();

        for record in records.iter().filter(|r| r.enabled) {
            match self.build(record).await {
                Ok(drive) => {
                    tracing::info!("loaded drive {} ({})", record.name, record.kind);
                    drives.insert(record.name.clone(), drive);
                    report.loaded.push(record.name.clone());
                }
                Err(e) => {
                    tracing::warn!("drive {} failed to load: {}", record.name, e);
                    report.failed.push((record.name.clone(), e.to_string()));
                }
            }
        }

        self.dispatcher.set_drives(drives).await;
        self.dispatcher.set_mounts(self.store.list_mounts()?);
        Ok(report)
    }
}
