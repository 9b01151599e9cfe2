//! The gateway: composition root of the kernel.
//!
//! Owns the store, the drive manager and the rule sets, and builds the
//! per-request drive stack for a session:
//!
//! ```text
//! Listener -> PathMeta -> Permission -> Dispatcher
//! ```

use std::sync::Arc;

use rusqlite::Result as SqliteResult;

use crate::config::Config;
use crate::db::Store;
use crate::path_meta::{PathMeta, PathMetaStore};
use crate::permission::{PathPermission, PermissionStore};
use crate::registry::{DriveManager, DriveRegistry, ReloadReport};
use crate::session::{Session, User};
use crate::vfs::wrappers::{DriveListener, ListenerDrive, PathMetaDrive, PermissionDrive};
use crate::vfs::{Dispatcher, DriveError, DriveRef, DriveResult};

pub struct Gateway {
    store: Arc<Store>,
    manager: DriveManager,
    permissions: Arc<PermissionStore>,
    path_meta: PathMetaStore,
    listeners: Vec<Arc<dyn DriveListener>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("manager", &self.manager)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Assemble a gateway over `store`. Drives are not loaded until
    /// [`Gateway::reload`].
    pub fn new(store: Arc<Store>, registry: DriveRegistry, config: Config) -> SqliteResult<Self> {
        let dispatcher = Dispatcher::new()
            .with_temp_dir(config.temp_dir.clone())
            .with_buffer_size(config.copy_buffer_size);
        let permissions = Arc::new(PermissionStore::new(store.clone())?);
        Ok(Self {
            manager: DriveManager::new(registry, store.clone(), Arc::new(dispatcher), config),
            permissions,
            path_meta: PathMetaStore::new(store.clone()),
            store,
            listeners: Vec::new(),
        })
    }

    pub fn with_listener(mut self, listener: Arc<dyn DriveListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn registry(&self) -> &DriveRegistry {
        self.manager.registry()
    }

    /// The unguarded dispatcher. Bypasses permissions and path metadata.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.manager.dispatcher()
    }

    pub fn permissions(&self) -> &Arc<PermissionStore> {
        &self.permissions
    }

    /// Re-read permission rules and rebuild every drive.
    pub async fn reload(&self) -> DriveResult<ReloadReport> {
        self.permissions.reload()?;
        self.manager.reload().await
    }

    /// Replace the rules attached to `path` and reload the rule set.
    pub fn set_permissions(&self, path: &str, rules: &[PathPermission]) -> DriveResult<()> {
        self.store.save_permissions(path, rules)?;
        self.permissions.reload()?;
        Ok(())
    }

    pub fn set_path_meta(&self, meta: &PathMeta) -> DriveResult<()> {
        self.store.save_path_meta(meta)?;
        Ok(())
    }

    /// Session of a known user, or the anonymous session for `None`.
    pub fn session(&self, username: Option<&str>) -> DriveResult<Session> {
        let Some(name) = username else {
            return Ok(Session::anonymous());
        };
        match self.store.get_user(name)? {
            Some(record) => Ok(Session::for_user(User::from(record))),
            None => Err(DriveError::Unauthorized(format!("unknown user {name}"))),
        }
    }

    /// The drive stack a request from `session` operates on.
    pub fn drive_for(&self, session: &Session) -> DriveRef {
        let dispatcher: DriveRef = self.dispatcher().clone();
        let guarded: DriveRef = Arc::new(PermissionDrive::new(
            dispatcher,
            self.permissions.clone(),
            session,
        ));
        let described: DriveRef = Arc::new(PathMetaDrive::new(
            guarded,
            self.path_meta.clone(),
            session.clone(),
        ));
        Arc::new(ListenerDrive::new(
            described,
            session.clone(),
            self.listeners.clone(),
        ))
    }

    /// Dispose every drive.
    pub async fn shutdown(&self) {
        self.dispatcher().shutdown().await;
    }
}
