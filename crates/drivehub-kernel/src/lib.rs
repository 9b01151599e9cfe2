//! # drivehub-kernel
//!
//! Virtual filesystem kernel for drivehub.
//!
//! Several heterogeneous stores are exposed as one tree of
//! `<drive>/<sub-path>` paths. Each request goes through a stack of drives:
//! - Listener (access/update/delete events)
//! - Path metadata (passwords, default sort and mode, hidden patterns)
//! - Permissions (path-scoped accept/reject rules per user and group)
//! - Dispatcher (routing, mounts, cross-drive copies)
//! - Chroot and cache, per configured drive
//! - A backend (local disk, memory, object store)

pub mod config;
pub mod db;
pub mod gateway;
pub mod path_meta;
pub mod permission;
pub mod registry;
pub mod session;
pub mod task;
pub mod vfs;

pub use config::{CacheConfig, CacheKind, Config};
pub use db::{DriveRecord, Store, UserRecord};
pub use gateway::Gateway;
pub use path_meta::{MergedPathMeta, PathMeta, PathMetaStore};
pub use permission::{PathPermission, Permission, PermissionStore, Policy};
pub use registry::{
    DriveFactory, DriveManager, DriveRegistry, DriveUtils, FactoryInfo, FormItem, FormItemType,
    ObjectDriveFactory, ReloadReport,
};
pub use session::{Session, User};
pub use task::{Progress, TaskCtx};
pub use vfs::{
    Dispatcher, Drive, DriveError, DriveRef, DriveResult, Entry, EntryRef, EntryType, PathMount,
    backends::{LocalDrive, MemoryDrive, MemoryObjectClient, ObjectDrive},
};
