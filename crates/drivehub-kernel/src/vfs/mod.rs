//! Virtual filesystem.
//!
//! Every store is a [`Drive`]: a path-addressed tree of [`Entry`] values with
//! the same handful of operations. Layers stack by wrapping one drive in
//! another:
//!
//! ```text
//! Listener -> PathMeta -> Permission -> Dispatcher -> Chroot -> Cache -> backend
//! ```
//!
//! - [`Dispatcher`] routes `<drive>/<sub-path>` and streams copies between
//!   drives through temp files.
//! - [`ChrootDrive`] exposes a sub-directory as a drive root.
//! - [`CachedDrive`] caches entries and listings.
//! - [`wrappers`] hold the per-request layers.
//!
//! Paths are canonical everywhere: no leading or trailing slash, the root is
//! `""`. See [`path`].

pub mod backends;
pub mod cache;
mod chroot;
mod dispatcher;
mod entry;
mod error;
mod ops;
pub mod path;
mod stream;
pub mod tree;
mod types;
pub mod wrappers;

pub use cache::{CachedDrive, DriveCache, MemoryDriveCache, SqliteDriveCache};
pub use chroot::{ChrootDrive, ChrootEntry};
pub use dispatcher::{DispatchedEntry, Dispatcher, DriveName, PathMount};
pub use entry::{
    BasicEntry, BoxReader, Entry, EntryContent, EntryRef, RebasedEntry, find_entry, open_reader,
    snapshot,
};
pub use error::{DriveError, DriveResult};
pub use ops::{Drive, DriveRef};
pub use stream::{COPY_BUFFER_SIZE, StagedFile, copy_stream, default_temp_dir, stage_to_temp};
pub use types::{
    ContentUrl, DriveMeta, EntryMeta, EntrySnapshot, EntryType, PROVIDER_LOCAL,
    PROVIDER_LOCAL_CHUNK, PROVIDER_S3, PROVIDER_S3_MULTIPART, SIZE_UNKNOWN, TIME_UNKNOWN,
    UploadConfig, UploadOptions, now_millis,
};
