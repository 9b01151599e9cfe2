//! Drive backends.
//!
//! Backends implement [`Drive`](crate::vfs::Drive) over different storage types.

mod local;
mod memory;
pub mod object;

pub use local::{DEFAULT_CHUNK_THRESHOLD, LocalDrive, LocalEntry};
pub use memory::{MemoryDrive, MemoryEntry};
pub use object::{MemoryObjectClient, ObjectClient, ObjectDrive, ObjectDriveOptions, ObjectEntry};
