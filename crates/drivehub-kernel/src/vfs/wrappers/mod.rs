//! Per-request drive wrappers that sit above the dispatcher.
//!
//! Each wrapper preserves the drive contract. Entries a wrapper hands out are
//! [`OverlayEntry`] layers tagged with that wrapper instance, so it can peel
//! its own layer back off when an entry is passed into `copy` or `move`.

mod listener;
mod path_meta;
mod permission;

pub use listener::{DriveListener, ListenerCtx, ListenerDrive, LoggingListener};
pub use path_meta::{PASSWORD_REQUIRED, PathMetaDrive, password_key};
pub use permission::PermissionDrive;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::entry::{Entry, EntryContent, EntryRef};
use super::types::{EntryMeta, EntryType};

/// An entry with its meta replaced.
#[derive(Debug)]
pub struct OverlayEntry<Tag: fmt::Debug + PartialEq + Send + Sync + 'static> {
    inner: EntryRef,
    meta: EntryMeta,
    tag: Tag,
}

impl<Tag: fmt::Debug + PartialEq + Send + Sync + 'static> OverlayEntry<Tag> {
    pub fn new(inner: EntryRef, meta: EntryMeta, tag: Tag) -> Self {
        Self { inner, meta, tag }
    }

    pub fn wrap(inner: EntryRef, meta: EntryMeta, tag: Tag) -> EntryRef {
        Arc::new(Self::new(inner, meta, tag))
    }

    /// The layer beneath `entry` if `entry` is an overlay carrying `tag`;
    /// otherwise `entry` itself.
    pub fn peel(entry: EntryRef, tag: &Tag) -> EntryRef {
        match entry.as_any().downcast_ref::<Self>() {
            Some(own) if own.tag == *tag => own.inner.clone(),
            _ => entry,
        }
    }
}

impl<Tag: fmt::Debug + PartialEq + Send + Sync + 'static> Entry for OverlayEntry<Tag> {
    fn path(&self) -> &str {
        self.inner.path()
    }

    fn kind(&self) -> EntryType {
        self.inner.kind()
    }

    fn size(&self) -> i64 {
        self.inner.size()
    }

    fn mod_time(&self) -> i64 {
        self.inner.mod_time()
    }

    fn meta(&self) -> EntryMeta {
        self.meta.clone()
    }

    fn content(&self) -> Option<&dyn EntryContent> {
        self.inner.content()
    }

    fn inner(&self) -> Option<&EntryRef> {
        Some(&self.inner)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
