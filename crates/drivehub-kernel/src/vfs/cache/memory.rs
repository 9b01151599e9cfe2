//! Bounded in-process LRU cache.

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::DriveCache;
use crate::vfs::error::DriveResult;
use crate::vfs::path;
use crate::vfs::types::EntrySnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    Entry,
    Children,
}

#[derive(Debug, Clone)]
enum Value {
    Entry(EntrySnapshot),
    Children(Vec<String>),
}

#[derive(Debug)]
struct Item {
    value: Value,
    expires_at: Option<Instant>,
}

impl Item {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// LRU keyed by `(kind, path)`. Insertion order doubles as recency: a hit
/// moves the key to the back, eviction pops from the front.
#[derive(Debug)]
pub struct MemoryDriveCache {
    capacity: usize,
    items: Mutex<IndexMap<(Kind, String), Item>>,
}

impl MemoryDriveCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Mutex::new(IndexMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn put(&self, kind: Kind, path: &str, value: Value, ttl: Option<Duration>) {
        let item = Item {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        let mut items = self.items.lock();
        let key = (kind, path.to_string());
        items.shift_remove(&key);
        items.insert(key, item);
        while items.len() > self.capacity {
            items.shift_remove_index(0);
        }
    }

    fn get(&self, kind: Kind, path: &str) -> Option<Value> {
        let mut items = self.items.lock();
        let key = (kind, path.to_string());
        let (index, _, item) = items.get_full(&key)?;
        if !item.live(Instant::now()) {
            items.shift_remove_index(index);
            return None;
        }
        let value = item.value.clone();
        let last = items.len() - 1;
        items.move_index(index, last);
        Some(value)
    }
}

impl DriveCache for MemoryDriveCache {
    fn put_entry(&self, entry: &EntrySnapshot, ttl: Option<Duration>) -> DriveResult<()> {
        self.put(Kind::Entry, &entry.path, Value::Entry(entry.clone()), ttl);
        Ok(())
    }

    fn put_children(
        &self,
        parent: &str,
        children: &[EntrySnapshot],
        ttl: Option<Duration>,
    ) -> DriveResult<()> {
        for child in children {
            self.put_entry(child, ttl)?;
        }
        let paths = children.iter().map(|c| c.path.clone()).collect();
        self.put(Kind::Children, parent, Value::Children(paths), ttl);
        Ok(())
    }

    fn get_entry(&self, path: &str) -> DriveResult<Option<EntrySnapshot>> {
        Ok(match self.get(Kind::Entry, path) {
            Some(Value::Entry(entry)) => Some(entry),
            _ => None,
        })
    }

    fn get_children(&self, path: &str) -> DriveResult<Option<Vec<EntrySnapshot>>> {
        let Some(Value::Children(paths)) = self.get(Kind::Children, path) else {
            return Ok(None);
        };
        let mut children = Vec::with_capacity(paths.len());
        for child in &paths {
            match self.get_entry(child)? {
                Some(entry) => children.push(entry),
                None => return Ok(None),
            }
        }
        Ok(Some(children))
    }

    fn evict(&self, path: &str, descendants: bool) -> DriveResult<()> {
        let mut items = self.items.lock();
        if descendants {
            items.retain(|(_, key), _| !path::is_self_or_descendant(key, path));
        } else {
            items.shift_remove(&(Kind::Entry, path.to_string()));
            items.shift_remove(&(Kind::Children, path.to_string()));
        }
        Ok(())
    }

    fn clear(&self) -> DriveResult<()> {
        self.items.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::types::{EntryMeta, EntryType};

    fn file(path: &str) -> EntrySnapshot {
        EntrySnapshot {
            path: path.into(),
            kind: EntryType::File,
            size: 1,
            mod_time: 0,
            meta: EntryMeta::read_write(),
        }
    }

    #[test]
    fn test_put_get() {
        let cache = MemoryDriveCache::new(10);
        cache.put_entry(&file("a"), None).unwrap();
        assert_eq!(cache.get_entry("a").unwrap(), Some(file("a")));
        assert_eq!(cache.get_entry("b").unwrap(), None);
    }

    #[test]
    fn test_least_recently_used_goes_first() {
        let cache = MemoryDriveCache::new(2);
        cache.put_entry(&file("a"), None).unwrap();
        cache.put_entry(&file("b"), None).unwrap();
        // Touch "a" so "b" is the oldest.
        cache.get_entry("a").unwrap();
        cache.put_entry(&file("c"), None).unwrap();
        assert!(cache.get_entry("a").unwrap().is_some());
        assert!(cache.get_entry("b").unwrap().is_none());
        assert!(cache.get_entry("c").unwrap().is_some());
    }

    #[test]
    fn test_expired_is_miss() {
        let cache = MemoryDriveCache::new(10);
        cache.put_entry(&file("a"), Some(Duration::ZERO)).unwrap();
        assert!(cache.get_entry("a").unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_children_miss_when_child_evicted() {
        let cache = MemoryDriveCache::new(10);
        cache
            .put_children("d", &[file("d/x"), file("d/y")], None)
            .unwrap();
        assert_eq!(cache.get_children("d").unwrap().unwrap().len(), 2);
        cache.evict("d/y", false).unwrap();
        assert!(cache.get_children("d").unwrap().is_none());
    }

    #[test]
    fn test_evict_descendants() {
        let cache = MemoryDriveCache::new(10);
        cache.put_entry(&file("d/x"), None).unwrap();
        cache.put_entry(&file("d/sub/y"), None).unwrap();
        cache.put_entry(&file("dd"), None).unwrap();
        cache.evict("d", true).unwrap();
        assert!(cache.get_entry("d/x").unwrap().is_none());
        assert!(cache.get_entry("d/sub/y").unwrap().is_none());
        assert!(cache.get_entry("dd").unwrap().is_some());
    }
}
