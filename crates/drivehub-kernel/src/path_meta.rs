//! Per-path metadata and its propagation along ancestry.
//!
//! Each record may set a password, a default sort, a default view mode and a
//! hidden-name pattern. A field set on an ancestor reaches descendants only
//! when that record's matching `recursive` bit is on.

use std::sync::Arc;

use rusqlite::Result as SqliteResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::Store;
use crate::vfs::path;

pub const RECURSIVE_PASSWORD: u8 = 1 << 0;
pub const RECURSIVE_DEFAULT_SORT: u8 = 1 << 1;
pub const RECURSIVE_DEFAULT_MODE: u8 = 1 << 2;
pub const RECURSIVE_HIDDEN_PATTERN: u8 = 1 << 3;

/// Entry meta property carrying the merged hidden pattern.
pub const PROP_HIDDEN_PATTERN: &str = "hidden_pattern";
pub const PROP_DEFAULT_SORT: &str = "default_sort";
pub const PROP_DEFAULT_MODE: &str = "default_mode";
/// Entry meta property set when a password guards the path.
pub const PROP_PASSWORD_PROTECTED: &str = "password_protected";

/// Stored metadata for one path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMeta {
    pub path: String,
    pub password: String,
    pub default_sort: String,
    pub default_mode: String,
    pub hidden_pattern: String,
    /// Bit `i` propagates field `i` (in declaration order) to descendants.
    pub recursive: u8,
}

impl PathMeta {
    fn field(&self, bit: u8) -> &str {
        match bit {
            RECURSIVE_PASSWORD => &self.password,
            RECURSIVE_DEFAULT_SORT => &self.default_sort,
            RECURSIVE_DEFAULT_MODE => &self.default_mode,
            _ => &self.hidden_pattern,
        }
    }
}

/// Effective metadata of a path after merging its ancestry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedPathMeta {
    pub password: String,
    /// Path of the record the password came from.
    pub password_path: String,
    pub default_sort: String,
    pub default_mode: String,
    pub hidden_pattern: String,
}

impl MergedPathMeta {
    /// Entry properties for this metadata. The password itself never leaves.
    pub fn props(&self) -> Map<String, Value> {
        let mut props = Map::new();
        let mut put = |key: &str, value: &str| {
            if !value.is_empty() {
                props.insert(key.to_string(), Value::String(value.to_string()));
            }
        };
        put(PROP_DEFAULT_SORT, &self.default_sort);
        put(PROP_DEFAULT_MODE, &self.default_mode);
        put(PROP_HIDDEN_PATTERN, &self.hidden_pattern);
        if !self.password.is_empty() {
            props.insert(PROP_PASSWORD_PROTECTED.to_string(), Value::Bool(true));
        }
        props
    }
}

/// Merge `records` (any order) for `target`.
///
/// For every field, the deepest record with a non-empty value wins, provided
/// it is the target's own record or has the field's recursive bit set.
pub fn merge(target: &str, records: &[PathMeta]) -> MergedPathMeta {
    let mut sorted: Vec<&PathMeta> = records
        .iter()
        .filter(|r| path::is_self_or_descendant(target, &r.path))
        .collect();
    sorted.sort_by_key(|r| std::cmp::Reverse(path::path_depth(&r.path)));

    let pick = |bit: u8| {
        sorted
            .iter()
            .copied()
            .find(|r| !r.field(bit).is_empty() && (r.path == target || r.recursive & bit != 0))
    };

    let mut merged = MergedPathMeta::default();
    if let Some(r) = pick(RECURSIVE_PASSWORD) {
        merged.password = r.password.clone();
        merged.password_path = r.path.clone();
    }
    if let Some(r) = pick(RECURSIVE_DEFAULT_SORT) {
        merged.default_sort = r.default_sort.clone();
    }
    if let Some(r) = pick(RECURSIVE_DEFAULT_MODE) {
        merged.default_mode = r.default_mode.clone();
    }
    if let Some(r) = pick(RECURSIVE_HIDDEN_PATTERN) {
        merged.hidden_pattern = r.hidden_pattern.clone();
    }
    merged
}

/// Reads and merges path metadata from the store.
#[derive(Debug, Clone)]
pub struct PathMetaStore {
    store: Arc<Store>,
}

impl PathMetaStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Merged metadata for `target`, from one query over its ancestry.
    pub fn merged(&self, target: &str) -> SqliteResult<MergedPathMeta> {
        let records = self.store.path_meta_in(&path::ancestors(target))?;
        Ok(merge(target, &records))
    }

    /// Merged metadata for each of `targets`, from one query over the union
    /// of their ancestries.
    pub fn merged_many(&self, targets: &[String]) -> SqliteResult<Vec<MergedPathMeta>> {
        let mut keys: Vec<String> = targets.iter().flat_map(|t| path::ancestors(t)).collect();
        keys.sort();
        keys.dedup();
        let records = self.store.path_meta_in(&keys)?;
        Ok(targets.iter().map(|t| merge(t, &records)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, password: &str, sort: &str, recursive: u8) -> PathMeta {
        PathMeta {
            path: path.into(),
            password: password.into(),
            default_sort: sort.into(),
            recursive,
            ..Default::default()
        }
    }

    #[test]
    fn test_recursive_password_reaches_descendants() {
        let records = vec![record("private", "pw", "", RECURSIVE_PASSWORD)];
        let merged = merge("private/sub/deeper", &records);
        assert_eq!(merged.password, "pw");
        assert_eq!(merged.password_path, "private");
    }

    #[test]
    fn test_non_recursive_applies_to_self_only() {
        let records = vec![record("private", "pw", "name", 0)];
        assert_eq!(merge("private", &records).password, "pw");
        assert_eq!(merge("private", &records).default_sort, "name");
        assert_eq!(merge("private/sub", &records), MergedPathMeta::default());
    }

    #[test]
    fn test_nearest_ancestor_wins_per_field() {
        let records = vec![
            record("", "", "size", RECURSIVE_DEFAULT_SORT),
            record("a", "outer", "", RECURSIVE_PASSWORD),
            record("a/b", "inner", "mtime", RECURSIVE_PASSWORD),
        ];
        let merged = merge("a/b/c", &records);
        assert_eq!(merged.password, "inner");
        assert_eq!(merged.password_path, "a/b");
        // a/b's sort is not recursive, so the root's recursive sort applies.
        assert_eq!(merged.default_sort, "size");
    }

    #[test]
    fn test_unrelated_records_ignored() {
        let records = vec![record("other", "pw", "", RECURSIVE_PASSWORD)];
        assert!(merge("a", &records).password.is_empty());
    }

    #[test]
    fn test_props_hide_password() {
        let merged = MergedPathMeta {
            password: "pw".into(),
            password_path: "p".into(),
            hidden_pattern: "^\\.".into(),
            ..Default::default()
        };
        let props = merged.props();
        assert_eq!(props[PROP_PASSWORD_PROTECTED], Value::Bool(true));
        assert_eq!(props[PROP_HIDDEN_PATTERN], Value::String("^\\.".into()));
        assert!(!props.values().any(|v| v == "pw"));
    }

    #[test]
    fn test_store_merge() {
        let db = Arc::new(Store::in_memory().unwrap());
        db.save_path_meta(&record("private", "pw", "", RECURSIVE_PASSWORD))
            .unwrap();
        let store = PathMetaStore::new(db);
        assert_eq!(store.merged("private/sub").unwrap().password, "pw");
        assert!(store.merged("public").unwrap().password.is_empty());

        let many = store
            .merged_many(&["private/a".to_string(), "public".to_string()])
            .unwrap();
        assert_eq!(many[0].password, "pw");
        assert!(many[1].password.is_empty());
    }
}
