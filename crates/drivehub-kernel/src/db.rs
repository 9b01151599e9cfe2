//! SQLite persistence for users, drives, rules, path metadata and caches.
//!
//! One connection behind a mutex. Statements are short, so callers on async
//! tasks take the lock directly.

use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, params, params_from_iter};
use serde_json::{Map, Value};

use crate::path_meta::PathMeta;
use crate::permission::{PathPermission, Permission, Policy};
use crate::vfs::PathMount;
use crate::vfs::path::clean_path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    name TEXT PRIMARY KEY,
    created_at INTEGER DEFAULT (unixepoch())
);

CREATE TABLE IF NOT EXISTS groups (
    name TEXT PRIMARY KEY,
    created_at INTEGER DEFAULT (unixepoch())
);

CREATE TABLE IF NOT EXISTS user_groups (
    username TEXT NOT NULL,
    group_name TEXT NOT NULL,
    PRIMARY KEY (username, group_name)
);

-- Drive instances; config is a JSON object handed to the factory
CREATE TABLE IF NOT EXISTS drives (
    name TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL DEFAULT 1,
    type TEXT NOT NULL,
    config TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS path_permissions (
    path TEXT NOT NULL,
    subject TEXT NOT NULL,
    permission INTEGER NOT NULL,
    policy TEXT NOT NULL,
    depth INTEGER NOT NULL,
    PRIMARY KEY (path, subject)
);
CREATE INDEX IF NOT EXISTS idx_path_permissions_depth ON path_permissions(depth, path);

CREATE TABLE IF NOT EXISTS path_meta (
    path TEXT PRIMARY KEY,
    password TEXT NOT NULL DEFAULT '',
    default_sort TEXT NOT NULL DEFAULT '',
    default_mode TEXT NOT NULL DEFAULT '',
    hidden_pattern TEXT NOT NULL DEFAULT '',
    recursive INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS path_mount (
    path TEXT NOT NULL,
    name TEXT NOT NULL,
    mount_at TEXT NOT NULL,
    PRIMARY KEY (path, name)
);

-- Per-drive persistent key/value state
CREATE TABLE IF NOT EXISTS drive_data (
    drive TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (drive, key)
);

-- Persistent drive cache; expires_at is epoch millis, 0 = never
CREATE TABLE IF NOT EXISTS drive_cache (
    drive TEXT NOT NULL,
    path TEXT NOT NULL,
    depth INTEGER NOT NULL,
    kind TEXT NOT NULL,
    value TEXT NOT NULL,
    expires_at INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (drive, kind, path)
);
CREATE INDEX IF NOT EXISTS idx_drive_cache_depth ON drive_cache(drive, depth, path);
CREATE INDEX IF NOT EXISTS idx_drive_cache_expires ON drive_cache(expires_at);
"#;

/// Default admin account seeded by [`Store::bootstrap`].
pub const ADMIN_USER: &str = "admin";
/// Default admin group seeded by [`Store::bootstrap`].
pub const ADMIN_GROUP: &str = "admin";

/// A user and the groups they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub name: String,
    pub groups: Vec<String>,
}

/// A configured drive instance.
#[derive(Debug, Clone, PartialEq)]
pub struct DriveRecord {
    pub name: String,
    pub enabled: bool,
    /// Factory type, e.g. `local`.
    pub kind: String,
    pub config: Map<String, Value>,
}

/// Database handle.
pub struct Store {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Seed the admin user, the admin group and the root read rule.
    ///
    /// Runs only against an empty `users` table. Returns whether seeding
    /// happened.
    pub fn bootstrap(&self) -> SqliteResult<bool> {
        let mut conn = self.conn();
        let users: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        if users > 0 {
            return Ok(false);
        }
        let tx = conn.transaction()?;
        tx.execute("INSERT INTO users (name) VALUES (?1)", params![ADMIN_USER])?;
        tx.execute("INSERT INTO groups (name) VALUES (?1)", params![ADMIN_GROUP])?;
        tx.execute(
            "INSERT INTO user_groups (username, group_name) VALUES (?1, ?2)",
            params![ADMIN_USER, ADMIN_GROUP],
        )?;
        let rule = PathPermission::new("", crate::permission::SUBJECT_ANY, Permission::READ, Policy::Accept);
        tx.execute(
            "INSERT OR REPLACE INTO path_permissions (path, subject, permission, policy, depth)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                rule.path,
                rule.subject,
                rule.permission.bits(),
                rule.policy.to_string(),
                rule.depth as i64
            ],
        )?;
        tx.commit()?;
        tracing::info!("bootstrapped store with user {}", ADMIN_USER);
        Ok(true)
    }

    // =========================================================================
    // Users and groups
    // =========================================================================

    pub fn create_user(&self, name: &str) -> SqliteResult<()> {
        self.conn()
            .execute("INSERT OR IGNORE INTO users (name) VALUES (?1)", params![name])?;
        Ok(())
    }

    pub fn create_group(&self, name: &str) -> SqliteResult<()> {
        self.conn()
            .execute("INSERT OR IGNORE INTO groups (name) VALUES (?1)", params![name])?;
        Ok(())
    }

    pub fn add_user_to_group(&self, username: &str, group: &str) -> SqliteResult<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO user_groups (username, group_name) VALUES (?1, ?2)",
            params![username, group],
        )?;
        Ok(())
    }

    /// Look up a user with their group memberships.
    pub fn get_user(&self, name: &str) -> SqliteResult<Option<UserRecord>> {
        let conn = self.conn();
        let exists: Option<String> = conn
            .query_row("SELECT name FROM users WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?;
        let Some(name) = exists else {
            return Ok(None);
        };
        let mut stmt = conn.prepare(
            "SELECT group_name FROM user_groups WHERE username = ?1 ORDER BY group_name",
        )?;
        let groups = stmt
            .query_map(params![name], |row| row.get(0))?
            .collect::<SqliteResult<Vec<String>>>()?;
        Ok(Some(UserRecord { name, groups }))
    }

    pub fn list_users(&self) -> SqliteResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT name FROM users ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect()
    }

    // =========================================================================
    // Drives
    // =========================================================================

    /// Insert or replace a drive.
    pub fn save_drive(&self, drive: &DriveRecord) -> SqliteResult<()> {
        let config = Value::Object(drive.config.clone()).to_string();
        self.conn().execute(
            "INSERT OR REPLACE INTO drives (name, enabled, type, config) VALUES (?1, ?2, ?3, ?4)",
            params![drive.name, drive.enabled, drive.kind, config],
        )?;
        Ok(())
    }

    pub fn list_drives(&self) -> SqliteResult<Vec<DriveRecord>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT name, enabled, type, config FROM drives ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            let config: String = row.get(3)?;
            Ok(DriveRecord {
                name: row.get(0)?,
                enabled: row.get(1)?,
                kind: row.get(2)?,
                config: parse_object(&config),
            })
        })?;
        rows.collect()
    }

    pub fn delete_drive(&self, name: &str) -> SqliteResult<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM drives WHERE name = ?1", params![name])?;
        conn.execute("DELETE FROM drive_data WHERE drive = ?1", params![name])?;
        conn.execute("DELETE FROM drive_cache WHERE drive = ?1", params![name])?;
        Ok(())
    }

    // =========================================================================
    // Path permissions
    // =========================================================================

    /// Replace every rule attached to `path`.
    pub fn save_permissions(&self, path: &str, rules: &[PathPermission]) -> SqliteResult<()> {
        let path = clean_path(path);
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM path_permissions WHERE path = ?1", params![path])?;
        for rule in rules {
            tx.execute(
                "INSERT OR REPLACE INTO path_permissions (path, subject, permission, policy, depth)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    path,
                    rule.subject,
                    rule.permission.bits(),
                    rule.policy.to_string(),
                    crate::vfs::path::path_depth(&path) as i64
                ],
            )?;
        }
        tx.commit()
    }

    pub fn list_permissions(&self) -> SqliteResult<Vec<PathPermission>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT path, subject, permission, policy, depth FROM path_permissions
             ORDER BY depth, path, subject",
        )?;
        let rows = stmt.query_map([], |row| {
            let policy: String = row.get(3)?;
            let depth: i64 = row.get(4)?;
            Ok(PathPermission {
                path: row.get(0)?,
                subject: row.get(1)?,
                permission: Permission::from_bits(row.get(2)?),
                policy: policy.parse().unwrap_or(Policy::Reject),
                depth: depth as usize,
            })
        })?;
        rows.collect()
    }

    pub fn delete_permissions(&self, path: &str) -> SqliteResult<()> {
        self.conn()
            .execute("DELETE FROM path_permissions WHERE path = ?1", params![path])?;
        Ok(())
    }

    // =========================================================================
    // Path metadata
    // =========================================================================

    pub fn save_path_meta(&self, meta: &PathMeta) -> SqliteResult<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO path_meta
             (path, password, default_sort, default_mode, hidden_pattern, recursive)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                clean_path(&meta.path),
                meta.password,
                meta.default_sort,
                meta.default_mode,
                meta.hidden_pattern,
                meta.recursive
            ],
        )?;
        Ok(())
    }

    /// Records whose path is exactly one of `paths`, in one query.
    pub fn path_meta_in(&self, paths: &[String]) -> SqliteResult<Vec<PathMeta>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; paths.len()].join(", ");
        let sql = format!(
            "SELECT path, password, default_sort, default_mode, hidden_pattern, recursive
             FROM path_meta WHERE path IN ({placeholders})"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(paths.iter()), row_to_path_meta)?;
        rows.collect()
    }

    pub fn list_path_meta(&self) -> SqliteResult<Vec<PathMeta>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT path, password, default_sort, default_mode, hidden_pattern, recursive
             FROM path_meta ORDER BY path",
        )?;
        let rows = stmt.query_map([], row_to_path_meta)?;
        rows.collect()
    }

    pub fn delete_path_meta(&self, path: &str) -> SqliteResult<()> {
        self.conn()
            .execute("DELETE FROM path_meta WHERE path = ?1", params![path])?;
        Ok(())
    }

    // =========================================================================
    // Path mounts
    // =========================================================================

    pub fn save_mount(&self, mount: &PathMount) -> SqliteResult<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO path_mount (path, name, mount_at) VALUES (?1, ?2, ?3)",
            params![mount.path, mount.name, mount.mount_at],
        )?;
        Ok(())
    }

    pub fn list_mounts(&self) -> SqliteResult<Vec<PathMount>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT path, name, mount_at FROM path_mount ORDER BY path, name")?;
        let rows = stmt.query_map([], |row| {
            Ok(PathMount {
                path: row.get(0)?,
                name: row.get(1)?,
                mount_at: row.get(2)?,
            })
        })?;
        rows.collect()
    }

    pub fn delete_mount(&self, path: &str, name: &str) -> SqliteResult<()> {
        self.conn().execute(
            "DELETE FROM path_mount WHERE path = ?1 AND name = ?2",
            params![path, name],
        )?;
        Ok(())
    }

    // =========================================================================
    // Drive data
    // =========================================================================

    pub fn get_drive_data(&self, drive: &str, key: &str) -> SqliteResult<Option<String>> {
        self.conn()
            .query_row(
                "SELECT value FROM drive_data WHERE drive = ?1 AND key = ?2",
                params![drive, key],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn set_drive_data(&self, drive: &str, key: &str, value: &str) -> SqliteResult<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO drive_data (drive, key, value) VALUES (?1, ?2, ?3)",
            params![drive, key, value],
        )?;
        Ok(())
    }

    pub fn delete_drive_data(&self, drive: &str, key: &str) -> SqliteResult<()> {
        self.conn().execute(
            "DELETE FROM drive_data WHERE drive = ?1 AND key = ?2",
            params![drive, key],
        )?;
        Ok(())
    }

    // =========================================================================
    // Drive cache
    // =========================================================================

    pub fn cache_put(
        &self,
        drive: &str,
        kind: &str,
        path: &str,
        value: &str,
        expires_at: i64,
    ) -> SqliteResult<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO drive_cache (drive, path, depth, kind, value, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                drive,
                path,
                crate::vfs::path::path_depth(path) as i64,
                kind,
                value,
                expires_at
            ],
        )?;
        Ok(())
    }

    /// A live value, ignoring rows that expired before `now`.
    pub fn cache_get(
        &self,
        drive: &str,
        kind: &str,
        path: &str,
        now: i64,
    ) -> SqliteResult<Option<String>> {
        self.conn()
            .query_row(
                "SELECT value FROM drive_cache
                 WHERE drive = ?1 AND kind = ?2 AND path = ?3
                   AND (expires_at = 0 OR expires_at >= ?4)",
                params![drive, kind, path, now],
                |row| row.get(0),
            )
            .optional()
    }

    /// Remove every kind at `path`, and optionally everything beneath it.
    pub fn cache_evict(&self, drive: &str, path: &str, descendants: bool) -> SqliteResult<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM drive_cache WHERE drive = ?1 AND path = ?2",
            params![drive, path],
        )?;
        if descendants {
            let depth = crate::vfs::path::path_depth(path) as i64;
            let pattern = if path.is_empty() {
                "%".to_string()
            } else {
                format!("{}/%", escape_like(path))
            };
            conn.execute(
                "DELETE FROM drive_cache WHERE drive = ?1 AND depth > ?2 AND path LIKE ?3 ESCAPE '\\'",
                params![drive, depth, pattern],
            )?;
        }
        Ok(())
    }

    pub fn cache_clear(&self, drive: &str) -> SqliteResult<()> {
        self.conn()
            .execute("DELETE FROM drive_cache WHERE drive = ?1", params![drive])?;
        Ok(())
    }

    /// Delete rows that expired before `now`. Returns the number removed.
    pub fn cache_purge_expired(&self, now: i64) -> SqliteResult<usize> {
        self.conn().execute(
            "DELETE FROM drive_cache WHERE expires_at > 0 AND expires_at < ?1",
            params![now],
        )
    }
}

fn row_to_path_meta(row: &rusqlite::Row<'_>) -> SqliteResult<PathMeta> {
    Ok(PathMeta {
        path: row.get(0)?,
        password: row.get(1)?,
        default_sort: row.get(2)?,
        default_mode: row.get(3)?,
        hidden_pattern: row.get(4)?,
        recursive: row.get(5)?,
    })
}

fn parse_object(text: &str) -> Map<String, Value> {
    match serde_json::from_str(text) {
        Ok(Value::Object(map)) => map,
        _ => {
            tracing::warn!("ignoring malformed drive config: {}", text);
            Map::new()
        }
    }
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
