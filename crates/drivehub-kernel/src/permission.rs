//! Path permission rules and their resolution.
//!
//! A rule grants or revokes read/write bits on a path for a subject. The
//! effective permission for a path is a pure fold over the rules attached to
//! the path and its ancestors: deeper rules first, then user before group
//! before anonymous, then reject before accept.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use rusqlite::Result as SqliteResult;
use serde::{Deserialize, Serialize};

use crate::db::Store;
use crate::vfs::path;

/// Subject matching every caller, including anonymous ones.
pub const SUBJECT_ANY: &str = "ANY";
/// Prefix of user subjects (`u:<name>`).
pub const USER_PREFIX: &str = "u:";
/// Prefix of group subjects (`g:<name>`).
pub const GROUP_PREFIX: &str = "g:";

/// Read/write bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission(u8);

impl Permission {
    pub const EMPTY: Permission = Permission(0);
    pub const READ: Permission = Permission(1);
    pub const WRITE: Permission = Permission(2);
    pub const READ_WRITE: Permission = Permission(3);

    const MASK: u8 = 3;

    pub fn from_bits(bits: u8) -> Self {
        Permission(bits & Self::MASK)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// True when every bit of `required` is set.
    pub fn contains(self, required: Permission) -> bool {
        self.0 & required.0 == required.0
    }

    pub fn can_read(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(self) -> bool {
        self.contains(Self::WRITE)
    }
}

impl BitOr for Permission {
    type Output = Permission;
    fn bitor(self, rhs: Self) -> Self {
        Permission(self.0 | rhs.0)
    }
}

impl BitAnd for Permission {
    type Output = Permission;
    fn bitand(self, rhs: Self) -> Self {
        Permission(self.0 & rhs.0)
    }
}

impl Not for Permission {
    type Output = Permission;
    fn not(self) -> Self {
        Permission(!self.0 & Self::MASK)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.can_read() { "r" } else { "-" };
        let w = if self.can_write() { "w" } else { "-" };
        write!(f, "{r}{w}")
    }
}

impl FromStr for Permission {
    type Err = String;

    /// Accepts `r`, `w`, `rw`, `-` or a numeric mask.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(bits) = s.parse::<u8>() {
            return Ok(Permission::from_bits(bits));
        }
        let mut perm = Permission::EMPTY;
        for c in s.chars() {
            perm = perm
                | match c {
                    'r' | 'R' => Permission::READ,
                    'w' | 'W' => Permission::WRITE,
                    '-' => Permission::EMPTY,
                    other => return Err(format!("invalid permission flag: {other}")),
                };
        }
        Ok(perm)
    }
}

/// Rule policy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Policy {
    Reject,
    Accept,
}

/// One path-scoped rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPermission {
    pub path: String,
    /// `ANY`, `u:<user>` or `g:<group>`.
    pub subject: String,
    pub permission: Permission,
    pub policy: Policy,
    /// Segment count of `path`.
    pub depth: usize,
}

impl PathPermission {
    pub fn new(
        path: impl Into<String>,
        subject: impl Into<String>,
        permission: Permission,
        policy: Policy,
    ) -> Self {
        let path = path::clean_path(&path.into());
        let depth = path::path_depth(&path);
        Self {
            path,
            subject: subject.into(),
            permission,
            policy,
            depth,
        }
    }

    fn class(&self) -> SubjectClass {
        SubjectClass::of(&self.subject)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SubjectClass {
    Anonymous,
    Group,
    User,
}

impl SubjectClass {
    fn of(subject: &str) -> Self {
        if subject.starts_with(USER_PREFIX) {
            SubjectClass::User
        } else if subject.starts_with(GROUP_PREFIX) {
            SubjectClass::Group
        } else {
            SubjectClass::Anonymous
        }
    }
}

/// Normalised subject key: `ANY` and `""` both mean anonymous.
fn subject_key(subject: &str) -> &str {
    if subject == SUBJECT_ANY { "" } else { subject }
}

fn rule_order(a: &PathPermission, b: &PathPermission) -> Ordering {
    b.depth
        .cmp(&a.depth)
        .then_with(|| b.class().cmp(&a.class()))
        .then_with(|| match (a.policy, b.policy) {
            (Policy::Reject, Policy::Accept) => Ordering::Less,
            (Policy::Accept, Policy::Reject) => Ordering::Greater,
            _ => Ordering::Equal,
        })
}

/// Effective permission of `rules` for `subjects`.
///
/// `rules` must already be limited to the target path and its ancestors.
/// Rules for subjects outside `subjects` are ignored.
pub fn resolve<'a>(
    rules: impl IntoIterator<Item = &'a PathPermission>,
    subjects: &[String],
) -> Permission {
    let mut applicable: Vec<&PathPermission> = rules
        .into_iter()
        .filter(|r| {
            let key = subject_key(&r.subject);
            subjects.iter().any(|s| subject_key(s) == key)
        })
        .collect();
    applicable.sort_by(|a, b| rule_order(a, b));

    let mut accepted = Permission::EMPTY;
    let mut rejected = Permission::EMPTY;
    for rule in applicable {
        match rule.policy {
            Policy::Accept => accepted = accepted | (rule.permission & !rejected),
            Policy::Reject => {
                accepted = accepted & !(rule.permission & !accepted);
                rejected = rejected | rule.permission;
            }
        }
    }
    accepted
}

/// In-memory rule set, reloaded from the store on demand.
#[derive(Debug, Default)]
pub struct PermissionStore {
    store: Option<Arc<Store>>,
    by_path: RwLock<BTreeMap<String, Vec<PathPermission>>>,
}

impl PermissionStore {
    /// Load every rule from `store`.
    pub fn new(store: Arc<Store>) -> SqliteResult<Self> {
        let this = Self {
            store: Some(store),
            by_path: RwLock::new(BTreeMap::new()),
        };
        this.reload()?;
        Ok(this)
    }

    /// A fixed rule set with no backing store.
    pub fn from_rules(rules: impl IntoIterator<Item = PathPermission>) -> Self {
        let this = Self::default();
        this.replace(rules);
        this
    }

    /// Re-read the rules from the store. A no-op without one.
    pub fn reload(&self) -> SqliteResult<()> {
        if let Some(store) = &self.store {
            let rules = store.list_permissions()?;
            tracing::debug!("loaded {} permission rules", rules.len());
            self.replace(rules);
        }
        Ok(())
    }

    fn replace(&self, rules: impl IntoIterator<Item = PathPermission>) {
        let mut by_path: BTreeMap<String, Vec<PathPermission>> = BTreeMap::new();
        for rule in rules {
            by_path.entry(rule.path.clone()).or_default().push(rule);
        }
        *self.by_path.write() = by_path;
    }

    /// Rules attached to `path` or one of its ancestors.
    fn chain(by_path: &BTreeMap<String, Vec<PathPermission>>, target: &str) -> Vec<PathPermission> {
        path::ancestors(target)
            .iter()
            .filter_map(|p| by_path.get(p))
            .flatten()
            .cloned()
            .collect()
    }

    /// Effective permission on `target` for `subjects`.
    pub fn resolve(&self, target: &str, subjects: &[String]) -> Permission {
        let by_path = self.by_path.read();
        resolve(&Self::chain(&by_path, target), subjects)
    }

    /// Effective permissions of the direct children of `parent` that carry
    /// rules of their own. Children absent from the map inherit the parent's
    /// permission.
    pub fn resolve_children(&self, parent: &str, subjects: &[String]) -> HashMap<String, Permission> {
        let by_path = self.by_path.read();
        let inherited = Self::chain(&by_path, parent);
        let depth = path::path_depth(parent) + 1;

        let mut result = HashMap::new();
        for (child, rules) in by_path.iter() {
            if path::path_depth(child) != depth || !path::is_self_or_descendant(child, parent) {
                continue;
            }
            let perm = resolve(inherited.iter().chain(rules.iter()), subjects);
            result.insert(child.clone(), perm);
        }
        result
    }

    /// The first path strictly beneath `target` whose rules leave `subjects`
    /// without `required`.
    pub fn denied_descendant(
        &self,
        target: &str,
        subjects: &[String],
        required: Permission,
    ) -> Option<String> {
        let by_path = self.by_path.read();
        by_path
            .keys()
            .filter(|p| *p != target && path::is_self_or_descendant(p, target))
            .find(|p| !resolve(&Self::chain(&by_path, p), subjects).contains(required))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subjects(user: Option<&str>, groups: &[&str]) -> Vec<String> {
        let mut out = vec![String::new()];
        if let Some(user) = user {
            out.push(format!("u:{user}"));
            out.extend(groups.iter().map(|g| format!("g:{g}")));
        }
        out
    }

    fn scenario_rules() -> Vec<PathPermission> {
        vec![
            PathPermission::new("", "ANY", Permission::READ, Policy::Accept),
            PathPermission::new("secret", "ANY", Permission::READ, Policy::Reject),
            PathPermission::new("secret", "u:alice", Permission::READ_WRITE, Policy::Accept),
        ]
    }

    #[test]
    fn test_bit_ops() {
        assert_eq!(Permission::READ | Permission::WRITE, Permission::READ_WRITE);
        assert_eq!(!Permission::READ, Permission::WRITE);
        assert_eq!(!Permission::EMPTY, Permission::READ_WRITE);
        assert!(Permission::READ_WRITE.contains(Permission::READ));
        assert!(!Permission::READ.contains(Permission::READ_WRITE));
        assert_eq!("rw".parse::<Permission>().unwrap(), Permission::READ_WRITE);
        assert_eq!("1".parse::<Permission>().unwrap(), Permission::READ);
        assert_eq!(Permission::READ.to_string(), "r-");
    }

    #[test]
    fn test_policy_strings() {
        assert_eq!(Policy::Accept.to_string(), "accept");
        assert_eq!("REJECT".parse::<Policy>().unwrap(), Policy::Reject);
    }

    #[test]
    fn test_depth_computed() {
        let rule = PathPermission::new("/a/b/", "ANY", Permission::READ, Policy::Accept);
        assert_eq!(rule.path, "a/b");
        assert_eq!(rule.depth, 2);
    }

    #[test]
    fn test_scenario_alice_anonymous_bob() {
        let store = PermissionStore::from_rules(scenario_rules());
        let alice = subjects(Some("alice"), &[]);
        let bob = subjects(Some("bob"), &[]);
        let anon = subjects(None, &[]);

        assert_eq!(store.resolve("secret", &alice), Permission::READ_WRITE);
        assert_eq!(store.resolve("secret/f", &alice), Permission::READ_WRITE);
        assert_eq!(store.resolve("secret", &anon), Permission::EMPTY);
        assert_eq!(store.resolve("secret", &bob), Permission::EMPTY);
        assert_eq!(store.resolve("public", &anon), Permission::READ);
    }

    #[test]
    fn test_user_beats_group_at_same_depth() {
        let rules = vec![
            PathPermission::new("d", "g:staff", Permission::READ, Policy::Reject),
            PathPermission::new("d", "u:carol", Permission::READ, Policy::Accept),
        ];
        let carol = subjects(Some("carol"), &["staff"]);
        assert_eq!(resolve(&rules, &carol), Permission::READ);

        let dave = subjects(Some("dave"), &["staff"]);
        assert_eq!(resolve(&rules, &dave), Permission::EMPTY);
    }

    #[test]
    fn test_reject_wins_tie() {
        let rules = vec![
            PathPermission::new("d", "ANY", Permission::READ_WRITE, Policy::Accept),
            PathPermission::new("d", "ANY", Permission::WRITE, Policy::Reject),
        ];
        let anon = subjects(None, &[]);
        assert_eq!(resolve(&rules, &anon), Permission::READ);
        let reversed: Vec<_> = rules.iter().rev().cloned().collect();
        assert_eq!(resolve(&reversed, &anon), Permission::READ);
    }

    #[test]
    fn test_reject_dominates_shallower_accept() {
        let rules = vec![
            PathPermission::new("", "u:erin", Permission::READ_WRITE, Policy::Accept),
            PathPermission::new("a/b", "ANY", Permission::WRITE, Policy::Reject),
        ];
        let erin = subjects(Some("erin"), &[]);
        let perm = resolve(&rules, &erin);
        assert!(!perm.can_write());
        assert!(perm.can_read());
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let rules = scenario_rules();
        let alice = subjects(Some("alice"), &["x"]);
        let first = resolve(&rules, &alice);
        for _ in 0..10 {
            assert_eq!(resolve(&rules, &alice), first);
        }
    }

    #[test]
    fn test_children_and_descendants() {
        let mut rules = scenario_rules();
        rules.push(PathPermission::new("dir/b", "ANY", Permission::READ, Policy::Reject));
        rules.push(PathPermission::new("dir/c/deep", "ANY", Permission::READ, Policy::Reject));
        let store = PermissionStore::from_rules(rules);
        let anon = subjects(None, &[]);

        let children = store.resolve_children("dir", &anon);
        assert_eq!(children.len(), 1);
        assert_eq!(children["dir/b"], Permission::EMPTY);

        assert_eq!(
            store.denied_descendant("dir/c", &anon, Permission::READ).as_deref(),
            Some("dir/c/deep")
        );
        assert!(store.denied_descendant("other", &anon, Permission::READ).is_none());
    }

    #[test]
    fn test_reload_from_store() {
        let db = Arc::new(Store::in_memory().unwrap());
        db.bootstrap().unwrap();
        let store = PermissionStore::new(db.clone()).unwrap();
        let anon = subjects(None, &[]);
        assert_eq!(store.resolve("x", &anon), Permission::READ);

        db.save_permissions(
            "x",
            &[PathPermission::new("x", "ANY", Permission::READ, Policy::Reject)],
        )
        .unwrap();
        assert_eq!(store.resolve("x", &anon), Permission::READ);
        store.reload().unwrap();
        assert_eq!(store.resolve("x", &anon), Permission::EMPTY);
    }
}
