//! Caller identity.
//!
//! Session issuance happens elsewhere; the kernel only needs to know who is
//! calling and which secrets they have presented.

use std::collections::HashMap;

use crate::db::UserRecord;
use crate::permission::{GROUP_PREFIX, USER_PREFIX};

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub groups: Vec<String>,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groups: Vec::new(),
        }
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }
}

impl From<UserRecord> for User {
    fn from(record: UserRecord) -> Self {
        Self {
            name: record.name,
            groups: record.groups,
        }
    }
}

/// Per-request caller state.
#[derive(Debug, Clone, Default)]
pub struct Session {
    user: Option<User>,
    values: HashMap<String, String>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_user(user: User) -> Self {
        Self {
            user: Some(user),
            values: HashMap::new(),
        }
    }

    /// Attach a session-bound value, e.g. `password:<path>`.
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.user.is_none()
    }

    /// Subjects this caller matches: always `""` (anonymous), plus
    /// `u:<name>` and `g:<group>` for each group when authenticated.
    pub fn subjects(&self) -> Vec<String> {
        let mut subjects = vec![String::new()];
        if let Some(user) = &self.user {
            subjects.push(format!("{USER_PREFIX}{}", user.name));
            subjects.extend(user.groups.iter().map(|g| format!("{GROUP_PREFIX}{g}")));
        }
        subjects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_subjects() {
        let session = Session::anonymous();
        assert!(session.is_anonymous());
        assert_eq!(session.subjects(), vec![String::new()]);
    }

    #[test]
    fn test_user_subjects() {
        let session = Session::for_user(User::new("alice").with_groups(["staff", "ops"]));
        assert_eq!(
            session.subjects(),
            vec!["", "u:alice", "g:staff", "g:ops"]
        );
    }

    #[test]
    fn test_values() {
        let session = Session::anonymous().with_value("password:private", "pw");
        assert_eq!(session.value("password:private"), Some("pw"));
        assert_eq!(session.value("password:other"), None);
    }
}
