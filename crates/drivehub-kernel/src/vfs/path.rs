//! Virtual path helpers.
//!
//! Every path handled by the kernel is canonical: forward slashes, no
//! leading or trailing `/`, no `.` or `..` segments. The root is `""`.

use super::error::{DriveError, DriveResult};

/// Canonicalise a path.
///
/// Strips leading and trailing slashes, drops `.` segments and collapses
/// `..` (never above the root). `"."` and `"/"` both become `""`.
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    segments.join("/")
}

/// Canonicalise a caller-supplied path, rejecting embedded NUL bytes.
pub fn checked_path(path: &str) -> DriveResult<String> {
    if path.contains('\0') {
        return Err(DriveError::bad_request(format!("invalid path: {path:?}")));
    }
    Ok(clean_path(path))
}

/// Number of segments in a canonical path. The root has depth 0.
pub fn path_depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.split('/').count()
    }
}

/// Parent of a canonical path. The parent of a top-level name (and of the
/// root itself) is the root.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Last segment of a canonical path.
pub fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Join two paths and canonicalise the result.
pub fn join(base: &str, rest: &str) -> String {
    if base.is_empty() {
        return clean_path(rest);
    }
    if rest.is_empty() {
        return clean_path(base);
    }
    clean_path(&format!("{base}/{rest}"))
}

/// Every ancestor of `path` from the root down to `path` itself.
///
/// `ancestors("a/b")` is `["", "a", "a/b"]`.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut result = vec![String::new()];
    if path.is_empty() {
        return result;
    }
    let mut current = String::new();
    for segment in path.split('/') {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(segment);
        result.push(current.clone());
    }
    result
}

/// True when `path` equals `ancestor` or lives underneath it.
pub fn is_self_or_descendant(path: &str, ancestor: &str) -> bool {
    ancestor.is_empty()
        || path == ancestor
        || (path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'/')
}

/// True when one path is the other or lies beneath it.
pub fn overlaps(a: &str, b: &str) -> bool {
    is_self_or_descendant(a, b) || is_self_or_descendant(b, a)
}

/// Strip `prefix` from `path` on a segment boundary.
///
/// Returns `None` when `path` is not `prefix` or a descendant of it.
pub fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(path);
    }
    if path == prefix {
        return Some("");
    }
    path.strip_prefix(prefix)?.strip_prefix('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(""), "");
        assert_eq!(clean_path("/"), "");
        assert_eq!(clean_path("."), "");
        assert_eq!(clean_path("/a/b/"), "a/b");
        assert_eq!(clean_path("a//b/./c"), "a/b/c");
        assert_eq!(clean_path("a/../../b"), "b");
        assert_eq!(clean_path("../.."), "");
    }

    #[test]
    fn test_clean_path_idempotent() {
        for p in ["", "/", ".", "/x/../y//z/", "../a", "a/b/c", "./."] {
            let once = clean_path(p);
            assert_eq!(clean_path(&once), once, "not idempotent for {p:?}");
        }
    }

    #[test]
    fn test_checked_path_rejects_nul() {
        assert!(checked_path("a\0b").is_err());
        assert_eq!(checked_path("/a/b").unwrap(), "a/b");
    }

    #[test]
    fn test_depth_parent_name() {
        assert_eq!(path_depth(""), 0);
        assert_eq!(path_depth("a"), 1);
        assert_eq!(path_depth("a/b/c"), 3);
        assert_eq!(parent("a/b/c"), "a/b");
        assert_eq!(parent("a"), "");
        assert_eq!(parent(""), "");
        assert_eq!(base_name("a/b/c"), "c");
        assert_eq!(base_name("a"), "a");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a", ""), "a");
        assert_eq!(join("a/b", "c/d"), "a/b/c/d");
        assert_eq!(join("a/b", "../c"), "a/c");
    }

    #[test]
    fn test_ancestors() {
        assert_eq!(ancestors(""), vec![""]);
        assert_eq!(ancestors("a/b"), vec!["", "a", "a/b"]);
    }

    #[test]
    fn test_descendant_and_strip() {
        assert!(is_self_or_descendant("a/b", ""));
        assert!(is_self_or_descendant("a/b", "a"));
        assert!(is_self_or_descendant("a", "a"));
        assert!(!is_self_or_descendant("ab", "a"));
        assert!(overlaps("a", "a/b"));
        assert!(overlaps("a/b", "a"));
        assert!(!overlaps("a/b", "a/c"));
        assert_eq!(strip_prefix("a/b/c", "a"), Some("b/c"));
        assert_eq!(strip_prefix("a", "a"), Some(""));
        assert_eq!(strip_prefix("ab", "a"), None);
        assert_eq!(strip_prefix("x", ""), Some("x"));
    }
}
