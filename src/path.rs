//! Path helpers for the store namespace
//!
//! Paths are absolute, slash-delimited strings. A normalized path starts with
//! `/` and carries no trailing slash except for the root itself.

use crate::constants::ROOT_PATH;
use crate::constants::SEQUENCE_SUFFIX_WIDTH;
use crate::StoreError;
use crate::StoreResult;

/// Checks that `path` is a normalized absolute path
///
/// # Errors
/// [`StoreError::InvalidPath`] for relative paths, trailing slashes, empty,
/// `.` or `..` segments and NUL characters.
pub fn validate(path: &str) -> StoreResult<()> {
    if !path.starts_with('/') {
        return Err(StoreError::InvalidPath(format!("Path must start with / character: {path:?}")));
    }
    if path == ROOT_PATH {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(StoreError::InvalidPath(format!("Path must not end with / character: {path:?}")));
    }
    if path.contains('\0') {
        return Err(StoreError::InvalidPath(format!("Path contains a null character: {path:?}")));
    }
    for segment in path[1..].split('/') {
        match segment {
            "" => return Err(StoreError::InvalidPath(format!("Empty node name in {path:?}"))),
            "." | ".." => {
                return Err(StoreError::InvalidPath(format!("Relative segment in {path:?}")));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Adds the leading slash, collapses repeated slashes and drops the trailing one
pub fn normalize(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return ROOT_PATH.to_string();
    }
    format!("/{}", segments.join("/"))
}

/// Joins a child name onto a parent path
pub fn join(
    parent: &str,
    child: &str,
) -> String {
    let child = child.trim_matches('/');
    if parent == ROOT_PATH {
        format!("/{child}")
    } else {
        format!("{}/{child}", parent.trim_end_matches('/'))
    }
}

/// Parent of `path`, `None` for the root
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT_PATH {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT_PATH),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of `path`; empty for the root
pub fn node_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Number of segments `path` sits below `root`
///
/// Returns `Some(0)` for the root itself and `None` when `path` is not inside
/// the subtree.
pub fn depth_below(
    root: &str,
    path: &str,
) -> Option<usize> {
    if path == root {
        return Some(0);
    }
    let rest = if root == ROOT_PATH {
        path.strip_prefix('/')?
    } else {
        path.strip_prefix(root)?.strip_prefix('/')?
    };
    if rest.is_empty() {
        return None;
    }
    Some(rest.split('/').count())
}

/// Final path of a sequential node created at `path`
pub fn sequential(
    path: &str,
    sequence: i32,
) -> String {
    format!("{path}{sequence:0width$}", width = SEQUENCE_SUFFIX_WIDTH)
}

/// Every ancestor of `path` from the top down, excluding the root and `path`
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = parent(path);
    while let Some(p) = current {
        if p == ROOT_PATH {
            break;
        }
        out.push(p.to_string());
        current = parent(p);
    }
    out.reverse();
    out
}

/// Absolute path of a namespace name such as `zk/dev`
pub(crate) fn namespace_root(namespace: &str) -> String {
    normalize(namespace)
}

/// Maps a client path into the namespace
pub(crate) fn apply_namespace(
    root: &str,
    path: &str,
) -> String {
    if root == ROOT_PATH {
        return path.to_string();
    }
    if path == ROOT_PATH {
        root.to_string()
    } else {
        format!("{root}{path}")
    }
}

/// Maps a store path back out of the namespace
pub(crate) fn strip_namespace(
    root: &str,
    path: &str,
) -> String {
    if root == ROOT_PATH {
        return path.to_string();
    }
    match path.strip_prefix(root) {
        Some("") => ROOT_PATH.to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => path.to_string(),
    }
}
