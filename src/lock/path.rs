use crate::error::{LockError, Result};
use crate::lock::resolver::LOCK_MARKER;

/// Validate a lock root such as `/locks/payments`.
pub fn validate_root(root: &str) -> Result<()> {
    let invalid = |message: &str| LockError::InvalidPath {
        path: root.to_string(),
        message: message.to_string(),
    };

    if !root.starts_with('/') {
        return Err(invalid("must be absolute"));
    }
    if root == "/" {
        return Err(invalid("the store root cannot be a lock root"));
    }
    if root.ends_with('/') {
        return Err(invalid("must not end with '/'"));
    }
    if root[1..].split('/').any(|segment| segment.is_empty()) {
        return Err(invalid("must not contain empty segments"));
    }
    if root.contains(LOCK_MARKER) {
        return Err(invalid("must not contain the contender marker"));
    }
    Ok(())
}

/// Leading part of every node name created by one attempt.
pub fn attempt_marker(attempt_id: &str) -> String {
    format!("{}{}", attempt_id, LOCK_MARKER)
}

/// Prefix handed to the store for a sequential create, e.g.
/// `/locks/payments/<attempt>__lock__`.
pub fn node_prefix(root: &str, attempt_id: &str) -> String {
    child_path(root, &attempt_marker(attempt_id))
}

pub fn child_path(root: &str, name: &str) -> String {
    format!("{}/{}", root, name)
}
