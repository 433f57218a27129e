//! Client-side view of a hierarchical coordination store.
//!
//! The lock protocol only needs a handful of primitives: ephemeral
//! sequential node creation, child listing, one-shot watches and deletion.
//! Any ZooKeeper-style client can back [`CoordinationStore`]; the crate
//! ships [`memory::MemoryEnsemble`] for tests and the `simulate` command.

pub mod memory;

use crate::error::StoreResult;
use std::sync::Arc;

pub use memory::{MemoryEnsemble, MemorySession};

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed when the creating session ends; the store appends a
    /// monotonically increasing sequence suffix to the requested name.
    EphemeralSequential,
}

/// Change observed by a one-shot watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    Deleted,
    DataChanged,
}

/// Connection state changes reported by the store client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Expired,
}

impl SessionEvent {
    /// Whether a lock can no longer trust its queue entry after this event.
    pub fn is_loss(self) -> bool {
        matches!(self, SessionEvent::Disconnected | SessionEvent::Expired)
    }
}

/// Callback fired at most once per arm.
pub type Watcher = Box<dyn FnOnce(WatchEvent) + Send>;

pub type SessionListener = Arc<dyn Fn(SessionEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

pub trait CoordinationStore: Send + Sync + 'static {
    /// Create `path` and any missing ancestors as persistent nodes.
    /// Succeeds if the path already exists.
    fn ensure_path(&self, path: &str) -> StoreResult<()>;

    /// Create a node and return its full path, which includes the
    /// sequence suffix for sequential modes.
    fn create(&self, path_prefix: &str, data: &[u8], mode: CreateMode) -> StoreResult<String>;

    /// Names (not full paths) of the children of `path`, as of the call.
    fn children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Read a node and arm a one-shot watch on it.
    ///
    /// Returns `None` without arming anything if the node does not exist.
    fn get_with_watch(&self, path: &str, watcher: Watcher) -> StoreResult<Option<Vec<u8>>>;

    /// Read a node without watching it.
    fn get(&self, path: &str) -> StoreResult<Option<Vec<u8>>>;

    fn delete(&self, path: &str) -> StoreResult<()>;

    fn add_session_listener(&self, listener: SessionListener) -> ListenerId;

    fn remove_session_listener(&self, id: ListenerId);
}

/// Split `/a/b/c` into (`/a/b`, `c`). The parent of a top-level node is `/`.
pub(crate) fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("/", path),
    }
}

pub(crate) fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}
