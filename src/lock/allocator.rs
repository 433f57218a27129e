use crate::error::{LockError, Result, StoreError, StoreResult};
use crate::lock::acquisition::{RetryError, RetryPolicy};
use crate::lock::path::{attempt_marker, child_path, node_prefix};
use crate::store::{CoordinationStore, CreateMode, Watcher};
use std::sync::Arc;
use tracing::{debug, warn};

/// Creates queue entries under a lock root and lists the current contenders.
///
/// Every store call goes through the retry policy; `SessionExpired` is
/// never retried because a new session cannot vouch for the old entry.
pub struct SequencedNodeAllocator<S: CoordinationStore + ?Sized> {
    store: Arc<S>,
    root: String,
    retry: RetryPolicy,
}

impl<S: CoordinationStore + ?Sized> SequencedNodeAllocator<S> {
    pub fn new(store: Arc<S>, root: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            store,
            root: root.into(),
            retry,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Create this attempt's ephemeral sequential entry and return its
    /// full path.
    ///
    /// `attempt_id` is embedded in the node name. When a create fails with a
    /// transient error it may still have been applied, so the next attempt
    /// looks for the node by that id before creating again. If the retries
    /// run out, any node the attempt left behind is removed.
    pub fn create_entry(&self, attempt_id: &str, data: &[u8]) -> Result<String> {
        self.with_retry("ensure lock root", || self.store.ensure_path(&self.root))?;

        let prefix = node_prefix(&self.root, attempt_id);
        let marker = attempt_marker(attempt_id);
        let mut in_doubt = false;
        let created = self.retry.run("create queue entry", || {
            if in_doubt {
                if let Some(name) = self.find_marked(&marker)? {
                    warn!("Adopting queue entry {} after lost create reply", name);
                    return Ok(child_path(&self.root, &name));
                }
            }
            let result = self
                .store
                .create(&prefix, data, CreateMode::EphemeralSequential);
            if matches!(&result, Err(e) if e.is_transient()) {
                in_doubt = true;
            }
            result
        });

        match created {
            Ok(path) => {
                debug!("Created queue entry {}", path);
                Ok(path)
            }
            Err(e) => {
                if in_doubt {
                    if let Err(cleanup) = self.remove_attempt(attempt_id) {
                        warn!(
                            "Could not check for a stray entry of attempt {}: {}",
                            attempt_id, cleanup
                        );
                    }
                }
                Err(self.map_retry_error(e))
            }
        }
    }

    /// Remove whatever entry `attempt_id` created, if any. Returns whether
    /// something was removed.
    pub fn remove_attempt(&self, attempt_id: &str) -> Result<bool> {
        let marker = attempt_marker(attempt_id);
        let children = match self.snapshot() {
            Ok(children) => children,
            Err(LockError::Store(StoreError::NoNode(_))) => return Ok(false),
            Err(e) => return Err(e),
        };
        let mut removed = false;
        for name in children.iter().filter(|name| name.starts_with(&marker)) {
            removed |= self.remove_entry(&child_path(&self.root, name))?;
        }
        Ok(removed)
    }

    /// Current sibling names. Must be called after `create_entry` so the
    /// snapshot cannot miss a contender that queued ahead of us.
    pub fn snapshot(&self) -> Result<Vec<String>> {
        self.with_retry("list contenders", || self.store.children(&self.root))
    }

    /// Arm a one-shot watch on a sibling. `false` means it is already gone
    /// and nothing was armed. Each attempt gets a fresh watcher from
    /// `make_watcher`.
    pub fn watch(&self, name: &str, make_watcher: impl Fn() -> Watcher) -> Result<bool> {
        let path = child_path(&self.root, name);
        let armed = self.with_retry("arm watch", || {
            self.store.get_with_watch(&path, make_watcher())
        })?;
        Ok(armed.is_some())
    }

    /// Node data of a sibling, `None` if it has gone.
    pub fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = child_path(&self.root, name);
        self.with_retry("read contender", || self.store.get(&path))
    }

    /// Delete a queue entry. A node that is already gone counts as removed.
    /// Returns whether this call removed it.
    pub fn remove_entry(&self, path: &str) -> Result<bool> {
        match self.with_retry("delete queue entry", || self.store.delete(path)) {
            Ok(()) => {
                debug!("Deleted queue entry {}", path);
                Ok(true)
            }
            Err(LockError::Store(StoreError::NoNode(_))) => {
                debug!("Queue entry {} already gone", path);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn find_marked(&self, marker: &str) -> StoreResult<Option<String>> {
        Ok(self
            .store
            .children(&self.root)?
            .into_iter()
            .find(|name| name.starts_with(marker)))
    }

    fn with_retry<T>(
        &self,
        what: &str,
        op: impl FnMut() -> StoreResult<T>,
    ) -> Result<T> {
        self.retry
            .run(what, op)
            .map_err(|e| self.map_retry_error(e))
    }

    fn map_retry_error(&self, e: RetryError) -> LockError {
        match e {
            RetryError::Exhausted { attempts, last } => LockError::StoreUnavailable {
                attempts,
                source: last,
            },
            RetryError::Failed(StoreError::SessionExpired) => {
                LockError::session_lost(self.root.clone())
            }
            RetryError::Failed(other) => LockError::Store(other),
        }
    }
}
