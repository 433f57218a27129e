//! In-process coordination store with ZooKeeper semantics.
//!
//! A [`MemoryEnsemble`] plays the role of the server side; each
//! [`MemorySession`] is one client connection with its own session, so
//! ephemeral nodes and watches behave as they would across processes.

use crate::error::{StoreError, StoreResult};
use crate::store::{
    join_path, split_path, CoordinationStore, CreateMode, ListenerId, SessionEvent,
    SessionListener, WatchEvent, Watcher,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

type SessionId = u64;

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    owner: Option<SessionId>,
    next_seq: u64,
}

impl Node {
    fn new(data: Vec<u8>, owner: Option<SessionId>) -> Self {
        Node {
            data,
            owner,
            next_seq: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Connected,
    Disconnected,
    Expired,
}

struct SessionState {
    status: SessionStatus,
    listeners: Vec<(ListenerId, SessionListener)>,
    fail_next: u32,
    lose_create_reply: bool,
}

struct EnsembleState {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, Vec<(SessionId, Watcher)>>,
    sessions: HashMap<SessionId, SessionState>,
    next_session: SessionId,
    next_listener: u64,
}

/// Callbacks collected under the state lock and run after it is released.
#[derive(Default)]
#[must_use]
struct Pending {
    watches: Vec<(Watcher, WatchEvent)>,
    listeners: Vec<(SessionListener, SessionEvent)>,
}

impl Pending {
    fn fire(self) {
        for (watcher, event) in self.watches {
            watcher(event);
        }
        for (listener, event) in self.listeners {
            listener(event);
        }
    }
}

impl EnsembleState {
    fn session(&mut self, id: SessionId) -> StoreResult<&mut SessionState> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(StoreError::SessionExpired)?;
        match session.status {
            SessionStatus::Expired => Err(StoreError::SessionExpired),
            SessionStatus::Disconnected => Err(StoreError::ConnectionLoss),
            SessionStatus::Connected => {
                if session.fail_next > 0 {
                    session.fail_next -= 1;
                    return Err(StoreError::ConnectionLoss);
                }
                Ok(session)
            }
        }
    }

    fn has_children(&self, path: &str) -> bool {
        self.nodes.keys().any(|key| key != path && split_path(key).0 == path)
    }

    fn remove_node(&mut self, path: &str, pending: &mut Pending) {
        if self.nodes.remove(path).is_some() {
            if let Some(watchers) = self.watches.remove(path) {
                pending
                    .watches
                    .extend(watchers.into_iter().map(|(_, w)| (w, WatchEvent::Deleted)));
            }
        }
    }

    fn end_session(&mut self, id: SessionId, pending: &mut Pending) {
        // Watches registered by the session die with it.
        for watchers in self.watches.values_mut() {
            watchers.retain(|(owner, _)| *owner != id);
        }
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            debug!("Removing ephemeral node {} of session {}", path, id);
            self.remove_node(&path, pending);
        }
    }
}

/// Shared node tree; clone it to hand the same ensemble to several threads.
#[derive(Clone)]
pub struct MemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), None));
        MemoryEnsemble {
            state: Arc::new(Mutex::new(EnsembleState {
                nodes,
                watches: HashMap::new(),
                sessions: HashMap::new(),
                next_session: 1,
                next_listener: 1,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EnsembleState> {
        // A panicking watcher never runs under this lock, so poisoning only
        // means a test thread died mid-call; the tree itself stays consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a new session.
    pub fn connect(&self) -> MemorySession {
        let mut state = self.lock();
        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            id,
            SessionState {
                status: SessionStatus::Connected,
                listeners: Vec::new(),
                fail_next: 0,
                lose_create_reply: false,
            },
        );
        debug!("Opened memory session {}", id);
        MemorySession {
            id,
            ensemble: self.clone(),
        }
    }

    /// Expire a session as the server would after a missed heartbeat:
    /// its ephemeral nodes disappear and its listeners see `Expired`.
    pub fn expire_session(&self, id: SessionId) {
        let mut pending = Pending::default();
        {
            let mut state = self.lock();
            let Some(session) = state.sessions.get_mut(&id) else {
                return;
            };
            if session.status == SessionStatus::Expired {
                return;
            }
            session.status = SessionStatus::Expired;
            let listeners: Vec<SessionListener> =
                session.listeners.iter().map(|(_, l)| l.clone()).collect();
            pending
                .listeners
                .extend(listeners.into_iter().map(|l| (l, SessionEvent::Expired)));
            state.end_session(id, &mut pending);
        }
        debug!("Expired memory session {}", id);
        pending.fire();
    }

    /// Whether a node exists, regardless of session.
    pub fn exists(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(path)
    }

    /// Child names of `path`, regardless of session. Empty if absent.
    pub fn children_of(&self, path: &str) -> Vec<String> {
        let state = self.lock();
        let mut names: Vec<String> = state
            .nodes
            .keys()
            .filter(|key| key.as_str() != path && split_path(key).0 == path)
            .map(|key| split_path(key).1.to_string())
            .collect();
        names.sort();
        names
    }

    /// Overwrite a node's data, firing `DataChanged` watches.
    pub fn set_data(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        let mut pending = Pending::default();
        {
            let mut state = self.lock();
            let node = state
                .nodes
                .get_mut(path)
                .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
            node.data = data.to_vec();
            if let Some(watchers) = state.watches.remove(path) {
                pending
                    .watches
                    .extend(watchers.into_iter().map(|(_, w)| (w, WatchEvent::DataChanged)));
            }
        }
        pending.fire();
        Ok(())
    }
}

/// One client session against a [`MemoryEnsemble`].
///
/// Dropping the session closes it, which removes its ephemeral nodes the
/// same way a crashed process would lose them.
pub struct MemorySession {
    id: SessionId,
    ensemble: MemoryEnsemble,
}

impl MemorySession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn ensemble(&self) -> &MemoryEnsemble {
        &self.ensemble
    }

    pub fn expire(&self) {
        self.ensemble.expire_session(self.id);
    }

    /// Simulate a dropped connection. Calls fail with `ConnectionLoss`
    /// until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.set_status(SessionStatus::Disconnected, SessionEvent::Disconnected);
    }

    pub fn reconnect(&self) {
        self.set_status(SessionStatus::Connected, SessionEvent::Connected);
    }

    fn set_status(&self, status: SessionStatus, event: SessionEvent) {
        let listeners: Vec<SessionListener> = {
            let mut state = self.ensemble.lock();
            let Some(session) = state.sessions.get_mut(&self.id) else {
                return;
            };
            if session.status == SessionStatus::Expired || session.status == status {
                return;
            }
            session.status = status;
            session.listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in listeners {
            listener(event);
        }
    }

    /// Fail the next `count` calls with `ConnectionLoss` before they apply.
    pub fn fail_next(&self, count: u32) {
        if let Some(session) = self.ensemble.lock().sessions.get_mut(&self.id) {
            session.fail_next = count;
        }
    }

    /// Apply the next create but report `ConnectionLoss` to the caller.
    pub fn lose_next_create_reply(&self) {
        if let Some(session) = self.ensemble.lock().sessions.get_mut(&self.id) {
            session.lose_create_reply = true;
        }
    }

    /// End the session cleanly.
    pub fn close(&self) {
        let mut pending = Pending::default();
        {
            let mut state = self.ensemble.lock();
            if state.sessions.remove(&self.id).is_none() {
                return;
            }
            state.end_session(self.id, &mut pending);
        }
        pending.fire();
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.close();
    }
}

impl CoordinationStore for MemorySession {
    fn ensure_path(&self, path: &str) -> StoreResult<()> {
        let mut state = self.ensemble.lock();
        state.session(self.id)?;
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            state
                .nodes
                .entry(current.clone())
                .or_insert_with(|| Node::new(Vec::new(), None));
        }
        Ok(())
    }

    fn create(&self, path_prefix: &str, data: &[u8], mode: CreateMode) -> StoreResult<String> {
        let mut state = self.ensemble.lock();
        let lose_reply = {
            let session = state.session(self.id)?;
            std::mem::take(&mut session.lose_create_reply)
        };

        let (parent, base) = split_path(path_prefix);
        let parent_node = state
            .nodes
            .get_mut(parent)
            .ok_or_else(|| StoreError::NoNode(parent.to_string()))?;

        let (path, owner) = match mode {
            CreateMode::Persistent => (path_prefix.to_string(), None),
            CreateMode::EphemeralSequential => {
                let seq = parent_node.next_seq;
                parent_node.next_seq += 1;
                (
                    join_path(parent, &format!("{}{:010}", base, seq)),
                    Some(self.id),
                )
            }
        };

        if state.nodes.contains_key(&path) {
            return Err(StoreError::NodeExists(path));
        }
        state.nodes.insert(path.clone(), Node::new(data.to_vec(), owner));

        if lose_reply {
            debug!("Dropping create reply for {}", path);
            return Err(StoreError::ConnectionLoss);
        }
        Ok(path)
    }

    fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        let mut state = self.ensemble.lock();
        state.session(self.id)?;
        if !state.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        Ok(state
            .nodes
            .keys()
            .filter(|key| key.as_str() != path && split_path(key).0 == path)
            .map(|key| split_path(key).1.to_string())
            .collect())
    }

    fn get_with_watch(&self, path: &str, watcher: Watcher) -> StoreResult<Option<Vec<u8>>> {
        let mut state = self.ensemble.lock();
        state.session(self.id)?;
        let Some(data) = state.nodes.get(path).map(|node| node.data.clone()) else {
            return Ok(None);
        };
        state
            .watches
            .entry(path.to_string())
            .or_default()
            .push((self.id, watcher));
        Ok(Some(data))
    }

    fn get(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut state = self.ensemble.lock();
        state.session(self.id)?;
        Ok(state.nodes.get(path).map(|node| node.data.clone()))
    }

    fn delete(&self, path: &str) -> StoreResult<()> {
        let mut pending = Pending::default();
        {
            let mut state = self.ensemble.lock();
            state.session(self.id)?;
            if !state.nodes.contains_key(path) {
                return Err(StoreError::NoNode(path.to_string()));
            }
            if state.has_children(path) {
                return Err(StoreError::Other(format!("node {} is not empty", path)));
            }
            state.remove_node(path, &mut pending);
        }
        pending.fire();
        Ok(())
    }

    fn add_session_listener(&self, listener: SessionListener) -> ListenerId {
        let mut state = self.ensemble.lock();
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        if let Some(session) = state.sessions.get_mut(&self.id) {
            session.listeners.push((id, listener));
        }
        id
    }

    fn remove_session_listener(&self, id: ListenerId) {
        if let Some(session) = self.ensemble.lock().sessions.get_mut(&self.id) {
            session.listeners.retain(|(listener_id, _)| *listener_id != id);
        }
    }
}
