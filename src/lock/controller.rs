use crate::error::{LockError, Result};
use crate::lock::acquisition::{LockOptions, LockStrategy, RetryPolicy};
use crate::lock::allocator::SequencedNodeAllocator;
use crate::lock::cancel::CancelToken;
use crate::lock::path::validate_root;
use crate::lock::resolver::{attempt_of, queue_order, resolve, QueuePosition};
use crate::store::{
    split_path, CoordinationStore, ListenerId, SessionEvent, WatchEvent, Watcher,
};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Observable state of a lock handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Init,
    Queued,
    Watching,
    Held,
    Released,
    TimedOut,
    Failed,
}

/// Why a handle ended up in [`LockStatus::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    SessionLost,
    Cancelled,
    StoreUnavailable,
    StoreFatal,
}

impl FailureCause {
    fn of(err: &LockError) -> Self {
        match err {
            LockError::SessionLost { .. } => FailureCause::SessionLost,
            LockError::Cancelled { .. } => FailureCause::Cancelled,
            LockError::StoreUnavailable { .. } => FailureCause::StoreUnavailable,
            _ => FailureCause::StoreFatal,
        }
    }
}

/// The queue entry path only exists in the states where it is valid.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LockState {
    Init,
    /// Entry creation in flight; the node name is not known yet.
    Creating { attempt: String },
    Queued { node: String },
    Watching { node: String, predecessor: String },
    Held { node: String },
    Released,
    TimedOut,
    Failed(FailureCause),
}

impl LockState {
    fn status(&self) -> LockStatus {
        match self {
            LockState::Init => LockStatus::Init,
            LockState::Creating { .. } | LockState::Queued { .. } => LockStatus::Queued,
            LockState::Watching { .. } => LockStatus::Watching,
            LockState::Held { .. } => LockStatus::Held,
            LockState::Released => LockStatus::Released,
            LockState::TimedOut => LockStatus::TimedOut,
            LockState::Failed(_) => LockStatus::Failed,
        }
    }

    fn node(&self) -> Option<&str> {
        match self {
            LockState::Queued { node }
            | LockState::Watching { node, .. }
            | LockState::Held { node } => Some(node.as_str()),
            _ => None,
        }
    }

    fn attempt(&self) -> Option<String> {
        match self {
            LockState::Creating { attempt } => Some(attempt.clone()),
            _ => {
                let (_, name) = split_path(self.node()?);
                attempt_of(name).map(str::to_string)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Held,
    TimedOut,
}

impl AcquireOutcome {
    pub fn is_held(self) -> bool {
        self == AcquireOutcome::Held
    }

    /// Treat a timeout as an error, for callers that cannot proceed without
    /// the lock.
    pub fn into_result(self, root: &str, duration: Duration) -> Result<()> {
        match self {
            AcquireOutcome::Held => Ok(()),
            AcquireOutcome::TimedOut => Err(LockError::Timeout {
                root: root.to_string(),
                duration,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotHeld,
}

impl ReleaseOutcome {
    pub fn into_result(self, root: &str) -> Result<()> {
        match self {
            ReleaseOutcome::Released => Ok(()),
            ReleaseOutcome::NotHeld => Err(LockError::NotHeld {
                root: root.to_string(),
            }),
        }
    }
}

/// Delivered to [`LockController::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    /// The store session ended while the handle was queued or held. Work
    /// done under the lock must be treated as unsafe.
    SessionLost {
        root: String,
        /// `None` if the session went while the entry was being created.
        node: Option<String>,
        was_held: bool,
    },
}

enum Wake {
    Watch(WatchEvent),
    Cancelled,
    SessionLost,
}

struct Shared {
    state: LockState,
    waker: Option<Sender<Wake>>,
    subscribers: Vec<Sender<LockEvent>>,
    /// Attempts whose entry may still sit in the queue of a live session.
    /// Removed on reconnect, on the next acquire or release, and on drop.
    orphans: Vec<String>,
}

impl Shared {
    fn keep_orphan(&mut self, attempt: &str) {
        if !self.orphans.iter().any(|kept| kept == attempt) {
            self.orphans.push(attempt.to_string());
        }
    }

    fn forget_orphan(&mut self, attempt: &str) {
        self.orphans.retain(|kept| kept != attempt);
    }
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn remove_orphans<S: CoordinationStore + ?Sized>(
    allocator: &SequencedNodeAllocator<S>,
    shared: &Mutex<Shared>,
) {
    let orphans = std::mem::take(&mut lock_shared(shared).orphans);
    let mut kept = Vec::new();
    for attempt in orphans {
        match allocator.remove_attempt(&attempt) {
            Ok(true) => debug!("Removed queue entry of abandoned attempt {}", attempt),
            Ok(false) => {}
            Err(LockError::SessionLost { .. }) => {
                debug!("Entry of attempt {} went with its session", attempt)
            }
            Err(e) => {
                debug!("Keeping attempt {} for a later cleanup: {}", attempt, e);
                kept.push(attempt);
            }
        }
    }
    if !kept.is_empty() {
        let mut shared = lock_shared(shared);
        for attempt in kept {
            shared.keep_orphan(&attempt);
        }
    }
}

/// One contender for a lock root.
///
/// Acquisition queues an ephemeral sequential node under the root and
/// waits on a one-shot watch of the immediate predecessor only, so each
/// release wakes exactly one waiter and waiters are served in creation
/// order. A controller can be reused for several acquisitions one after
/// another; it is not reentrant.
pub struct LockController<S: CoordinationStore + ?Sized> {
    allocator: SequencedNodeAllocator<S>,
    identifier: Option<String>,
    shared: Arc<Mutex<Shared>>,
    listener: ListenerId,
}

impl<S: CoordinationStore + ?Sized> LockController<S> {
    pub fn new(store: Arc<S>, options: LockOptions) -> Result<Self> {
        validate_root(&options.root)?;

        let shared = Arc::new(Mutex::new(Shared {
            state: LockState::Init,
            waker: None,
            subscribers: Vec::new(),
            orphans: Vec::new(),
        }));

        let weak_shared = Arc::downgrade(&shared);
        let weak_store = Arc::downgrade(&store);
        let root = options.root.clone();
        let retry = options.retry.clone();
        let listener = store.add_session_listener(Arc::new(move |event: SessionEvent| {
            on_session_event(&weak_shared, &weak_store, &root, &retry, event)
        }));

        Ok(Self {
            allocator: SequencedNodeAllocator::new(store, options.root, options.retry),
            identifier: options.identifier,
            shared,
            listener,
        })
    }

    pub fn with_root(store: Arc<S>, root: impl Into<String>) -> Result<Self> {
        Self::new(store, LockOptions::new(root))
    }

    pub fn root(&self) -> &str {
        self.allocator.root()
    }

    pub fn status(&self) -> LockStatus {
        self.shared().state.status()
    }

    /// Why the last attempt failed, if it did.
    pub fn failure_cause(&self) -> Option<FailureCause> {
        match self.shared().state {
            LockState::Failed(cause) => Some(cause),
            _ => None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.status() == LockStatus::Held
    }

    /// Full path of the queue entry while queued or held.
    pub fn node_path(&self) -> Option<String> {
        self.shared().state.node().map(str::to_string)
    }

    /// Receive a [`LockEvent`] whenever the session is lost under a queued
    /// or held handle.
    pub fn subscribe(&self) -> Receiver<LockEvent> {
        let (tx, rx) = mpsc::channel();
        self.shared().subscribers.push(tx);
        rx
    }

    /// Wait for the lock. `None` waits indefinitely.
    pub fn acquire(&mut self, timeout: Option<Duration>) -> Result<AcquireOutcome> {
        self.acquire_with(LockStrategy::from_timeout(timeout))
    }

    /// Take the lock only if nobody is ahead in the queue.
    pub fn try_acquire(&mut self) -> Result<AcquireOutcome> {
        self.acquire_with(LockStrategy::NoWait)
    }

    pub fn acquire_with(&mut self, strategy: LockStrategy) -> Result<AcquireOutcome> {
        self.run_acquire(strategy, None)
    }

    /// Like [`acquire`](Self::acquire), but gives up with
    /// [`LockError::Cancelled`] once `cancel` fires.
    pub fn acquire_cancellable(
        &mut self,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<AcquireOutcome> {
        self.run_acquire(LockStrategy::from_timeout(timeout), Some(cancel))
    }

    /// Acquire and wrap the lock in a guard that releases it on drop.
    /// `Ok(None)` means the timeout elapsed.
    pub fn lock(&mut self, timeout: Option<Duration>) -> Result<Option<LockGuard<'_, S>>> {
        match self.acquire(timeout)? {
            AcquireOutcome::Held => Ok(Some(LockGuard { controller: self })),
            AcquireOutcome::TimedOut => Ok(None),
        }
    }

    /// Run `f` while holding the lock. The lock is released on every exit
    /// path, including a panic inside `f`.
    ///
    /// If the lock was lost while `f` ran, its result is discarded and the
    /// reason is returned as an error.
    pub fn with_lock<T>(
        &mut self,
        timeout: Option<Duration>,
        f: impl FnOnce(&mut LockGuard<'_, S>) -> T,
    ) -> Result<Option<T>> {
        let Some(mut guard) = self.lock(timeout)? else {
            return Ok(None);
        };
        let value = f(&mut guard);
        match guard.release()? {
            ReleaseOutcome::Released => Ok(Some(value)),
            ReleaseOutcome::NotHeld => Err(self.lost_error()),
        }
    }

    /// Release a held lock. Any other state yields `NotHeld`.
    pub fn release(&mut self) -> Result<ReleaseOutcome> {
        let node = {
            let mut shared = self.shared();
            match std::mem::replace(&mut shared.state, LockState::Released) {
                LockState::Held { node } => node,
                other => {
                    debug!("Release on {} ignored: lock not held", self.root());
                    shared.state = other;
                    drop(shared);
                    self.discard_orphans();
                    return Ok(ReleaseOutcome::NotHeld);
                }
            }
        };

        match self.allocator.remove_entry(&node) {
            Ok(true) => {
                info!("Released lock {}", node);
                Ok(ReleaseOutcome::Released)
            }
            Ok(false) => {
                warn!("Lock node {} was already gone on release", node);
                Ok(ReleaseOutcome::Released)
            }
            Err(e) => {
                warn!("Failed to delete lock node {}: {}", node, e);
                self.shared().state = LockState::Failed(FailureCause::of(&e));
                Err(e)
            }
        }
    }

    /// Re-check against the store that this handle still holds the lock.
    ///
    /// A missing own node, or a contender ahead of it, means mutual
    /// exclusion may already be broken; the handle moves to `Failed`.
    pub fn check_held(&mut self) -> Result<()> {
        let Some(node) = self.held_node() else {
            return Err(LockError::NotHeld {
                root: self.root().to_string(),
            });
        };
        let (_, own_name) = split_path(&node);

        let snapshot = match self.allocator.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.fail_if_held(FailureCause::of(&e));
                return Err(e);
            }
        };
        let message = match resolve(own_name, &snapshot) {
            QueuePosition::Holder => return Ok(()),
            QueuePosition::Missing => format!("own node {} missing while held", node),
            QueuePosition::Waiting { predecessor, .. } => {
                format!("{} is queued ahead of held node {}", predecessor, node)
            }
        };
        warn!("{}", message);
        self.fail_if_held(FailureCause::StoreFatal);
        Err(LockError::store_fatal(self.root(), message))
    }

    /// Identifiers of all contenders in queue order, holder first. Entries
    /// without an identifier are listed by node name.
    pub fn contenders(&self) -> Result<Vec<String>> {
        let snapshot = self.allocator.snapshot()?;
        let mut contenders = Vec::new();
        for name in queue_order(&snapshot) {
            match self.allocator.read(name)? {
                Some(data) if !data.is_empty() => {
                    contenders.push(String::from_utf8_lossy(&data).into_owned())
                }
                Some(_) => contenders.push(name.to_string()),
                None => {}
            }
        }
        Ok(contenders)
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        lock_shared(&self.shared)
    }

    fn held_node(&self) -> Option<String> {
        match &self.shared().state {
            LockState::Held { node } => Some(node.clone()),
            _ => None,
        }
    }

    fn discard_orphans(&self) {
        remove_orphans(&self.allocator, &self.shared);
    }

    /// Error describing why a handle that was held no longer is.
    fn lost_error(&self) -> LockError {
        let root = self.root();
        match self.failure_cause() {
            Some(FailureCause::SessionLost) => LockError::session_lost(root),
            Some(FailureCause::StoreFatal) => {
                LockError::store_fatal(root, "lock was lost while held")
            }
            _ => LockError::NotHeld {
                root: root.to_string(),
            },
        }
    }

    fn fail_if_held(&self, cause: FailureCause) {
        let mut shared = self.shared();
        if matches!(shared.state, LockState::Held { .. }) {
            shared.state = LockState::Failed(cause);
        }
    }

    fn run_acquire(
        &mut self,
        strategy: LockStrategy,
        cancel: Option<&CancelToken>,
    ) -> Result<AcquireOutcome> {
        self.discard_orphans();

        let root = self.root().to_string();
        let start = Instant::now();
        let deadline = strategy.deadline(start);

        let (tx, rx) = mpsc::channel();
        {
            let mut shared = self.shared();
            match shared.state {
                LockState::Held { .. } => return Err(LockError::AlreadyHeld { root }),
                LockState::Creating { .. }
                | LockState::Queued { .. }
                | LockState::Watching { .. } => {
                    return Err(LockError::store_fatal(root, "acquisition already in progress"))
                }
                _ => {}
            }
            shared.state = LockState::Init;
            shared.waker = Some(tx.clone());
        }

        let _registration = cancel.map(|token| {
            let tx = tx.clone();
            token.on_cancel(Box::new(move || {
                let _ = tx.send(Wake::Cancelled);
            }))
        });

        if cancel.map_or(false, CancelToken::is_cancelled) {
            self.finish_without_node(FailureCause::Cancelled);
            return Err(LockError::Cancelled { root });
        }

        debug!("Acquiring lock {} (strategy: {:?})", root, strategy);

        let attempt = Uuid::new_v4().simple().to_string();
        self.shared().state = LockState::Creating {
            attempt: attempt.clone(),
        };
        let data = self.identifier.clone().unwrap_or_default();
        let node = match self.allocator.create_entry(&attempt, data.as_bytes()) {
            Ok(node) => node,
            Err(e) => return Err(self.creation_failed(&attempt, e)),
        };

        let outcome = match self.enter(LockState::Queued { node: node.clone() }) {
            Ok(()) => self.wait_in_queue(&node, deadline, &tx, &rx),
            Err(e) => Err(e),
        };
        self.finish(node, start, outcome)
    }

    /// Resolve, arm, suspend, repeat. Never touches the store while
    /// suspended.
    fn wait_in_queue(
        &self,
        node: &str,
        deadline: Option<Instant>,
        tx: &Sender<Wake>,
        rx: &Receiver<Wake>,
    ) -> Result<AcquireOutcome> {
        let root = self.root();
        let (_, own_name) = split_path(node);

        loop {
            // Snapshot strictly after our own node exists.
            let snapshot = self.allocator.snapshot()?;
            let (rank, predecessor) = match resolve(own_name, &snapshot) {
                QueuePosition::Holder => return Ok(AcquireOutcome::Held),
                QueuePosition::Missing => {
                    return Err(LockError::store_fatal(
                        root,
                        format!("queue entry {} vanished while waiting", node),
                    ))
                }
                QueuePosition::Waiting { rank, predecessor } => (rank, predecessor),
            };

            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Ok(AcquireOutcome::TimedOut);
            }

            self.enter(LockState::Watching {
                node: node.to_string(),
                predecessor: predecessor.clone(),
            })?;

            let armed = self.allocator.watch(&predecessor, || -> Watcher {
                let tx = tx.clone();
                Box::new(move |event: WatchEvent| {
                    let _ = tx.send(Wake::Watch(event));
                })
            })?;
            if !armed {
                // Predecessor left between snapshot and arming.
                debug!("Predecessor {} already gone, re-resolving", predecessor);
                self.enter(LockState::Queued {
                    node: node.to_string(),
                })?;
                continue;
            }
            debug!("{} waiting at rank {} on {}", own_name, rank, predecessor);

            let wake = match deadline {
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                Some(d) => rx.recv_timeout(d.saturating_duration_since(Instant::now())),
            };
            match wake {
                Ok(Wake::Watch(event)) => {
                    debug!("Watch on {} fired ({:?})", predecessor, event);
                    self.enter(LockState::Queued {
                        node: node.to_string(),
                    })?;
                }
                Ok(Wake::Cancelled) => {
                    return Err(LockError::Cancelled {
                        root: root.to_string(),
                    })
                }
                Ok(Wake::SessionLost) => return Err(LockError::session_lost(root)),
                Err(RecvTimeoutError::Timeout) => return Ok(AcquireOutcome::TimedOut),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(LockError::store_fatal(root, "wake channel closed"))
                }
            }
        }
    }

    /// Move between the waiting states unless the session was lost
    /// underneath us.
    fn enter(&self, next: LockState) -> Result<()> {
        let mut shared = self.shared();
        if shared.state == LockState::Failed(FailureCause::SessionLost) {
            return Err(LockError::session_lost(self.root()));
        }
        shared.state = next;
        Ok(())
    }

    fn finish(
        &mut self,
        node: String,
        start: Instant,
        outcome: Result<AcquireOutcome>,
    ) -> Result<AcquireOutcome> {
        let session_lost = {
            let mut shared = self.shared();
            shared.waker = None;
            let lost = shared.state == LockState::Failed(FailureCause::SessionLost);
            if !lost && matches!(outcome, Ok(AcquireOutcome::Held)) {
                shared.state = LockState::Held { node: node.clone() };
            }
            lost
        };

        let outcome = match outcome {
            Ok(AcquireOutcome::Held) if !session_lost => {
                info!("Acquired lock {} after {:?}", node, start.elapsed());
                return Ok(AcquireOutcome::Held);
            }
            _ if session_lost => Err(LockError::session_lost(self.root())),
            other => other,
        };

        // Every non-held exit removes the entry so nobody queues behind a
        // phantom.
        let removed = self.allocator.remove_entry(&node);

        let (_, name) = split_path(&node);
        let attempt = attempt_of(name).unwrap_or(name);
        let mut shared = self.shared();
        match removed {
            Ok(_) | Err(LockError::SessionLost { .. }) => shared.forget_orphan(attempt),
            Err(e) => {
                warn!(
                    "Could not remove queue entry {} ({}); retrying later",
                    node, e
                );
                shared.keep_orphan(attempt);
            }
        }
        match outcome {
            Ok(_) => {
                debug!("Timed out waiting for {} after {:?}", node, start.elapsed());
                shared.state = LockState::TimedOut;
                Ok(AcquireOutcome::TimedOut)
            }
            Err(e) => {
                debug!("Acquisition of {} failed: {}", node, e);
                shared.state = LockState::Failed(FailureCause::of(&e));
                Err(e)
            }
        }
    }

    fn finish_without_node(&self, cause: FailureCause) {
        let mut shared = self.shared();
        shared.waker = None;
        shared.state = LockState::Failed(cause);
    }

    /// The create did not yield a node. A lost session takes precedence
    /// over the store error; an entry the store may still hold is kept
    /// for cleanup.
    fn creation_failed(&self, attempt: &str, err: LockError) -> LockError {
        let mut shared = self.shared();
        shared.waker = None;
        let err = if shared.state == LockState::Failed(FailureCause::SessionLost) {
            LockError::session_lost(self.root())
        } else {
            err
        };
        if !matches!(err, LockError::SessionLost { .. }) {
            shared.keep_orphan(attempt);
        }
        debug!("Creating a queue entry under {} failed: {}", self.root(), err);
        shared.state = LockState::Failed(FailureCause::of(&err));
        err
    }
}

impl<S: CoordinationStore + ?Sized> Drop for LockController<S> {
    fn drop(&mut self) {
        if self.is_held() {
            if let Err(e) = self.release() {
                warn!("Failed to release {} on drop (non-fatal): {}", self.root(), e);
            }
        }
        self.discard_orphans();
        let store = self.allocator.store();
        store.remove_session_listener(self.listener);

        if self.shared().orphans.is_empty() {
            return;
        }
        // Nothing else retries once the handle is gone; the session's next
        // reconnect does.
        debug!("Leaving stale entries under {} to the next reconnect", self.root());
        let shared = self.shared.clone();
        let weak_store = Arc::downgrade(store);
        let root = self.root().to_string();
        let retry = self.allocator.retry().clone();
        store.add_session_listener(Arc::new(move |event: SessionEvent| {
            if event != SessionEvent::Connected {
                return;
            }
            if let Some(store) = weak_store.upgrade() {
                let allocator = SequencedNodeAllocator::new(store, root.as_str(), retry.clone());
                remove_orphans(&allocator, &shared);
            }
        }));
    }
}

fn on_session_event<S: CoordinationStore + ?Sized>(
    shared: &Weak<Mutex<Shared>>,
    store: &Weak<S>,
    root: &str,
    retry: &RetryPolicy,
    event: SessionEvent,
) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    if !event.is_loss() {
        // Back online: entries of attempts abandoned while disconnected
        // would otherwise block the queue for the life of the session.
        if let Some(store) = store.upgrade() {
            let allocator = SequencedNodeAllocator::new(store, root, retry.clone());
            remove_orphans(&allocator, &shared);
        }
        return;
    }

    let mut shared = lock_shared(&shared);
    let Some(attempt) = shared.state.attempt() else {
        return;
    };
    let node = shared.state.node().map(str::to_string);
    let was_held = matches!(shared.state, LockState::Held { .. });

    warn!(
        "Session {:?} while {} {}; lock can no longer be trusted",
        event,
        if was_held { "holding" } else { "queued on" },
        node.as_deref().unwrap_or(root)
    );
    shared.state = LockState::Failed(FailureCause::SessionLost);
    if event == SessionEvent::Disconnected {
        shared.keep_orphan(&attempt);
    }
    if let Some(waker) = &shared.waker {
        let _ = waker.send(Wake::SessionLost);
    }
    let lost = LockEvent::SessionLost {
        root: root.to_string(),
        node,
        was_held,
    };
    shared
        .subscribers
        .retain(|subscriber| subscriber.send(lost.clone()).is_ok());
}

/// Scoped ownership of a held lock; dropping it releases the lock.
pub struct LockGuard<'a, S: CoordinationStore + ?Sized> {
    controller: &'a mut LockController<S>,
}

impl<'a, S: CoordinationStore + ?Sized> LockGuard<'a, S> {
    pub fn node_path(&self) -> Option<String> {
        self.controller.node_path()
    }

    pub fn status(&self) -> LockStatus {
        self.controller.status()
    }

    pub fn check_held(&mut self) -> Result<()> {
        self.controller.check_held()
    }

    pub fn release(mut self) -> Result<ReleaseOutcome> {
        // Drop sees the lock already released and does nothing.
        self.controller.release()
    }
}

impl<'a, S: CoordinationStore + ?Sized> Drop for LockGuard<'a, S> {
    fn drop(&mut self) {
        if self.controller.is_held() {
            if let Err(e) = self.controller.release() {
                warn!("Failed to release lock on scope exit: {}", e);
            }
        }
    }
}
