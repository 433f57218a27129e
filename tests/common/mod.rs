#![allow(dead_code)]

use seqlock::error::StoreResult;
use seqlock::store::{CreateMode, ListenerId, SessionListener, Watcher};
use seqlock::{
    CoordinationStore, LockController, LockOptions, MemoryEnsemble, MemorySession, RetryPolicy,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const ROOT: &str = "/lock";

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// A contender with its own session, as a separate process would have.
pub fn contender(ensemble: &MemoryEnsemble) -> (Arc<MemorySession>, LockController<MemorySession>) {
    let session = Arc::new(ensemble.connect());
    let options = LockOptions::new(ROOT).with_retry(fast_retry(5));
    let lock = LockController::new(session.clone(), options).unwrap();
    (session, lock)
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts)
        .with_max_interval(Duration::from_millis(2))
        .with_jitter(Duration::ZERO)
}

/// Block until `count` entries are queued under the lock root.
pub fn wait_for_queue(ensemble: &MemoryEnsemble, count: usize) {
    assert!(
        wait_until(Duration::from_secs(5), || ensemble.children_of(ROOT).len() == count),
        "expected {} queue entries, found {:?}",
        count,
        ensemble.children_of(ROOT)
    );
}

type CreateHook = Box<dyn FnOnce(&MemorySession) + Send>;
type WatchHook = Box<dyn FnOnce(&MemorySession, &str) + Send>;

/// A session that runs a one-off hook at a chosen point of the protocol,
/// to force interleavings that are otherwise down to luck.
pub struct HookedStore {
    inner: Arc<MemorySession>,
    after_create: Mutex<Option<CreateHook>>,
    before_watch: Mutex<Option<WatchHook>>,
}

impl HookedStore {
    pub fn new(inner: Arc<MemorySession>) -> Self {
        HookedStore {
            inner,
            after_create: Mutex::new(None),
            before_watch: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &MemorySession {
        &self.inner
    }

    /// Runs once, right after the next create reaches the store.
    pub fn after_create(&self, hook: impl FnOnce(&MemorySession) + Send + 'static) {
        *self.after_create.lock().unwrap() = Some(Box::new(hook));
    }

    /// Runs once, right before the next watch is armed, with the watched path.
    pub fn before_watch(&self, hook: impl FnOnce(&MemorySession, &str) + Send + 'static) {
        *self.before_watch.lock().unwrap() = Some(Box::new(hook));
    }
}

impl CoordinationStore for HookedStore {
    fn ensure_path(&self, path: &str) -> StoreResult<()> {
        self.inner.ensure_path(path)
    }

    fn create(&self, path_prefix: &str, data: &[u8], mode: CreateMode) -> StoreResult<String> {
        let result = self.inner.create(path_prefix, data, mode);
        let hook = self.after_create.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(&self.inner);
        }
        result
    }

    fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        self.inner.children(path)
    }

    fn get_with_watch(&self, path: &str, watcher: Watcher) -> StoreResult<Option<Vec<u8>>> {
        let hook = self.before_watch.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(&self.inner, path);
        }
        self.inner.get_with_watch(path, watcher)
    }

    fn get(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get(path)
    }

    fn delete(&self, path: &str) -> StoreResult<()> {
        self.inner.delete(path)
    }

    fn add_session_listener(&self, listener: SessionListener) -> ListenerId {
        self.inner.add_session_listener(listener)
    }

    fn remove_session_listener(&self, id: ListenerId) {
        self.inner.remove_session_listener(id)
    }
}

/// A contender whose session goes through a [`HookedStore`].
pub fn hooked_contender(
    ensemble: &MemoryEnsemble,
) -> (Arc<HookedStore>, LockController<HookedStore>) {
    let store = Arc::new(HookedStore::new(Arc::new(ensemble.connect())));
    let options = LockOptions::new(ROOT).with_retry(fast_retry(5));
    let lock = LockController::new(store.clone(), options).unwrap();
    (store, lock)
}
