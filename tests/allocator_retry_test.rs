mod common;

use common::{contender, fast_retry, hooked_contender, wait_for_queue, ROOT};
use seqlock::lock::{FailureCause, SequencedNodeAllocator};
use seqlock::store::CoordinationStore;
use seqlock::{
    AcquireOutcome, LockController, LockError, LockOptions, LockStatus, MemoryEnsemble,
    StoreError,
};
use std::sync::Arc;
use std::thread;

#[test]
fn test_transient_failures_are_retried_invisibly() {
    let ensemble = MemoryEnsemble::new();
    let (session, mut lock) = contender(&ensemble);

    session.fail_next(3);
    assert_eq!(lock.acquire(None).unwrap(), AcquireOutcome::Held);
    assert_eq!(ensemble.children_of(ROOT).len(), 1);
}

#[test]
fn test_persistent_connection_loss_escalates() {
    let ensemble = MemoryEnsemble::new();
    let session = Arc::new(ensemble.connect());
    let options = LockOptions::new(ROOT).with_retry(fast_retry(3));
    let mut lock = LockController::new(session.clone(), options).unwrap();

    session.fail_next(100);
    let result = lock.acquire(None);

    assert!(matches!(
        result,
        Err(LockError::StoreUnavailable {
            attempts: 3,
            source: StoreError::ConnectionLoss
        })
    ));
    assert_eq!(lock.status(), LockStatus::Failed);
    assert_eq!(lock.failure_cause(), Some(FailureCause::StoreUnavailable));
}

#[test]
fn test_lost_create_reply_adopts_existing_entry() {
    let ensemble = MemoryEnsemble::new();
    let (session, mut lock) = contender(&ensemble);

    session.lose_next_create_reply();
    assert!(lock.acquire(None).unwrap().is_held());

    // No second entry was queued behind the one whose reply was lost.
    let children = ensemble.children_of(ROOT);
    assert_eq!(children.len(), 1);
    assert_eq!(lock.node_path().unwrap(), format!("{}/{}", ROOT, children[0]));

    lock.release().unwrap();
    assert!(ensemble.children_of(ROOT).is_empty());
}

#[test]
fn test_lost_reply_on_last_attempt_leaves_no_entry() {
    let ensemble = MemoryEnsemble::new();
    let session = Arc::new(ensemble.connect());
    let options = LockOptions::new(ROOT).with_retry(fast_retry(1));
    let mut lock = LockController::new(session.clone(), options).unwrap();

    session.lose_next_create_reply();
    let result = lock.acquire(None);

    assert!(matches!(
        result,
        Err(LockError::StoreUnavailable { attempts: 1, .. })
    ));
    assert!(ensemble.children_of(ROOT).is_empty());

    let (_other_session, mut other) = contender(&ensemble);
    assert_eq!(other.try_acquire().unwrap(), AcquireOutcome::Held);
}

#[test]
fn test_failed_lookup_after_lost_reply_does_not_queue_twice() {
    let ensemble = MemoryEnsemble::new();
    let (store, mut lock) = hooked_contender(&ensemble);

    // The create lands but its reply is lost, and the first lookup for it
    // fails too.
    store.session().lose_next_create_reply();
    store.after_create(|session| session.fail_next(1));

    assert!(lock.acquire(None).unwrap().is_held());
    let children = ensemble.children_of(ROOT);
    assert_eq!(children.len(), 1);
    assert_eq!(lock.node_path().unwrap(), format!("{}/{}", ROOT, children[0]));
}

#[test]
fn test_expired_session_is_not_retried() {
    let ensemble = MemoryEnsemble::new();
    let (session, mut lock) = contender(&ensemble);
    session.expire();

    let result = lock.acquire(None);
    assert!(matches!(result, Err(LockError::SessionLost { .. })));
    assert_eq!(lock.failure_cause(), Some(FailureCause::SessionLost));
}

#[test]
fn test_snapshot_includes_own_entry() {
    let ensemble = MemoryEnsemble::new();
    let session = Arc::new(ensemble.connect());
    let allocator = SequencedNodeAllocator::new(session, "/queue", fast_retry(3));

    let path = allocator.create_entry("attempt", b"").unwrap();
    let snapshot = allocator.snapshot().unwrap();

    assert_eq!(path, "/queue/attempt__lock__0000000000");
    assert_eq!(snapshot, vec!["attempt__lock__0000000000".to_string()]);
}

#[test]
fn test_remove_entry_is_idempotent() {
    let ensemble = MemoryEnsemble::new();
    let session = Arc::new(ensemble.connect());
    let allocator = SequencedNodeAllocator::new(session.clone(), "/queue", fast_retry(3));

    let path = allocator.create_entry("attempt", b"").unwrap();
    assert!(allocator.remove_entry(&path).unwrap());
    assert!(!allocator.remove_entry(&path).unwrap());
    assert!(matches!(session.delete(&path), Err(StoreError::NoNode(_))));
}

#[test]
fn test_check_held_detects_missing_node() {
    let ensemble = MemoryEnsemble::new();
    let (_session, mut lock) = contender(&ensemble);
    lock.acquire(None).unwrap();
    assert!(lock.check_held().is_ok());

    // Someone else deletes our entry out from under us.
    let intruder = ensemble.connect();
    intruder.delete(&lock.node_path().unwrap()).unwrap();

    let result = lock.check_held();
    assert!(matches!(result, Err(LockError::StoreFatal { .. })));
    assert_eq!(lock.failure_cause(), Some(FailureCause::StoreFatal));
    assert!(result.unwrap_err().is_fatal());
}

#[test]
fn test_check_held_when_not_held() {
    let ensemble = MemoryEnsemble::new();
    let (_session, mut lock) = contender(&ensemble);

    assert!(matches!(lock.check_held(), Err(LockError::NotHeld { .. })));
}

#[test]
fn test_contenders_lists_identifiers_in_queue_order() {
    let ensemble = MemoryEnsemble::new();
    let identified = |name: &str| {
        let session = Arc::new(ensemble.connect());
        let options = LockOptions::new(ROOT)
            .with_identifier(name)
            .with_retry(fast_retry(5));
        LockController::new(session, options).unwrap()
    };

    let mut alpha = identified("alpha");
    alpha.acquire(None).unwrap();

    let mut handles = Vec::new();
    for (queued, name) in ["beta", "gamma"].into_iter().enumerate() {
        let mut lock = identified(name);
        handles.push(thread::spawn(move || {
            lock.acquire(None).unwrap();
            lock.release().unwrap();
        }));
        wait_for_queue(&ensemble, queued + 2);
    }
    let (_session, anonymous) = contender(&ensemble);

    assert_eq!(
        anonymous.contenders().unwrap(),
        vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()]
    );

    alpha.release().unwrap();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(anonymous.contenders().unwrap().is_empty());
}

#[test]
fn test_invalid_root_is_rejected() {
    let ensemble = MemoryEnsemble::new();
    let session = Arc::new(ensemble.connect());

    let result = LockController::with_root(session, "relative/path");
    assert!(matches!(result, Err(LockError::InvalidPath { .. })));
}
