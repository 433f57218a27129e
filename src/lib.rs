//! Fair distributed mutual exclusion over a ZooKeeper-style coordination store

pub mod error;
pub mod lock;
pub mod store;
pub mod utils;

pub use error::{LockError, Result, StoreError};
pub use lock::{
    AcquireOutcome, CancelToken, LockController, LockGuard, LockOptions, LockStatus,
    LockStrategy, ReleaseOutcome, RetryPolicy,
};
pub use store::{CoordinationStore, MemoryEnsemble, MemorySession};
