mod types;

pub use types::{LockError, Result, StoreError, StoreResult};
