mod acquisition;
mod allocator;
mod cancel;
mod controller;
mod path;
pub mod resolver;

pub use acquisition::{LockOptions, LockStrategy, RetryPolicy};
pub use allocator::SequencedNodeAllocator;
pub use cancel::CancelToken;
pub use controller::{
    AcquireOutcome, FailureCause, LockController, LockEvent, LockGuard, LockStatus,
    ReleaseOutcome,
};
pub use path::validate_root;
pub use resolver::{resolve, QueuePosition};
