use std::time::Duration;
use thiserror::Error;

/// Errors reported by a coordination store client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("connection to the coordination store was lost")]
    ConnectionLoss,

    #[error("coordination store session expired")]
    SessionExpired,

    #[error("node does not exist: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("coordination store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Transient errors may succeed when the same call is repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::ConnectionLoss)
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("coordination store unavailable after {attempts} attempts: {source}")]
    StoreUnavailable { attempts: u32, source: StoreError },

    #[error("lock on {root} not acquired within {duration:?}")]
    Timeout { root: String, duration: Duration },

    #[error("session lost while contending for {root}; work done under the lock is unsafe")]
    SessionLost { root: String },

    #[error("lock on {root} is not held")]
    NotHeld { root: String },

    #[error("lock on {root} is already held by this handle")]
    AlreadyHeld { root: String },

    #[error("acquisition of {root} was cancelled")]
    Cancelled { root: String },

    #[error("lock invariant broken for {root}: {message}")]
    StoreFatal { root: String, message: String },

    #[error("invalid lock path '{path}': {message}")]
    InvalidPath { path: String, message: String },

    #[error("Invalid duration format '{input}': {message}")]
    InvalidDuration { input: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LockError {
    pub fn exit_code(&self) -> i32 {
        match self {
            LockError::Timeout { .. } => 2,
            LockError::Cancelled { .. } => 3,
            _ => 1,
        }
    }

    /// True when the lock machinery itself broke, as opposed to the lock
    /// simply not being obtained in time.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LockError::SessionLost { .. }
                | LockError::StoreFatal { .. }
                | LockError::StoreUnavailable { .. }
                | LockError::Store(_)
        )
    }

    pub fn store_fatal(root: impl Into<String>, message: impl Into<String>) -> Self {
        LockError::StoreFatal {
            root: root.into(),
            message: message.into(),
        }
    }

    pub fn session_lost(root: impl Into<String>) -> Self {
        LockError::SessionLost { root: root.into() }
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
