use crate::error::{StoreError, StoreResult};
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::warn;

/// How long `acquire` is willing to wait in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrategy {
    Wait,
    NoWait,
    Timeout(Duration),
}

impl LockStrategy {
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(duration) => LockStrategy::Timeout(duration),
            None => LockStrategy::Wait,
        }
    }

    /// Time budget, if any. `NoWait` is a zero budget.
    pub fn budget(&self) -> Option<Duration> {
        match self {
            LockStrategy::Wait => None,
            LockStrategy::NoWait => Some(Duration::ZERO),
            LockStrategy::Timeout(duration) => Some(*duration),
        }
    }

    pub fn deadline(&self, start: Instant) -> Option<Instant> {
        self.budget().map(|budget| start + budget)
    }
}

/// Bounded exponential backoff for transient store failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(1000),
            multiplier: 1.5,
            jitter: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or
    /// the attempt budget is spent.
    pub(crate) fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> StoreResult<T>,
    ) -> Result<T, RetryError> {
        let mut attempt = 1;
        let mut current_interval = self.initial_interval;
        let mut rng = rand::thread_rng();

        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    // Calculate sleep time with backoff + jitter
                    let base_interval = current_interval.min(self.max_interval);
                    let jitter_ms = self.jitter.as_millis() as u64;
                    let jitter = if jitter_ms == 0 {
                        Duration::ZERO
                    } else {
                        Duration::from_millis(rng.gen_range(0..jitter_ms))
                    };
                    warn!(
                        "{} failed ({}), retrying in {:?} (attempt {}/{})",
                        what,
                        e,
                        base_interval + jitter,
                        attempt,
                        self.max_attempts
                    );
                    std::thread::sleep(base_interval + jitter);

                    current_interval = Duration::from_millis(
                        (current_interval.as_millis() as f64 * self.multiplier) as u64,
                    );
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    })
                }
                Err(e) => return Err(RetryError::Failed(e)),
            }
        }
    }
}

/// Per-controller settings.
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub root: String,
    /// Stored as the queue entry's data so other contenders can see who
    /// is queued.
    pub identifier: Option<String>,
    pub retry: RetryPolicy,
}

impl LockOptions {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            identifier: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Debug)]
pub(crate) enum RetryError {
    Exhausted { attempts: u32, last: StoreError },
    Failed(StoreError),
}
