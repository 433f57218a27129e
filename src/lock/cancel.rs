use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Wakeup = Box<dyn Fn() + Send>;

struct Inner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    wakers: Mutex<Vec<(u64, Wakeup)>>,
}

/// Cooperative cancellation for a pending acquisition.
///
/// Clone it into whichever thread decides to give up; the waiting
/// `acquire` observes the cancel at its suspension point.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let wakers = match self.inner.wakers.lock() {
            Ok(mut wakers) => std::mem::take(&mut *wakers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for (_, wake) in wakers {
            wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Run `wake` once when the token is cancelled. If it already is,
    /// `wake` runs immediately. The registration ends when the returned
    /// guard is dropped.
    pub(crate) fn on_cancel(&self, wake: Wakeup) -> CancelRegistration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut wakers) = self.inner.wakers.lock() {
            wakers.push((id, wake));
        }
        // cancel() may have drained the list before the push landed.
        if self.is_cancelled() {
            self.take(id).into_iter().for_each(|wake| wake());
        }
        CancelRegistration {
            token: self.clone(),
            id,
        }
    }

    fn take(&self, id: u64) -> Option<Wakeup> {
        let mut wakers = self.inner.wakers.lock().ok()?;
        let idx = wakers.iter().position(|(wid, _)| *wid == id)?;
        Some(wakers.swap_remove(idx).1)
    }
}

pub(crate) struct CancelRegistration {
    token: CancelToken,
    id: u64,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        self.token.take(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_wakes_registered_waiters_once() {
        let token = CancelToken::new();
        let woken = Arc::new(AtomicUsize::new(0));
        let counter = woken.clone();
        let _registration = token.on_cancel(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        token.cancel();
        token.cancel();

        assert!(token.is_cancelled());
        assert_eq!(woken.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registration_after_cancel_fires_immediately() {
        let token = CancelToken::new();
        token.cancel();

        let woken = Arc::new(AtomicBool::new(false));
        let flag = woken.clone();
        let _registration = token.on_cancel(Box::new(move || flag.store(true, Ordering::SeqCst)));

        assert!(woken.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dropped_registration_is_not_woken() {
        let token = CancelToken::new();
        let woken = Arc::new(AtomicBool::new(false));
        let flag = woken.clone();
        drop(token.on_cancel(Box::new(move || flag.store(true, Ordering::SeqCst))));

        token.cancel();
        assert!(!woken.load(Ordering::SeqCst));
    }
}
