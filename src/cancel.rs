use crate::sync::{AtomicBool, Condvar, Mutex, Ordering};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Signal returned by [`CancellationToken::checkpoint`] once cancellation has
/// been requested.
///
/// This is not a failure: a body that observes it is expected to return early,
/// typically by propagating it with `?`. Queues and graphs report a body that
/// returns this signal as cancelled rather than failed.
#[derive(Debug, Error, Copy, Clone, Default, PartialEq, Eq)]
#[error("cancellation observed")]
pub struct Cancelled;

/// Shared cooperative cancellation flag.
///
/// Cloning yields another handle to the same flag. Cancellation is never
/// preemptive: running code has to poll [`is_cancelled`](Self::is_cancelled),
/// call [`checkpoint`](Self::checkpoint) or sleep through
/// [`sleep`](Self::sleep) to notice it.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    cancelled: AtomicBool,
    sleepers: Mutex<()>,
    wake: Condvar,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                sleepers: Mutex::new(()),
                wake: Condvar::new(),
            }),
        }
    }

    /// Requests cancellation.
    ///
    /// Returns `true` for the call that actually flipped the flag and `false`
    /// for every later call.
    pub fn cancel(&self) -> bool {
        let TokenInner {
            cancelled,
            sleepers,
            wake,
        } = &*self.inner;
        if cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Taking the lock orders this notification after any sleeper's flag check.
        drop(sleepers.lock());
        wake.notify_all();
        true
    }

    /// Returns `true` once cancellation has been requested.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Returns `Err(Cancelled)` once cancellation has been requested.
    ///
    /// # Errors
    /// When the token is cancelled.
    #[inline]
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration` or until the token is cancelled, whichever comes
    /// first.
    ///
    /// Returns `true` if the sleep was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration)
    }

    /// Sleeps until `deadline` or until the token is cancelled.
    ///
    /// Returns `true` if the token is cancelled on return.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        let TokenInner {
            cancelled,
            sleepers,
            wake,
        } = &*self.inner;
        let guard = sleepers.lock();
        let timeout = deadline.saturating_duration_since(Instant::now());
        drop(wake.wait_while_for(guard, timeout, |_| {
            !cancelled.load(Ordering::Acquire)
        }));
        self.is_cancelled()
    }

    /// Returns `true` if both handles refer to the same flag.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn cancel_reports_first_call_only() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
        assert_eq!(token.checkpoint(), Err(Cancelled));
    }

    #[test]
    fn sleep_wakes_on_cancel() {
        let token = CancellationToken::new();
        let sleeper = {
            let token = token.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let cancelled = token.sleep(Duration::from_secs(30));
                (cancelled, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        let (cancelled, elapsed) = sleeper.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(10));
    }

    #[test]
    fn sleep_runs_full_duration_without_cancel() {
        let token = CancellationToken::new();
        let started = Instant::now();
        assert!(!token.sleep(Duration::from_millis(15)));
        assert!(started.elapsed() >= Duration::from_millis(15));
    }
}
