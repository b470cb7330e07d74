use crate::{
    queue::TaskQueue,
    sync::{AtomicUsize, Condvar, Mutex, MutexGuard, Ordering},
    worker::TimeoutError,
};
use derive_more::Debug;
use std::{sync::Arc, time::Duration};

/// Guard returned by [`Lock::lock`]; the lock is released when it is dropped.
pub type LockGuard<'a, T> = MutexGuard<'a, T>;

/// Mutual exclusion around a value of type `T`.
#[derive(Debug)]
pub struct Lock<T> {
    inner: Mutex<T>,
}

impl<T: Default> Default for Lock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Lock<T> {
    /// Wraps `value` in a new lock.
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Blocks until the lock is acquired.
    pub fn lock(&self) -> LockGuard<'_, T> {
        self.inner.lock()
    }

    /// Runs `work` with exclusive access and returns its result.
    pub fn modify<R>(&self, work: impl FnOnce(&mut T) -> R) -> R {
        work(&mut self.inner.lock())
    }

    /// Returns a copy of the current value.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.inner.lock().clone()
    }
}

/// Counting semaphore.
///
/// `acquire` blocks while no permit is available; dropping the returned
/// [`SemaphorePermit`] gives the permit back. [`wait`](Self::wait) and
/// [`signal`](Self::signal) are the unpaired variants, used when one thread
/// waits for a signal raised by another.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

/// A permit taken from a [`Semaphore`]. Released on drop.
#[must_use = "the permit is released as soon as it is dropped"]
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.signal();
    }
}

impl SemaphorePermit<'_> {
    /// Keeps the permit taken forever.
    pub fn forget(self) {
        core::mem::forget(self);
    }
}

impl Semaphore {
    /// Creates a semaphore holding `permits` permits.
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Number of permits currently available.
    pub fn available_permits(&self) -> usize {
        *self.permits.lock()
    }

    /// Blocks until a permit is available and takes it.
    pub fn acquire(&self) -> SemaphorePermit<'_> {
        let mut permits = self.available.wait_while(self.permits.lock(), |permits| *permits == 0);
        *permits -= 1;
        SemaphorePermit { semaphore: self }
    }

    /// Takes a permit if one is available right now.
    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return None;
        }
        *permits -= 1;
        Some(SemaphorePermit { semaphore: self })
    }

    /// Blocks until a permit is available or `timeout` elapses.
    ///
    /// # Errors
    /// When no permit became available in time.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<SemaphorePermit<'_>, TimeoutError> {
        let (mut permits, timed_out) =
            self.available
                .wait_while_for(self.permits.lock(), timeout, |permits| *permits == 0);
        if timed_out {
            return Err(TimeoutError { timeout });
        }
        *permits -= 1;
        Ok(SemaphorePermit { semaphore: self })
    }

    /// Takes a permit without handing out a guard. Pair with [`signal`](Self::signal).
    pub fn wait(&self) {
        self.acquire().forget();
    }

    /// Returns one permit and wakes a waiter.
    pub fn signal(&self) {
        *self.permits.lock() += 1;
        self.available.notify_one();
    }
}

/// Lock-free counter.
#[derive(Debug)]
pub struct AtomicCounter {
    value: AtomicUsize,
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new(0)
    }
}

impl AtomicCounter {
    /// Creates a counter starting at `initial`.
    pub fn new(initial: usize) -> Self {
        Self {
            value: AtomicUsize::new(initial),
        }
    }

    /// Adds one and returns the new value.
    pub fn increment(&self) -> usize {
        self.add(1)
    }

    /// Adds `delta` and returns the new value. Wraps around on overflow,
    /// like the stored value.
    pub fn add(&self, delta: usize) -> usize {
        self.value.fetch_add(delta, Ordering::AcqRel).wrapping_add(delta)
    }

    /// Subtracts one and returns the new value, or `None` if the counter was
    /// already zero (in which case it is left unchanged).
    pub fn decrement(&self) -> Option<usize> {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            let next = current.checked_sub(1)?;
            match self
                .value
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Current value.
    pub fn get(&self) -> usize {
        self.value.load(Ordering::Acquire)
    }
}

/// Tracks a set of outstanding tasks and lets callers wait for all of them.
///
/// Every [`enter`](Self::enter) must be balanced by exactly one
/// [`leave`](Self::leave). Cloning yields another handle to the same group.
#[derive(Debug, Clone)]
pub struct WaitGroup {
    inner: Arc<GroupInner>,
}

#[derive(Debug)]
struct GroupInner {
    state: Mutex<GroupState>,
    drained: Condvar,
}

#[derive(Debug, Default)]
struct GroupState {
    outstanding: usize,
    #[debug(skip)]
    notifications: Vec<Box<dyn FnOnce() + Send>>,
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    /// Creates an empty group.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GroupInner {
                state: Mutex::new(GroupState::default()),
                drained: Condvar::new(),
            }),
        }
    }

    /// Registers one more outstanding task.
    pub fn enter(&self) {
        self.inner.state.lock().outstanding += 1;
    }

    /// Marks one outstanding task as done.
    ///
    /// When the last task leaves, waiters are woken and pending
    /// [`notify`](Self::notify) bodies are handed to their queues.
    ///
    /// # Panics
    /// If called more often than [`enter`](Self::enter).
    pub fn leave(&self) {
        let notifications = {
            let mut state = self.inner.state.lock();
            state.outstanding = state
                .outstanding
                .checked_sub(1)
                .expect("WaitGroup::leave: unbalanced call");
            if state.outstanding != 0 {
                return;
            }
            core::mem::take(&mut state.notifications)
        };
        self.inner.drained.notify_all();
        for notification in notifications {
            notification();
        }
    }

    /// Number of tasks that entered and have not left yet.
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().outstanding
    }

    /// Blocks until no task is outstanding.
    pub fn wait(&self) {
        drop(
            self.inner
                .drained
                .wait_while(self.inner.state.lock(), |state| state.outstanding != 0),
        );
    }

    /// Blocks until no task is outstanding or `timeout` elapses.
    ///
    /// # Errors
    /// When tasks were still outstanding at the deadline.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), TimeoutError> {
        let (_state, timed_out) = self.inner.drained.wait_while_for(
            self.inner.state.lock(),
            timeout,
            |state| state.outstanding != 0,
        );
        if timed_out {
            Err(TimeoutError { timeout })
        } else {
            Ok(())
        }
    }

    /// Submits `body` to `queue` once no task is outstanding.
    ///
    /// If the group is already empty, `body` is submitted right away.
    pub fn notify(&self, queue: &TaskQueue, body: impl FnOnce() + Send + 'static) {
        let queue = queue.clone();
        let submit = move || {
            // The completion handle is not needed; failures are logged by the queue.
            drop(queue.submit(move |_| {
                body();
                Ok(())
            }));
        };
        let mut state = self.inner.state.lock();
        if state.outstanding == 0 {
            drop(state);
            submit();
        } else {
            state.notifications.push(Box::new(submit));
        }
    }
}
