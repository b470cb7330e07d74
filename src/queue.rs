mod barrier_cell;
mod item;

pub use self::{
    barrier_cell::BarrierCell,
    item::{WorkItem, WorkItemFailure, WorkResult},
};
use self::item::Completion;
use crate::{
    cancel::{Cancelled, CancellationToken},
    config::{QueueConfig, QueueMode},
    sync::{AtomicU64, Condvar, Mutex, Ordering},
    types::{IndexMap, Priority},
    utils::panic_message,
    worker::{LocalStorage, TimeoutError, WorkerBuilder, WorkerPool},
};
use derive_more::Debug;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::{
    any::Any,
    borrow::Cow,
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, debug_span, warn};

/// Publishes an item's outcome to its [`WorkItem`].
type Resolve = Box<dyn FnOnce() + Send>;
/// Runs an item, or skips it when handed no context. The outcome is only
/// published through the returned [`Resolve`], after the queue's bookkeeping.
type EntryFn = Box<dyn FnOnce(Option<&ItemContext<'_>>) -> Resolve + Send>;

/// Labelled execution context with a FIFO backlog.
///
/// A serial queue runs one item at a time and completes items in submission
/// order. A parallel queue runs up to its `max_concurrency` items at once and
/// starts them in submission order. Items run on the threads of a
/// [`WorkerPool`]; by default the process-wide [`WorkerPool::shared`].
///
/// Clones are handles to the same queue.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

#[derive(Debug)]
struct QueueInner {
    config: QueueConfig,
    pool: WorkerPool,
    specifics: LocalStorage,
    next_seq: AtomicU64,
    state: Mutex<QueueState>,
    idle: Condvar,
}

#[derive(Debug, Default)]
struct QueueState {
    backlog: VecDeque<Entry>,
    /// Tokens of started items, keyed by sequence number.
    in_flight: IndexMap<u64, CancellationToken>,
    barrier_running: bool,
    suspended: bool,
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    priority: Priority,
    barrier: bool,
    token: CancellationToken,
    /// Runs the body when given a context, reports cancellation otherwise.
    #[debug(skip)]
    run: EntryFn,
}

/// Entries released by one scheduling pass.
#[derive(Debug, Default)]
struct Ready {
    start: Vec<Entry>,
    skipped: Vec<Entry>,
    idle: bool,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.backlog.is_empty() && self.in_flight.is_empty()
    }

    /// Moves entries from the head of the backlog to the in-flight set while
    /// the concurrency contract allows it. Cancelled entries at the head are
    /// dropped from the backlog without starting.
    fn take_ready(&mut self, max_concurrency: usize) -> Ready {
        let mut ready = Ready::default();
        while !self.suspended && !self.barrier_running {
            let Some(front) = self.backlog.front() else {
                break;
            };
            if front.token.is_cancelled() {
                ready.skipped.extend(self.backlog.pop_front());
                continue;
            }
            if front.barrier {
                if !self.in_flight.is_empty() {
                    break;
                }
                self.barrier_running = true;
            } else if self.in_flight.len() >= max_concurrency {
                break;
            }
            let entry = self
                .backlog
                .pop_front()
                .expect("QueueState::take_ready: [1]");
            self.in_flight.insert(entry.seq, entry.token.clone());
            ready.start.push(entry);
        }
        ready.idle = self.is_idle();
        ready
    }
}

impl QueueInner {
    fn label(&self) -> &str {
        &self.config.label
    }

    fn prepare<T, F>(&self, priority: Priority, barrier: bool, body: F) -> (Entry, WorkItem<T>)
    where
        T: Send + 'static,
        F: FnOnce(&ItemContext<'_>) -> anyhow::Result<T> + Send + 'static,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let slot = Arc::new(Completion::new());
        let item = WorkItem {
            seq,
            token: token.clone(),
            slot: Arc::clone(&slot),
        };
        let run: EntryFn = Box::new(move |context| {
            let result = match context {
                Some(context) if !context.is_cancelled() => run_body(context, body),
                _ => Err(WorkItemFailure::Cancelled),
            };
            Box::new(move || slot.resolve(result))
        });
        let entry = Entry {
            seq,
            priority,
            barrier,
            token,
            run,
        };
        (entry, item)
    }

    fn enqueue(self: &Arc<Self>, entry: Entry) {
        debug!(queue = %self.label(), seq = entry.seq, barrier = entry.barrier, "work item submitted");
        let ready = {
            let mut state = self.state.lock();
            state.backlog.push_back(entry);
            state.take_ready(self.config.mode.max_concurrency())
        };
        self.launch(ready);
    }

    fn launch(self: &Arc<Self>, ready: Ready) {
        let Ready {
            start,
            skipped,
            idle,
        } = ready;
        for entry in skipped {
            debug!(queue = %self.label(), seq = entry.seq, "work item cancelled before start");
            (entry.run)(None)();
        }
        if idle {
            self.idle.notify_all();
        }
        for entry in start {
            let queue = Arc::clone(self);
            self.pool
                .execute(entry.priority, Box::new(move || queue.run(entry)));
        }
    }

    fn run(self: Arc<Self>, entry: Entry) {
        let Entry {
            seq,
            priority,
            barrier,
            token,
            run,
        } = entry;
        let span = debug_span!("work_item", queue = %self.label(), seq, barrier);
        let resolve = {
            let _entered = span.enter();
            let context = ItemContext {
                queue: &self,
                token: &token,
                priority,
                seq,
                barrier,
            };
            run(Some(&context))
        };
        // Waiters and callbacks must see the item gone from `running()`.
        self.finish(seq, barrier);
        let _entered = span.enter();
        // The body is already guarded; this catches a panicking completion callback.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(resolve)) {
            warn!(panic = %panic_message(&*payload), "completion callback panicked");
        }
    }

    fn finish(self: &Arc<Self>, seq: u64, barrier: bool) {
        let ready = {
            let mut state = self.state.lock();
            let removed = state.in_flight.swap_remove(&seq);
            assert!(removed.is_some(), "TaskQueue::finish: [1]");
            if barrier {
                state.barrier_running = false;
            }
            state.take_ready(self.config.mode.max_concurrency())
        };
        self.launch(ready);
    }
}

fn run_body<T>(
    context: &ItemContext<'_>,
    body: impl FnOnce(&ItemContext<'_>) -> anyhow::Result<T>,
) -> WorkResult<T> {
    debug!(priority = %context.priority, "work item starting");
    match panic::catch_unwind(AssertUnwindSafe(|| body(context))) {
        Ok(Ok(value)) => {
            debug!("work item finished");
            Ok(value)
        }
        Ok(Err(err)) if err.is::<Cancelled>() => {
            debug!("work item observed cancellation");
            Err(WorkItemFailure::Cancelled)
        }
        Ok(Err(err)) => {
            let error = format!("{err:#}");
            warn!(%error, "work item failed");
            Err(WorkItemFailure::Failed(err))
        }
        Err(payload) => {
            let message = panic_message(&*payload);
            warn!(panic = %message, "work item panicked");
            Err(WorkItemFailure::Panicked(message))
        }
    }
}

impl TaskQueue {
    /// Creates a queue backed by the process-wide [`WorkerPool::shared`].
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self::with_pool(config, WorkerPool::shared())
    }

    /// Creates a queue whose items run on `pool`.
    #[must_use]
    pub fn with_pool(config: QueueConfig, pool: WorkerPool) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                pool,
                specifics: LocalStorage::new(),
                next_seq: AtomicU64::new(0),
                state: Mutex::new(QueueState::default()),
                idle: Condvar::new(),
            }),
        }
    }

    /// Serial queue with default priority.
    #[must_use]
    pub fn serial(label: impl Into<Cow<'static, str>>) -> Self {
        Self::new(QueueConfig::serial(label))
    }

    /// Parallel queue with default priority.
    ///
    /// # Panics
    /// If `max_concurrency` is zero.
    #[must_use]
    pub fn parallel(label: impl Into<Cow<'static, str>>, max_concurrency: usize) -> Self {
        Self::new(QueueConfig::parallel(label, max_concurrency))
    }

    /// Label given at creation.
    #[must_use]
    pub fn label(&self) -> &str {
        self.inner.label()
    }

    /// Concurrency contract.
    #[must_use]
    pub fn mode(&self) -> QueueMode {
        self.inner.config.mode
    }

    /// Priority given to items submitted without an explicit one.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.inner.config.priority
    }

    /// Configuration the queue was created with.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Returns `true` if both handles refer to the same queue.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Appends `body` to the backlog. It starts as soon as the queue is not
    /// suspended and a slot is free.
    pub fn submit<T, F>(&self, body: F) -> WorkItem<T>
    where
        T: Send + 'static,
        F: FnOnce(&ItemContext<'_>) -> anyhow::Result<T> + Send + 'static,
    {
        self.submit_with(self.priority(), body)
    }

    /// Like [`submit`](Self::submit), with an explicit priority used when the
    /// item competes for pool threads.
    pub fn submit_with<T, F>(&self, priority: Priority, body: F) -> WorkItem<T>
    where
        T: Send + 'static,
        F: FnOnce(&ItemContext<'_>) -> anyhow::Result<T> + Send + 'static,
    {
        let (entry, item) = self.inner.prepare(priority, false, body);
        self.inner.enqueue(entry);
        item
    }

    /// Appends a barrier item.
    ///
    /// The barrier starts once every item submitted before it has finished,
    /// runs alone, and holds back every item submitted after it until it is
    /// done.
    pub fn submit_barrier<T, F>(&self, body: F) -> WorkItem<T>
    where
        T: Send + 'static,
        F: FnOnce(&ItemContext<'_>) -> anyhow::Result<T> + Send + 'static,
    {
        let (entry, item) = self.inner.prepare(self.priority(), true, body);
        self.inner.enqueue(entry);
        item
    }

    /// Submits `body` and blocks until it has run.
    ///
    /// Calling this from an item of the same serial queue deadlocks.
    ///
    /// # Errors
    /// The item's failure.
    pub fn sync<T, F>(&self, body: F) -> WorkResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ItemContext<'_>) -> anyhow::Result<T> + Send + 'static,
    {
        self.submit(body).wait()
    }

    /// Submits `body` as a barrier and blocks until it has run.
    ///
    /// # Errors
    /// The item's failure.
    pub fn sync_barrier<T, F>(&self, body: F) -> WorkResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ItemContext<'_>) -> anyhow::Result<T> + Send + 'static,
    {
        self.submit_barrier(body).wait()
    }

    /// Appends `body` to the backlog once `delay` has elapsed.
    ///
    /// Cancelling the returned item during the delay keeps it out of the
    /// backlog entirely.
    pub fn submit_after<T, F>(&self, delay: Duration, body: F) -> WorkItem<T>
    where
        T: Send + 'static,
        F: FnOnce(&ItemContext<'_>) -> anyhow::Result<T> + Send + 'static,
    {
        let (entry, item) = self.inner.prepare(self.priority(), false, body);
        let queue = Arc::clone(&self.inner);
        let token = item.token.clone();
        let slot = Arc::clone(&item.slot);
        let timer = WorkerBuilder::new()
            .name(format!("{}-timer", self.label()))
            .priority(self.priority())
            .spawn(move |_| {
                if token.sleep(delay) {
                    debug!(queue = %queue.label(), seq = entry.seq, "delayed work item cancelled");
                    (entry.run)(None)();
                } else {
                    queue.enqueue(entry);
                }
            });
        if let Err(err) = timer {
            warn!(queue = %self.label(), %err, "failed to start delay timer");
            slot.resolve(Err(WorkItemFailure::Failed(
                anyhow::Error::new(err).context("failed to start delay timer"),
            )));
        }
        item
    }

    /// Stops items from starting. Running items are not affected.
    pub fn suspend(&self) {
        self.inner.state.lock().suspended = true;
        debug!(queue = %self.label(), "queue suspended");
    }

    /// Lifts a suspension and starts backlog items up to the concurrency
    /// limit, in backlog order.
    pub fn resume(&self) {
        let ready = {
            let mut state = self.inner.state.lock();
            state.suspended = false;
            state.take_ready(self.inner.config.mode.max_concurrency())
        };
        debug!(queue = %self.label(), starting = ready.start.len(), "queue resumed");
        self.inner.launch(ready);
    }

    /// Returns `true` while the queue is suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.inner.state.lock().suspended
    }

    /// Cancels every item in the backlog and signals cancellation to every
    /// running item.
    ///
    /// Backlog items resolve as [`WorkItemFailure::Cancelled`] right away,
    /// even while the queue is suspended.
    pub fn cancel_all(&self) {
        let ready = {
            let mut state = self.inner.state.lock();
            for token in state.in_flight.values() {
                token.cancel();
            }
            let skipped: Vec<_> = state.backlog.drain(..).collect();
            for entry in &skipped {
                entry.token.cancel();
            }
            Ready {
                start: Vec::new(),
                skipped,
                idle: state.is_idle(),
            }
        };
        debug!(queue = %self.label(), cancelled = ready.skipped.len(), "queue cancelled");
        self.inner.launch(ready);
    }

    /// Blocks until the backlog is empty and no item is running.
    ///
    /// A suspended queue with a non-empty backlog is never idle.
    pub fn wait_idle(&self) {
        drop(
            self.inner
                .idle
                .wait_while(self.inner.state.lock(), |state| !state.is_idle()),
        );
    }

    /// Like [`wait_idle`](Self::wait_idle), giving up after `timeout`.
    ///
    /// # Errors
    /// When the queue was still busy at the deadline.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> Result<(), TimeoutError> {
        let (_state, timed_out) =
            self.inner
                .idle
                .wait_while_for(self.inner.state.lock(), timeout, |state| !state.is_idle());
        if timed_out {
            Err(TimeoutError { timeout })
        } else {
            Ok(())
        }
    }

    /// Number of items waiting in the backlog.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.state.lock().backlog.len()
    }

    /// Number of items currently running.
    #[must_use]
    pub fn running(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Attaches a value to the queue, readable by its items through
    /// [`ItemContext::specific`].
    pub fn set_specific<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.specifics.set(key, value);
    }

    /// Reads a value attached with [`set_specific`](Self::set_specific).
    #[must_use]
    pub fn specific<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.inner.specifics.get(key)
    }
}

/// View of the running item handed to its body.
#[derive(Debug)]
pub struct ItemContext<'a> {
    #[debug(skip)]
    queue: &'a Arc<QueueInner>,
    token: &'a CancellationToken,
    priority: Priority,
    seq: u64,
    barrier: bool,
}

impl ItemContext<'_> {
    /// Label of the queue running the item.
    #[must_use]
    pub fn label(&self) -> &str {
        self.queue.label()
    }

    /// Handle to the queue running the item.
    #[must_use]
    pub fn queue(&self) -> TaskQueue {
        TaskQueue {
            inner: Arc::clone(self.queue),
        }
    }

    /// Sequence number of the item, as returned by [`WorkItem::seq`].
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Priority the item was submitted with.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Returns `true` if the item was submitted as a barrier.
    #[must_use]
    pub fn is_barrier(&self) -> bool {
        self.barrier
    }

    /// The item's cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        self.token
    }

    /// Returns `true` once the item is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns `Err(Cancelled)` once the item is cancelled, for use with `?`.
    ///
    /// # Errors
    /// When the item is cancelled.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        self.token.checkpoint()
    }

    /// Reads a value attached to the running queue with
    /// [`TaskQueue::set_specific`].
    #[must_use]
    pub fn specific<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.queue.specifics.get(key)
    }
}

/// Runs `body(i)` for every `i` in `0..iterations` in parallel and returns
/// once every call has returned.
pub fn concurrent_perform(iterations: usize, body: impl Fn(usize) + Send + Sync) {
    (0..iterations).into_par_iter().for_each(body);
}
