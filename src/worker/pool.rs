use crate::{
    config::PoolConfig,
    sync::{Condvar, Mutex},
    types::Priority,
    utils::panic_message,
    worker::{WorkerBuilder, WorkerContext},
};
use core::cmp::Ordering;
use derive_more::Debug;
use std::{
    collections::BinaryHeap,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, OnceLock},
};
use tracing::{debug, error, trace};

pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// Elastic pool of [`Worker`](crate::worker)s that runs submitted jobs.
///
/// Threads are created on demand, up to [`PoolConfig::max_threads`], and exit
/// after staying idle for [`PoolConfig::keep_alive`]. Waiting jobs start in
/// order of descending priority and, within one priority, in submission
/// order.
///
/// Clones share the pool. When the last clone is dropped, threads finish the
/// jobs still waiting and then exit.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    handle: Arc<PoolHandle>,
}

#[derive(Debug)]
struct PoolHandle {
    shared: Arc<PoolShared>,
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.job_ready.notify_all();
    }
}

#[derive(Debug)]
struct PoolShared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    job_ready: Condvar,
}

#[derive(Debug, Default)]
struct PoolState {
    jobs: BinaryHeap<PoolJob>,
    /// Threads blocked waiting for a job.
    idle: usize,
    /// Threads alive, idle or busy.
    threads: usize,
    next_seq: u64,
    spawned: u64,
    shutdown: bool,
}

#[derive(Debug)]
struct PoolJob {
    priority: Priority,
    seq: u64,
    #[debug(skip)]
    run: Job,
}

impl PartialEq for PoolJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PoolJob {}

impl PartialOrd for PoolJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PoolJob {
    // `BinaryHeap` pops the greatest job: highest priority, then lowest sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl WorkerPool {
    /// Creates an empty pool. No thread is started until the first job.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            handle: Arc::new(PoolHandle {
                shared: Arc::new(PoolShared {
                    config,
                    state: Mutex::new(PoolState::default()),
                    job_ready: Condvar::new(),
                }),
            }),
        }
    }

    /// Process-wide pool with the default configuration, created on first use.
    #[must_use]
    pub fn shared() -> Self {
        static SHARED: OnceLock<WorkerPool> = OnceLock::new();
        SHARED.get_or_init(Self::default).clone()
    }

    /// Configuration the pool was created with.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.handle.shared.config
    }

    /// Number of threads currently alive.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.handle.shared.state.lock().threads
    }

    /// Number of jobs waiting for a thread.
    #[must_use]
    pub fn queued_jobs(&self) -> usize {
        self.handle.shared.state.lock().jobs.len()
    }

    /// Hands `job` to the pool.
    pub(crate) fn execute(&self, priority: Priority, job: Job) {
        let shared = &self.handle.shared;
        let mut state = shared.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.push(PoolJob {
            priority,
            seq,
            run: job,
        });
        if state.idle >= state.jobs.len() {
            drop(state);
            shared.job_ready.notify_one();
            return;
        }
        if state.threads >= shared.config.max_threads.get() {
            trace!(queued = state.jobs.len(), "pool saturated, job waits");
            return;
        }
        state.threads += 1;
        state.spawned += 1;
        let number = state.spawned;
        drop(state);
        Self::spawn_thread(shared, number);
    }

    fn spawn_thread(shared: &Arc<PoolShared>, number: u64) {
        let name = format!("{}-{number}", shared.config.thread_name);
        let thread_shared = Arc::clone(shared);
        let spawned = WorkerBuilder::new()
            .name(name)
            .spawn(move |context| run_pool_thread(&thread_shared, context));
        match spawned {
            Ok(worker) => debug!(worker = %worker.id(), "pool thread started"),
            Err(err) => {
                let mut state = shared.state.lock();
                state.threads -= 1;
                error!(%err, threads = state.threads, "failed to start pool thread");
            }
        }
    }
}

fn run_pool_thread(shared: &PoolShared, context: &WorkerContext) {
    let mut state = shared.state.lock();
    loop {
        if let Some(job) = state.jobs.pop() {
            drop(state);
            let PoolJob { priority, seq, run } = job;
            trace!(%priority, seq, "pool job starting");
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(run)) {
                error!(panic = %panic_message(&*payload), "pool job panicked");
            }
            state = shared.state.lock();
            continue;
        }
        if state.shutdown {
            break;
        }
        state.idle += 1;
        let (guard, timed_out) = shared
            .job_ready
            .wait_timeout(state, shared.config.keep_alive);
        state = guard;
        state.idle -= 1;
        if timed_out && state.jobs.is_empty() {
            break;
        }
    }
    state.threads -= 1;
    trace!(worker = %context.id(), threads = state.threads, "pool thread retiring");
}
