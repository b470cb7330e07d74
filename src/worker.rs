mod locals;
mod pool;

pub use self::{locals::LocalStorage, pool::WorkerPool};
use crate::{
    cancel::{Cancelled, CancellationToken},
    sync::{Condvar, Mutex},
    types::Priority,
    utils::panic_message,
};
use core::sync::atomic::{AtomicU64, Ordering};
use derive_more::{Debug, Display};
use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use tracing::{trace, warn};

/// Error returned by blocking waits whose deadline elapsed.
///
/// The awaited work is left untouched: it keeps running, and the caller
/// decides whether to wait again, cancel it, or abandon it.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
#[error("timed out after {timeout:?}")]
#[non_exhaustive]
pub struct TimeoutError {
    /// The timeout that elapsed.
    pub timeout: Duration,
}

/// Opaque identity of a worker, unique within the process.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("worker-{_0}")]
pub struct WorkerId(u64);

impl WorkerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// How a worker's body ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// The body returned and the worker was never cancelled.
    Completed,
    /// The body returned after cancellation had been requested.
    Cancelled,
    /// The body panicked; carries the panic message.
    Panicked(String),
}

/// Configures and spawns a worker thread.
#[must_use]
#[derive(Debug, Default)]
pub struct WorkerBuilder {
    name: Option<String>,
    priority: Priority,
    locals: LocalStorage,
}

impl WorkerBuilder {
    /// Starts from an unnamed worker with default priority and an empty
    /// local table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the name used for the OS thread and in logs.
    pub fn name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the priority hint.
    pub fn priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }

    /// Seeds one entry of the worker's local table.
    pub fn local<T: Any + Send + Sync>(self, key: impl Into<String>, value: T) -> Self {
        self.locals.set(key, value);
        self
    }

    /// Copies every entry of `locals` into the worker's local table.
    ///
    /// Nothing is inherited implicitly: a parent that wants its children to see
    /// its values passes its own table here.
    pub fn locals_from(self, locals: &LocalStorage) -> Self {
        self.locals.copy_from(locals);
        self
    }

    /// Starts `body` on a new OS thread and returns immediately.
    ///
    /// # Errors
    /// If the OS refuses to create the thread.
    pub fn spawn<F>(self, body: F) -> io::Result<WorkerHandle>
    where
        F: FnOnce(&WorkerContext) + Send + 'static,
    {
        let Self {
            name,
            priority,
            locals,
        } = self;
        let id = WorkerId::next();
        let shared = Arc::new(WorkerShared {
            id,
            name,
            priority,
            token: CancellationToken::new(),
            locals,
            exit: Mutex::new(None),
            exited: Condvar::new(),
            thread: Mutex::new(None),
        });
        let thread_name = match &shared.name {
            Some(name) => format!("{name} ({priority})"),
            None => format!("{id} ({priority})"),
        };
        let context = WorkerContext {
            shared: Arc::clone(&shared),
        };
        let thread = thread::Builder::new().name(thread_name).spawn(move || {
            let span = tracing::trace_span!("worker", id = %context.id(), priority = %context.priority());
            let _entered = span.enter();
            trace!("worker starting");
            let exit = match panic::catch_unwind(AssertUnwindSafe(|| body(&context))) {
                Ok(()) if context.is_cancelled() => WorkerExit::Cancelled,
                Ok(()) => WorkerExit::Completed,
                Err(payload) => {
                    let message = panic_message(&*payload);
                    warn!(panic = %message, "worker body panicked");
                    WorkerExit::Panicked(message)
                }
            };
            trace!(?exit, "worker exiting");
            context.shared.finish(exit);
        })?;
        *shared.thread.lock() = Some(thread);
        Ok(WorkerHandle { shared })
    }
}

/// Starts `body` on a new worker with the given priority.
///
/// # Errors
/// If the OS refuses to create the thread.
pub fn spawn<F>(priority: Priority, body: F) -> io::Result<WorkerHandle>
where
    F: FnOnce(&WorkerContext) + Send + 'static,
{
    WorkerBuilder::new().priority(priority).spawn(body)
}

#[derive(Debug)]
struct WorkerShared {
    id: WorkerId,
    name: Option<String>,
    priority: Priority,
    token: CancellationToken,
    locals: LocalStorage,
    exit: Mutex<Option<WorkerExit>>,
    exited: Condvar,
    #[debug(skip)]
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerShared {
    fn finish(&self, exit: WorkerExit) {
        *self.exit.lock() = Some(exit);
        self.exited.notify_all();
    }

    fn reap(&self) {
        // The body has already returned; joining only waits for the thread to unwind.
        if let Some(thread) = self.thread.lock().take() {
            drop(thread.join());
        }
    }
}

/// Handle to a running or finished worker.
///
/// Dropping the handle detaches the worker; it keeps running to completion.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    /// Identity of the worker.
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    /// Name given at spawn time.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    /// Priority hint given at spawn time.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.shared.priority
    }

    /// Requests cooperative cancellation.
    ///
    /// The body only notices when it polls its token; blocking calls and
    /// loops that never poll are not interrupted.
    pub fn cancel(&self) {
        if self.shared.token.cancel() {
            trace!(id = %self.shared.id, "worker cancellation requested");
        }
    }

    /// Returns `true` once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Returns `true` once the body has returned or panicked.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.exit.lock().is_some()
    }

    /// Stores a value in the worker's local table.
    pub fn set_local<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.shared.locals.set(key, value);
    }

    /// Reads a value from the worker's local table.
    #[must_use]
    pub fn local<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.shared.locals.get(key)
    }

    /// The worker's local table.
    #[must_use]
    pub fn locals(&self) -> &LocalStorage {
        &self.shared.locals
    }

    /// Blocks until the worker's body ends.
    pub fn join(&self) -> WorkerExit {
        let exit = self
            .shared
            .exited
            .wait_while(self.shared.exit.lock(), |exit| exit.is_none())
            .clone()
            .expect("WorkerHandle::join: [1]");
        self.shared.reap();
        exit
    }

    /// Blocks until the worker's body ends or `timeout` elapses.
    ///
    /// # Errors
    /// When the worker is still running at the deadline. The worker is left
    /// running; call [`cancel`](Self::cancel) if it should stop.
    pub fn join_timeout(&self, timeout: Duration) -> Result<WorkerExit, TimeoutError> {
        let exit = {
            let (exit, timed_out) =
                self.shared
                    .exited
                    .wait_while_for(self.shared.exit.lock(), timeout, |exit| exit.is_none());
            if timed_out {
                return Err(TimeoutError { timeout });
            }
            exit.clone().expect("WorkerHandle::join_timeout: [1]")
        };
        self.shared.reap();
        Ok(exit)
    }
}

/// View of the current worker handed to its body.
#[derive(Debug)]
pub struct WorkerContext {
    shared: Arc<WorkerShared>,
}

impl WorkerContext {
    /// Identity of the current worker.
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    /// Priority hint of the current worker.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.shared.priority
    }

    /// The worker's cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.shared.token
    }

    /// Returns `true` once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Returns `Err(Cancelled)` once cancellation has been requested.
    ///
    /// # Errors
    /// When the worker is cancelled.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        self.shared.token.checkpoint()
    }

    /// Reads a value from the worker's local table.
    #[must_use]
    pub fn local<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.shared.locals.get(key)
    }

    /// Stores a value in the worker's local table.
    pub fn set_local<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.shared.locals.set(key, value);
    }

    /// The worker's local table, e.g. to pass to
    /// [`WorkerBuilder::locals_from`] when spawning a child.
    #[must_use]
    pub fn locals(&self) -> &LocalStorage {
        &self.shared.locals
    }
}
