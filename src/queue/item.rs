use crate::{
    cancel::CancellationToken,
    sync::{Condvar, Mutex},
    worker::TimeoutError,
};
use derive_more::Debug;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

/// Why a work item did not produce a value.
///
/// Failures are local to their item: they never stop the queue or affect any
/// other item.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkItemFailure {
    /// The body returned an error.
    #[error("work item failed: {0:#}")]
    Failed(anyhow::Error),
    /// The body panicked; carries the panic message.
    #[error("work item panicked: {0}")]
    Panicked(String),
    /// The item was cancelled before it started, or its body observed
    /// cancellation and returned [`Cancelled`](crate::cancel::Cancelled).
    #[error("work item cancelled")]
    Cancelled,
}

impl WorkItemFailure {
    /// Returns `true` for [`WorkItemFailure::Cancelled`].
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Outcome of a work item.
pub type WorkResult<T> = Result<T, WorkItemFailure>;

type Callback<T> = Box<dyn FnOnce(WorkResult<T>) + Send>;

#[derive(Debug)]
enum SlotState<T> {
    Pending(#[debug(skip)] Option<Callback<T>>),
    Ready(#[debug(skip)] WorkResult<T>),
    Taken,
}

/// Single-assignment slot carrying a work item's outcome to whoever consumes
/// it: a blocked waiter or a registered callback.
#[derive(Debug)]
pub(crate) struct Completion<T> {
    state: Mutex<SlotState<T>>,
    resolved: Condvar,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending(None)),
            resolved: Condvar::new(),
        }
    }

    /// Stores the outcome, or hands it to the registered callback.
    ///
    /// # Panics
    /// If the slot was already resolved.
    pub(crate) fn resolve(&self, result: WorkResult<T>) {
        let mut state = self.state.lock();
        match core::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Pending(Some(callback)) => {
                drop(state);
                callback(result);
            }
            SlotState::Pending(None) => {
                *state = SlotState::Ready(result);
                drop(state);
                self.resolved.notify_all();
            }
            SlotState::Ready(_) | SlotState::Taken => {
                unreachable!("Completion::resolve: resolved twice")
            }
        }
    }

    fn is_resolved(&self) -> bool {
        !matches!(*self.state.lock(), SlotState::Pending(_))
    }
}

/// Handle to a unit of work submitted to a [`TaskQueue`](crate::queue::TaskQueue).
///
/// The outcome is consumed once, either by [`wait`](Self::wait) or by a
/// callback registered with [`on_complete`](Self::on_complete). Dropping the
/// handle does not cancel the item.
#[derive(Debug)]
pub struct WorkItem<T> {
    pub(crate) seq: u64,
    pub(crate) token: CancellationToken,
    pub(crate) slot: Arc<Completion<T>>,
}

impl<T> WorkItem<T> {
    /// Sequence number of the item within its queue, in submission order.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Requests cancellation.
    ///
    /// An item that has not started yet is skipped and reports
    /// [`WorkItemFailure::Cancelled`]. A running body only notices when it
    /// polls its context.
    pub fn cancel(&self) -> bool {
        self.token.cancel()
    }

    /// Returns `true` once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The item's cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns `true` once the item has an outcome.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.slot.is_resolved()
    }

    /// Blocks until the item has an outcome and returns it.
    ///
    /// # Errors
    /// The item's failure, see [`WorkItemFailure`].
    pub fn wait(self) -> WorkResult<T> {
        let mut state = self
            .slot
            .resolved
            .wait_while(self.slot.state.lock(), |state| {
                matches!(state, SlotState::Pending(_))
            });
        match core::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Ready(result) => result,
            SlotState::Pending(_) | SlotState::Taken => unreachable!("WorkItem::wait: [1]"),
        }
    }

    /// Blocks until the item has an outcome or `timeout` elapses. The outcome
    /// stays in the handle.
    ///
    /// # Errors
    /// When the item is still pending or running at the deadline.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), TimeoutError> {
        let (_state, timed_out) =
            self.slot
                .resolved
                .wait_while_for(self.slot.state.lock(), timeout, |state| {
                    matches!(state, SlotState::Pending(_))
                });
        if timed_out {
            Err(TimeoutError { timeout })
        } else {
            Ok(())
        }
    }

    /// Registers `callback` to receive the outcome.
    ///
    /// If the item has already finished, `callback` runs immediately on the
    /// calling thread; otherwise it runs on the thread that finishes the item.
    pub fn on_complete(self, callback: impl FnOnce(WorkResult<T>) + Send + 'static) {
        let mut state = self.slot.state.lock();
        match core::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Pending(None) => *state = SlotState::Pending(Some(Box::new(callback))),
            SlotState::Ready(result) => {
                drop(state);
                callback(result);
            }
            SlotState::Pending(Some(_)) | SlotState::Taken => {
                unreachable!("WorkItem::on_complete: outcome already consumed")
            }
        }
    }
}
