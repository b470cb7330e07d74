use crate::types::Priority;
use core::num::NonZeroUsize;
use derive_more::Display;
use std::{borrow::Cow, time::Duration};

/// Concurrency contract of a [`TaskQueue`](crate::queue::TaskQueue).
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueueMode {
    /// At most one item runs at a time; items complete in submission order.
    #[display("serial")]
    Serial,
    /// Up to `max_concurrency` items run at once; items start in submission
    /// order.
    #[display("parallel({max_concurrency})")]
    Parallel {
        /// Upper bound on simultaneously running items.
        max_concurrency: NonZeroUsize,
    },
}

impl QueueMode {
    /// Parallel mode with the given bound.
    ///
    /// # Panics
    /// If `max_concurrency` is zero.
    #[must_use]
    pub fn parallel(max_concurrency: usize) -> Self {
        Self::Parallel {
            max_concurrency: NonZeroUsize::new(max_concurrency)
                .expect("QueueMode::parallel: max_concurrency must be non-zero"),
        }
    }

    /// Number of items allowed to run simultaneously.
    #[must_use]
    pub const fn max_concurrency(self) -> usize {
        match self {
            Self::Serial => 1,
            Self::Parallel { max_concurrency } => max_concurrency.get(),
        }
    }
}

/// Settings of a single [`TaskQueue`](crate::queue::TaskQueue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Label used in logs, thread names and [`TaskQueue::label`](crate::queue::TaskQueue::label).
    pub label: Cow<'static, str>,
    /// Concurrency contract.
    pub mode: QueueMode,
    /// Priority with which the queue's items compete for pool threads.
    pub priority: Priority,
}

impl QueueConfig {
    /// Serial queue with default priority.
    pub fn serial(label: impl Into<Cow<'static, str>>) -> Self {
        Self {
            label: label.into(),
            mode: QueueMode::Serial,
            priority: Priority::Default,
        }
    }

    /// Parallel queue bounded by `max_concurrency`, with default priority.
    ///
    /// # Panics
    /// If `max_concurrency` is zero.
    pub fn parallel(label: impl Into<Cow<'static, str>>, max_concurrency: usize) -> Self {
        Self {
            label: label.into(),
            mode: QueueMode::parallel(max_concurrency),
            priority: Priority::Default,
        }
    }

    /// Replaces the priority.
    #[must_use]
    pub fn priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }
}

/// Settings of a [`WorkerPool`](crate::worker::WorkerPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of threads alive at once. Jobs beyond that wait.
    pub max_threads: NonZeroUsize,
    /// How long an idle thread lingers before it exits.
    pub keep_alive: Duration,
    /// Prefix of pool thread names.
    pub thread_name: Cow<'static, str>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_threads: NonZeroUsize::new(64).expect("PoolConfig::default: [1]"),
            keep_alive: Duration::from_secs(10),
            thread_name: Cow::Borrowed("ctk-pool"),
        }
    }
}

impl PoolConfig {
    /// Replaces the thread limit.
    ///
    /// # Panics
    /// If `max_threads` is zero.
    #[must_use]
    pub fn max_threads(self, max_threads: usize) -> Self {
        Self {
            max_threads: NonZeroUsize::new(max_threads)
                .expect("PoolConfig::max_threads: must be non-zero"),
            ..self
        }
    }

    /// Replaces the idle keep-alive.
    #[must_use]
    pub fn keep_alive(self, keep_alive: Duration) -> Self {
        Self { keep_alive, ..self }
    }

    /// Replaces the thread name prefix.
    #[must_use]
    pub fn thread_name(self, thread_name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            thread_name: thread_name.into(),
            ..self
        }
    }
}

/// What happens to an operation's dependents when the operation ends up
/// cancelled.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum CancellationPolicy {
    /// Dependents are scheduled as usual and can inspect their predecessors'
    /// states through the operation context.
    #[default]
    Isolated,
    /// Dependents are cancelled before they start, transitively.
    Propagate,
}

/// Settings of an [`OperationGraph`](crate::graph::OperationGraph).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct GraphConfig {
    /// Cancellation behaviour towards dependents.
    pub cancellation: CancellationPolicy,
    /// Priority hint given to every operation submitted by the graph.
    pub priority: Priority,
}
