//! Thread-based concurrency toolkit: workers, task queues, dependency-ordered
//! operation graphs and event streams.
//!
//! The crate is organized in layers, each built on the one below:
//! - Workers are OS threads with a priority hint, a cooperative cancellation
//!   token and a per-worker table of values. An elastic [`WorkerPool`] keeps a
//!   set of them busy.
//! - A [`TaskQueue`] is a labelled serial or bounded-parallel execution
//!   context with a FIFO backlog, suspension, barriers and per-item
//!   completion handles.
//! - An [`OperationGraph`] holds named operations and their dependencies,
//!   rejects cycles as edges are added, and schedules operations onto a queue
//!   in topological order.
//! - An [`EventStream`] is a cold publisher of values followed by one terminal
//!   signal, with combinators that report values in input order.
//!
//! Synchronization primitives (locks, semaphores, counters, wait groups and
//! cancellation tokens) are shared by all layers and exposed to callers.
//!
//! Key modules:
//! - `worker`: threads, their local tables and the pool backing every queue.
//! - `queue`: task queues, work item handles and the barrier-guarded cell.
//! - `graph`: graph construction (cycle checks, topological order) and
//!   scheduled execution.
//! - `stream`: streams, operators, subjects and subscriptions.
//! - `primitives` and `cancel`: synchronization and cooperative
//!   cancellation.
//! - `config`: plain configuration values for pools, queues and graphs.
//!
//! Quick start:
//! 1. Create a queue with [`TaskQueue::serial`] or [`TaskQueue::parallel`].
//! 2. Submit bodies returning `anyhow::Result<T>` and keep the returned
//!    [`WorkItem`] to wait for, cancel, or observe the outcome.
//! 3. For work with dependencies, add operations and edges to an
//!    [`OperationGraph`], call [`OperationGraph::schedule`] with the queue and
//!    wait on the [`ScheduledGraph`].
//!
//! Cancellation is cooperative everywhere: bodies poll their token, or return
//! [`Cancelled`] through [`CancellationToken::checkpoint`], and are never
//! interrupted.

/// Cooperative cancellation.
///
/// Provides [`CancellationToken`](cancel::CancellationToken), a shared flag
/// with interruptible sleeps, and the [`Cancelled`](cancel::Cancelled) signal
/// bodies return once they notice it.
pub mod cancel;
/// Plain configuration values for pools, queues and graphs.
pub mod config;
/// Explicit request context passed to the work done on a request's behalf.
pub mod context;
/// Named operations with dependencies, scheduled onto a task queue.
///
/// Contains graph construction (cycle rejection through an incremental
/// reachability check, topological ordering with insertion-order ties) and
/// the execution that releases each operation once all its predecessors are
/// terminal.
pub mod graph;
/// Locks, semaphores, atomic counters and wait groups.
pub mod primitives;
/// Labelled serial and bounded-parallel task queues.
///
/// Defines [`TaskQueue`](queue::TaskQueue), the [`WorkItem`](queue::WorkItem)
/// handle returned for each submission, and
/// [`BarrierCell`](queue::BarrierCell), a value guarded by its own queue.
pub mod queue;
/// Cold event streams, their operators and combinators, hot subjects and
/// subscriptions.
pub mod stream;
mod sync;
/// Shared types: priorities, operation ids and map aliases.
pub mod types;
mod utils;
/// OS thread workers and the elastic pool that runs queue items.
pub mod worker;

pub use self::{
    cancel::{CancellationToken, Cancelled},
    context::RequestContext,
    graph::{OperationGraph, ScheduledGraph},
    queue::{TaskQueue, WorkItem},
    stream::EventStream,
    worker::WorkerPool,
};
