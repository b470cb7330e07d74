mod execute;
mod setup;

pub use self::setup::CycleError;
use self::execute::GraphRun;
use crate::{
    cancel::{Cancelled, CancellationToken},
    config::GraphConfig,
    queue::{ItemContext, TaskQueue},
    types::{IndexMap, IndexSet, OperationId},
    worker::TimeoutError,
};
use derive_more::{Debug, Display};
use std::{sync::Arc, time::Duration};
use thiserror::Error;

pub(crate) type OperationBody = Box<dyn FnOnce(&OperationContext<'_>) -> anyhow::Result<()> + Send>;

/// Error returned when building an [`OperationGraph`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
    /// The dependency would make the graph cyclic.
    #[error(transparent)]
    Cycle(#[from] CycleError),
    /// No operation with this id was added.
    #[error("unknown operation {0}")]
    UnknownOperation(OperationId),
    /// An operation with this id already exists.
    #[error("duplicate operation {0}")]
    DuplicateOperation(OperationId),
}

/// Lifecycle of an operation: `Pending -> Running -> {Completed, Cancelled,
/// Failed}`, or straight from `Pending` to `Cancelled` when cancelled before
/// it starts. Terminal states never change.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationState {
    /// Waiting for predecessors or for a queue slot.
    #[display("pending")]
    Pending = 0,
    /// The body is running.
    #[display("running")]
    Running = 1,
    /// The body returned `Ok`.
    #[display("completed")]
    Completed = 2,
    /// Cancelled before it started, or the body observed cancellation.
    #[display("cancelled")]
    Cancelled = 3,
    /// The body returned an error or panicked.
    #[display("failed")]
    Failed = 4,
}

impl OperationState {
    /// Returns `true` for `Completed`, `Cancelled` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Cancelled,
            4 => Self::Failed,
            _ => unreachable!("OperationState::from_u8: [1]"),
        }
    }
}

#[derive(Debug)]
struct OperationNode {
    #[debug(skip)]
    body: OperationBody,
    token: CancellationToken,
    parents: IndexSet<OperationId>,
    children: IndexSet<OperationId>,
}

/// Named operations with dependency edges.
///
/// The graph is acyclic by construction: [`add_dependency`](Self::add_dependency)
/// refuses any edge that would close a cycle. Once built, the graph is
/// [`schedule`](Self::schedule)d onto a [`TaskQueue`]: an operation starts
/// only after every predecessor reached a terminal state, and operations that
/// become ready together are submitted in topological order, ties broken by
/// insertion order.
///
/// A failed or cancelled predecessor does not stop its dependents unless the
/// graph is configured with
/// [`CancellationPolicy::Propagate`](crate::config::CancellationPolicy::Propagate).
/// Dependents can inspect their predecessors' states through
/// [`OperationContext`].
#[must_use]
#[derive(Debug, Default)]
pub struct OperationGraph {
    config: GraphConfig,
    nodes: IndexMap<OperationId, OperationNode>,
}

impl OperationGraph {
    /// Creates an empty graph.
    pub fn new(config: GraphConfig) -> Self {
        Self {
            config,
            nodes: IndexMap::default(),
        }
    }

    /// Configuration the graph was created with.
    #[must_use]
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if no operation was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns `true` if an operation with this id was added.
    #[must_use]
    pub fn contains(&self, id: &OperationId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Adds an operation.
    ///
    /// # Errors
    /// [`GraphError::DuplicateOperation`] if the id is taken.
    pub fn add_operation<F>(&mut self, id: impl Into<OperationId>, body: F) -> Result<(), GraphError>
    where
        F: FnOnce(&OperationContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateOperation(id));
        }
        self.nodes.insert(
            id,
            OperationNode {
                body: Box::new(body),
                token: CancellationToken::new(),
                parents: IndexSet::default(),
                children: IndexSet::default(),
            },
        );
        Ok(())
    }

    /// Makes `to` run after `from`. Adding an existing edge again is a no-op.
    ///
    /// # Errors
    /// - [`GraphError::UnknownOperation`] if either id was never added.
    /// - [`GraphError::Cycle`] if `from` is reachable from `to`, including
    ///   `from == to`. The graph is left unchanged.
    pub fn add_dependency(
        &mut self,
        from: impl Into<OperationId>,
        to: impl Into<OperationId>,
    ) -> Result<(), GraphError> {
        let (from, to) = (from.into(), to.into());
        for id in [&from, &to] {
            if !self.nodes.contains_key(id) {
                return Err(GraphError::UnknownOperation(id.clone()));
            }
        }
        if self.nodes[&from].children.contains(&to) {
            return Ok(());
        }
        if setup::reaches(&self.nodes, &to, &from) {
            return Err(CycleError { from, to }.into());
        }
        self.nodes[&from].children.insert(to.clone());
        self.nodes[&to].parents.insert(from);
        Ok(())
    }

    /// Cancels an operation. If it has not started when its turn comes, its
    /// body never runs and it ends up [`OperationState::Cancelled`].
    ///
    /// # Errors
    /// [`GraphError::UnknownOperation`] if the id was never added.
    pub fn cancel(&self, id: &OperationId) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| GraphError::UnknownOperation(id.clone()))?;
        node.token.cancel();
        Ok(())
    }

    /// Direct predecessors of `id`, in the order the edges were added.
    ///
    /// # Errors
    /// [`GraphError::UnknownOperation`] if the id was never added.
    pub fn predecessors(
        &self,
        id: &OperationId,
    ) -> Result<impl Iterator<Item = &OperationId>, GraphError> {
        self.nodes
            .get(id)
            .map(|node| node.parents.iter())
            .ok_or_else(|| GraphError::UnknownOperation(id.clone()))
    }

    /// Direct dependents of `id`, in the order the edges were added.
    ///
    /// # Errors
    /// [`GraphError::UnknownOperation`] if the id was never added.
    pub fn successors(
        &self,
        id: &OperationId,
    ) -> Result<impl Iterator<Item = &OperationId>, GraphError> {
        self.nodes
            .get(id)
            .map(|node| node.children.iter())
            .ok_or_else(|| GraphError::UnknownOperation(id.clone()))
    }

    /// Operation ids in the order they will become eligible when nothing
    /// overlaps: topological, ties broken by insertion order.
    #[must_use]
    pub fn topological_order(&self) -> Vec<OperationId> {
        setup::topological_order(&self.nodes)
            .into_iter()
            .map(|idx| {
                let (id, _) = self
                    .nodes
                    .get_index(idx)
                    .expect("OperationGraph::topological_order: [1]");
                id.clone()
            })
            .collect()
    }

    /// Submits the graph's operations onto `queue` as they become eligible.
    pub fn schedule(self, queue: &TaskQueue) -> ScheduledGraph {
        let Self { config, nodes } = self;
        let order = setup::topological_order(&nodes);
        let run = Arc::new(GraphRun::new(config, queue.clone(), nodes, &order));
        run.start();
        ScheduledGraph { run }
    }
}

/// View of the running operation handed to its body.
#[derive(Debug)]
pub struct OperationContext<'a> {
    #[debug(skip)]
    run: &'a GraphRun,
    pos: usize,
    item: &'a ItemContext<'a>,
}

impl<'a> OperationContext<'a> {
    /// Id of the running operation.
    #[must_use]
    pub fn id(&self) -> &OperationId {
        &self.run.operations[self.pos].id
    }

    /// The operation's cancellation token, as used by
    /// [`ScheduledGraph::cancel`].
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.run.operations[self.pos].token
    }

    /// The queue item running this operation.
    #[must_use]
    pub fn item(&self) -> &'a ItemContext<'a> {
        self.item
    }

    /// Returns `true` once the operation or its queue item is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token().is_cancelled() || self.item.is_cancelled()
    }

    /// Returns `Err(Cancelled)` once [`is_cancelled`](Self::is_cancelled)
    /// holds, for use with `?`.
    ///
    /// # Errors
    /// When the operation is cancelled.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Direct predecessors with their (terminal) states.
    pub fn predecessors(&self) -> impl Iterator<Item = (&OperationId, OperationState)> {
        self.run.operations[self.pos]
            .parents
            .iter()
            .map(|&parent| (&self.run.operations[parent].id, self.run.state(parent)))
    }

    /// State of the direct predecessor `id`, or `None` if `id` is not one.
    #[must_use]
    pub fn predecessor_state(&self, id: &OperationId) -> Option<OperationState> {
        let pos = *self.run.index.get(id)?;
        self.run.operations[self.pos]
            .parents
            .contains(&pos)
            .then(|| self.run.state(pos))
    }
}

/// Handle to a graph whose operations are being run.
///
/// Dropping the handle does not stop the graph.
#[derive(Debug, Clone)]
pub struct ScheduledGraph {
    run: Arc<GraphRun>,
}

impl ScheduledGraph {
    /// Blocks until every operation is terminal.
    pub fn wait(&self) {
        self.run.outstanding.wait();
    }

    /// Blocks until every operation is terminal or `timeout` elapses.
    ///
    /// # Errors
    /// When some operation was not terminal at the deadline.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), TimeoutError> {
        self.run.outstanding.wait_timeout(timeout)
    }

    /// Returns `true` once every operation is terminal.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.run.outstanding.outstanding() == 0
    }

    /// Current state of `id`, or `None` if the graph has no such operation.
    #[must_use]
    pub fn state(&self, id: &OperationId) -> Option<OperationState> {
        self.run.index.get(id).map(|&pos| self.run.state(pos))
    }

    /// Cancels `id`. A running body only notices when it polls its context.
    ///
    /// Returns `true` for the call that actually flipped the flag.
    ///
    /// # Errors
    /// [`GraphError::UnknownOperation`] if the graph has no such operation.
    pub fn cancel(&self, id: &OperationId) -> Result<bool, GraphError> {
        let pos = self
            .run
            .index
            .get(id)
            .ok_or_else(|| GraphError::UnknownOperation(id.clone()))?;
        Ok(self.run.operations[*pos].token.cancel())
    }

    /// Error of the first operation that failed, if any.
    #[must_use]
    pub fn error(&self) -> Option<Arc<anyhow::Error>> {
        self.run.failures.lock().first().map(|(_, error)| Arc::clone(error))
    }

    /// Error of operation `id`, if it failed.
    #[must_use]
    pub fn failure(&self, id: &OperationId) -> Option<Arc<anyhow::Error>> {
        self.run.failures.lock().get(id).cloned()
    }

    /// Snapshot of every operation's state, in topological order.
    #[must_use]
    pub fn report(&self) -> GraphReport {
        let states = self
            .run
            .operations
            .iter()
            .enumerate()
            .map(|(pos, operation)| (operation.id.clone(), self.run.state(pos)))
            .collect();
        let failures = self.run.failures.lock().clone();
        GraphReport { states, failures }
    }
}

/// Snapshot returned by [`ScheduledGraph::report`].
#[derive(Debug, Clone)]
pub struct GraphReport {
    /// State of every operation, in topological order.
    pub states: IndexMap<OperationId, OperationState>,
    /// Errors of failed operations, in the order they failed.
    pub failures: IndexMap<OperationId, Arc<anyhow::Error>>,
}

impl GraphReport {
    /// Number of operations in `state`.
    #[must_use]
    pub fn count(&self, state: OperationState) -> usize {
        self.states.values().filter(|&&s| s == state).count()
    }

    /// Returns `true` if every operation completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.states
            .values()
            .all(|&state| state == OperationState::Completed)
    }
}
