use crate::{
    cancel::{Cancelled, CancellationToken},
    config::{CancellationPolicy, GraphConfig},
    graph::{OperationBody, OperationContext, OperationNode, OperationState},
    primitives::WaitGroup,
    queue::{ItemContext, TaskQueue, WorkItemFailure, WorkResult},
    sync::{AtomicU8, AtomicUsize, Mutex, Ordering},
    types::{HashMap, IndexMap, IndexSet, OperationId},
};
use derive_more::Debug;
use rustc_hash::FxBuildHasher;
use std::sync::Arc;
use tracing::{debug, warn};
use unzip3::Unzip3;

/// Scheduled state of one graph, shared by every item it submits.
#[derive(Debug)]
pub(super) struct GraphRun {
    pub(super) config: GraphConfig,
    pub(super) queue: TaskQueue,
    /// Operations in topological order.
    pub(super) operations: Vec<OperationSlot>,
    pub(super) parents: Vec<ParentInfoSlot>,
    pub(super) states: Vec<StateSlot>,
    pub(super) index: HashMap<OperationId, usize>,
    pub(super) failures: Mutex<IndexMap<OperationId, Arc<anyhow::Error>>>,
    pub(super) outstanding: WaitGroup,
}

#[derive(Debug)]
pub(super) struct OperationSlot {
    pub(super) id: OperationId,
    pub(super) token: CancellationToken,
    #[debug(skip)]
    body: Mutex<Option<OperationBody>>,
    /// Indexes of predecessors, ascending.
    pub(super) parents: Vec<usize>,
    /// Indexes of dependents, ascending.
    children: Vec<usize>,
}

#[derive(Debug)]
#[repr(align(128))]
pub(super) struct ParentInfoSlot {
    /// Number of predecessors that are not terminal yet.
    parents_left: AtomicUsize,
}

#[derive(Debug)]
pub(super) struct StateSlot(AtomicU8);

impl StateSlot {
    fn new() -> Self {
        Self(AtomicU8::new(OperationState::Pending as u8))
    }

    pub(super) fn load(&self) -> OperationState {
        OperationState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: OperationState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl GraphRun {
    /// Materializes slots in topological order and registers every operation
    /// as outstanding.
    pub(super) fn new(
        config: GraphConfig,
        queue: TaskQueue,
        mut nodes: IndexMap<OperationId, OperationNode>,
        order: &[usize],
    ) -> Self {
        let index: HashMap<OperationId, usize> = order
            .iter()
            .enumerate()
            .map(|(pos, &idx)| {
                let (id, _) = nodes.get_index(idx).expect("OperationGraph::schedule: [5]");
                (id.clone(), pos)
            })
            .collect();
        let to_positions = |ids: &IndexSet<OperationId>| {
            let mut positions: Vec<usize> = ids.iter().map(|id| index[id]).collect();
            positions.sort_unstable();
            positions
        };
        let mut taken: Vec<Option<(OperationId, OperationNode)>> = nodes
            .drain(..)
            .map(Some)
            .collect();
        let (operations, parents, states): (Vec<_>, Vec<_>, Vec<_>) = order
            .iter()
            .map(|&idx| {
                let (id, node) = taken[idx].take().expect("OperationGraph::schedule: [6]");
                let OperationNode {
                    body,
                    token,
                    parents,
                    children,
                } = node;
                let operation = OperationSlot {
                    id,
                    token,
                    body: Mutex::new(Some(body)),
                    parents: to_positions(&parents),
                    children: to_positions(&children),
                };
                let parent_info = ParentInfoSlot {
                    parents_left: AtomicUsize::new(parents.len()),
                };
                (operation, parent_info, StateSlot::new())
            })
            .unzip3();
        assert!(
            taken.iter().all(Option::is_none),
            "OperationGraph::schedule: [7]"
        );
        for (pos, operation) in operations.iter().enumerate() {
            for &parent in &operation.parents {
                assert!(parent < pos, "OperationGraph::schedule: [8]");
            }
        }
        let outstanding = WaitGroup::new();
        for _ in &operations {
            outstanding.enter();
        }
        Self {
            config,
            queue,
            operations,
            parents,
            states,
            index,
            failures: Mutex::new(IndexMap::with_hasher(FxBuildHasher)),
            outstanding,
        }
    }

    /// Submits every operation without predecessors, in topological order.
    pub(super) fn start(self: &Arc<Self>) {
        let roots: Vec<usize> = self
            .operations
            .iter()
            .enumerate()
            .filter(|(_, operation)| operation.parents.is_empty())
            .map(|(pos, _)| pos)
            .collect();
        debug!(
            queue = %self.queue.label(),
            operations = self.operations.len(),
            roots = roots.len(),
            "graph scheduled"
        );
        for pos in roots {
            self.submit(pos);
        }
    }

    fn submit(self: &Arc<Self>, pos: usize) {
        let run = Arc::clone(self);
        let item = self
            .queue
            .submit_with(self.config.priority, move |item| run.execute(pos, item));
        let run = Arc::clone(self);
        item.on_complete(move |result| run.finish(pos, result));
    }

    fn execute(&self, pos: usize, item: &ItemContext<'_>) -> anyhow::Result<()> {
        let operation = &self.operations[pos];
        if operation.token.is_cancelled() {
            return Err(Cancelled.into());
        }
        let body = operation
            .body
            .lock()
            .take()
            .expect("OperationGraph::execute: [1]");
        self.states[pos].store(OperationState::Running);
        debug!(operation = %operation.id, "operation starting");
        let context = OperationContext {
            run: self,
            pos,
            item,
        };
        body(&context)
    }

    fn finish(self: &Arc<Self>, pos: usize, result: WorkResult<()>) {
        let operation = &self.operations[pos];
        let state = match result {
            Ok(()) => OperationState::Completed,
            Err(WorkItemFailure::Cancelled) => OperationState::Cancelled,
            Err(failure) => {
                let error = match failure {
                    WorkItemFailure::Failed(error) => error,
                    other => anyhow::Error::new(other),
                };
                let message = format!("{error:#}");
                warn!(operation = %operation.id, error = %message, "operation failed");
                self.failures
                    .lock()
                    .insert(operation.id.clone(), Arc::new(error));
                OperationState::Failed
            }
        };
        self.states[pos].store(state);
        debug!(operation = %operation.id, ?state, "operation finished");

        if state == OperationState::Cancelled
            && self.config.cancellation == CancellationPolicy::Propagate
        {
            for &child in &operation.children {
                self.operations[child].token.cancel();
            }
        }
        for &child in &operation.children {
            let left = self.parents[child]
                .parents_left
                .fetch_sub(1, Ordering::AcqRel);
            assert_ne!(left, 0, "OperationGraph::finish: [1]");
            if left == 1 {
                self.submit(child);
            }
        }
        self.outstanding.leave();
    }

    pub(super) fn state(&self, pos: usize) -> OperationState {
        self.states[pos].load()
    }
}
