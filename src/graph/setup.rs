use crate::{
    graph::OperationNode,
    types::{HashSet, IndexMap, OperationId},
};
use core::cmp::Reverse;
use std::collections::BinaryHeap;
use thiserror::Error;

/// An edge was rejected because it would close a cycle.
///
/// The graph is left exactly as it was before the rejected call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("dependency {from} -> {to} would close a cycle")]
#[non_exhaustive]
pub struct CycleError {
    /// Operation that was to run first.
    pub from: OperationId,
    /// Operation that was to run after `from`.
    pub to: OperationId,
}

/// Returns `true` if `target` can be reached from `start` by following
/// dependency edges downstream. A node reaches itself.
pub(super) fn reaches(
    nodes: &IndexMap<OperationId, OperationNode>,
    start: &OperationId,
    target: &OperationId,
) -> bool {
    let mut stack = vec![start];
    let mut visited = HashSet::default();
    while let Some(id) = stack.pop() {
        if id == target {
            return true;
        }
        if !visited.insert(id) {
            continue;
        }
        stack.extend(&nodes[id].children);
    }
    false
}

/// Kahn-style topological order over insertion indexes of `nodes`.
///
/// Among operations whose predecessors are all placed, the one inserted first
/// is placed next, so independent operations keep their insertion order.
///
/// # Panics
/// If the graph contains a cycle. Edges are checked when added, so this
/// indicates a bug.
pub(super) fn topological_order(nodes: &IndexMap<OperationId, OperationNode>) -> Vec<usize> {
    // Example:
    //
    //   A     B
    //    \   /
    //      C     E
    //      |
    //      D
    //
    // Inserted as A, B, C, D, E. Roots A, B, E are ready at once and are
    // placed by insertion index; C becomes ready after A and B, D after C.
    // Final order: A, B, C, D, E.
    let mut parents_left: Vec<usize> = nodes.values().map(|node| node.parents.len()).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = parents_left
        .iter()
        .enumerate()
        .filter(|&(_, &left)| left == 0)
        .map(|(idx, _)| Reverse(idx))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(idx)) = ready.pop() {
        order.push(idx);
        let (_, node) = nodes
            .get_index(idx)
            .expect("OperationGraph::schedule: [1]");
        for child in &node.children {
            let child_idx = nodes
                .get_index_of(child)
                .expect("OperationGraph::schedule: [2]");
            let left = &mut parents_left[child_idx];
            *left = left.checked_sub(1).expect("OperationGraph::schedule: [3]");
            if *left == 0 {
                ready.push(Reverse(child_idx));
            }
        }
    }
    assert_eq!(order.len(), nodes.len(), "OperationGraph::schedule: [4]");
    order
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::types::IndexSet;

    fn graph(ids: &[&str], edges: &[(&str, &str)]) -> IndexMap<OperationId, OperationNode> {
        let mut nodes = ids
            .iter()
            .map(|&id| {
                let node = OperationNode {
                    body: Box::new(|_| Ok(())),
                    token: crate::cancel::CancellationToken::new(),
                    parents: IndexSet::default(),
                    children: IndexSet::default(),
                };
                (OperationId::from(id), node)
            })
            .collect::<IndexMap<_, _>>();
        for &(from, to) in edges {
            nodes[&OperationId::from(from)].children.insert(to.into());
            nodes[&OperationId::from(to)].parents.insert(from.into());
        }
        nodes
    }

    fn names(nodes: &IndexMap<OperationId, OperationNode>, order: &[usize]) -> Vec<String> {
        order
            .iter()
            .map(|&idx| nodes.get_index(idx).unwrap().0.to_string())
            .collect()
    }

    #[test]
    fn reachability_follows_edges_downstream_only() {
        let nodes = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        assert!(reaches(&nodes, &"a".into(), &"c".into()));
        assert!(!reaches(&nodes, &"c".into(), &"a".into()));
        assert!(reaches(&nodes, &"b".into(), &"b".into()));
    }

    #[test]
    fn ties_are_broken_by_insertion_order() {
        let nodes = graph(
            &["A", "B", "C", "D", "E"],
            &[("A", "C"), ("B", "C"), ("C", "D")],
        );
        let order = topological_order(&nodes);
        assert_eq!(names(&nodes, &order), ["A", "B", "C", "D", "E"]);
    }

    #[test]
    fn dependents_inserted_first_still_run_after_their_predecessors() {
        let nodes = graph(&["sink", "mid", "source"], &[("source", "mid"), ("mid", "sink")]);
        let order = topological_order(&nodes);
        assert_eq!(names(&nodes, &order), ["source", "mid", "sink"]);
    }

    #[test]
    fn diamond_orders_branches_by_insertion() {
        let nodes = graph(
            &["A", "C", "B", "D"],
            &[("A", "B"), ("A", "C"), ("B", "D"), ("C", "D")],
        );
        let order = topological_order(&nodes);
        assert_eq!(names(&nodes, &order), ["A", "C", "B", "D"]);
    }
}
