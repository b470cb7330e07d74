#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

mod common;

use anyhow::anyhow;
use ctk::{
    config::{CancellationPolicy, GraphConfig},
    graph::{GraphError, OperationGraph, OperationState},
    primitives::Lock,
    queue::TaskQueue,
    types::OperationId,
};
use std::{sync::Arc, thread, time::Duration};

type Journal = Arc<Lock<Vec<String>>>;

fn journaled(graph: &mut OperationGraph, journal: &Journal, id: &'static str) {
    let journal = Arc::clone(journal);
    graph
        .add_operation(id, move |_| {
            journal.lock().push(format!("start {id}"));
            thread::sleep(Duration::from_millis(10));
            journal.lock().push(format!("end {id}"));
            Ok(())
        })
        .unwrap();
}

fn position(journal: &[String], event: &str) -> usize {
    journal
        .iter()
        .position(|entry| entry == event)
        .unwrap_or_else(|| panic!("{event} missing from {journal:?}"))
}

fn id(raw: &str) -> OperationId {
    OperationId::from(raw)
}

#[test]
fn diamond_runs_in_dependency_order() {
    common::init_tracing();
    let journal = Journal::default();
    let mut graph = OperationGraph::default();
    for name in ["A", "B", "C", "D"] {
        journaled(&mut graph, &journal, name);
    }
    graph.add_dependency("A", "B").unwrap();
    graph.add_dependency("A", "C").unwrap();
    graph.add_dependency("B", "D").unwrap();
    graph.add_dependency("C", "D").unwrap();
    assert_eq!(graph.topological_order(), [id("A"), id("B"), id("C"), id("D")]);

    let scheduled = graph.schedule(&TaskQueue::parallel("diamond", 4));
    scheduled.wait_timeout(Duration::from_secs(10)).unwrap();
    assert!(scheduled.is_finished());

    let journal = journal.get();
    assert_eq!(journal.len(), 8);
    for middle in ["B", "C"] {
        assert!(position(&journal, "end A") < position(&journal, &format!("start {middle}")));
        assert!(position(&journal, &format!("end {middle}")) < position(&journal, "start D"));
    }
    let report = scheduled.report();
    assert!(report.is_success());
    assert_eq!(report.count(OperationState::Completed), 4);
    assert!(scheduled.error().is_none());
}

#[test]
fn cycle_is_rejected_and_graph_left_unchanged() {
    common::init_tracing();
    let mut graph = OperationGraph::default();
    for name in ["A", "B", "C"] {
        graph.add_operation(name, |_| Ok(())).unwrap();
    }
    graph.add_dependency("A", "B").unwrap();
    graph.add_dependency("B", "C").unwrap();
    let before = graph.topological_order();

    match graph.add_dependency("C", "A") {
        Err(GraphError::Cycle(cycle)) => {
            assert_eq!((cycle.from, cycle.to), (id("C"), id("A")));
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert!(matches!(
        graph.add_dependency("B", "B"),
        Err(GraphError::Cycle(_))
    ));
    assert_eq!(graph.successors(&id("C")).unwrap().count(), 0);
    assert_eq!(graph.predecessors(&id("A")).unwrap().count(), 0);
    assert_eq!(graph.topological_order(), before);

    assert_eq!(
        graph.add_operation("A", |_| Ok(())),
        Err(GraphError::DuplicateOperation(id("A")))
    );
    assert_eq!(
        graph.add_dependency("A", "Z"),
        Err(GraphError::UnknownOperation(id("Z")))
    );
}

#[test]
fn cancelled_operation_does_not_cancel_dependents_by_default() {
    common::init_tracing();
    let journal = Journal::default();
    let mut graph = OperationGraph::default();
    journaled(&mut graph, &journal, "fetch");
    journaled(&mut graph, &journal, "parse");
    {
        let journal = Arc::clone(&journal);
        graph
            .add_operation("render", move |operation| {
                let parse = operation.predecessor_state(&id("parse"));
                journal.lock().push(format!("render saw parse {parse:?}"));
                Ok(())
            })
            .unwrap();
    }
    graph.add_dependency("fetch", "parse").unwrap();
    graph.add_dependency("parse", "render").unwrap();
    graph.cancel(&id("parse")).unwrap();

    let scheduled = graph.schedule(&TaskQueue::serial("isolated"));
    scheduled.wait();
    assert_eq!(scheduled.state(&id("fetch")), Some(OperationState::Completed));
    assert_eq!(scheduled.state(&id("parse")), Some(OperationState::Cancelled));
    assert_eq!(scheduled.state(&id("render")), Some(OperationState::Completed));
    assert_eq!(
        journal.get(),
        [
            "start fetch",
            "end fetch",
            "render saw parse Some(Cancelled)"
        ]
    );
}

#[test]
fn propagate_policy_cancels_dependents_transitively() {
    common::init_tracing();
    let mut graph = OperationGraph::new(GraphConfig {
        cancellation: CancellationPolicy::Propagate,
        ..GraphConfig::default()
    });
    for name in ["A", "B", "C", "side"] {
        graph.add_operation(name, |_| Ok(())).unwrap();
    }
    graph.add_dependency("A", "B").unwrap();
    graph.add_dependency("B", "C").unwrap();
    graph.cancel(&id("A")).unwrap();

    let scheduled = graph.schedule(&TaskQueue::parallel("propagate", 2));
    scheduled.wait();
    let report = scheduled.report();
    assert_eq!(report.count(OperationState::Cancelled), 3);
    assert_eq!(report.states[&id("side")], OperationState::Completed);
}

#[test]
fn failure_is_recorded_and_dependents_still_run() {
    common::init_tracing();
    let mut graph = OperationGraph::default();
    graph
        .add_operation("load", |_| Err(anyhow!("config missing")))
        .unwrap();
    graph
        .add_operation("report", |operation| {
            let states: Vec<_> = operation.predecessors().map(|(_, state)| state).collect();
            assert_eq!(states, [OperationState::Failed]);
            Ok(())
        })
        .unwrap();
    graph.add_dependency("load", "report").unwrap();

    let scheduled = graph.schedule(&TaskQueue::serial("failures"));
    scheduled.wait();
    assert_eq!(scheduled.state(&id("load")), Some(OperationState::Failed));
    assert_eq!(scheduled.state(&id("report")), Some(OperationState::Completed));
    let error = scheduled.error().unwrap();
    assert_eq!(error.to_string(), "config missing");
    assert!(scheduled.failure(&id("report")).is_none());
    assert!(!scheduled.report().is_success());
}

#[test]
fn running_operation_observes_cancellation_through_its_context() {
    common::init_tracing();
    let mut graph = OperationGraph::default();
    graph
        .add_operation("poll", |operation| {
            loop {
                operation.checkpoint()?;
                operation.token().sleep(Duration::from_millis(5));
            }
        })
        .unwrap();
    let scheduled = graph.schedule(&TaskQueue::serial("poll"));
    assert!(scheduled.wait_timeout(Duration::from_millis(20)).is_err());
    assert_eq!(scheduled.cancel(&id("poll")), Ok(true));
    assert_eq!(scheduled.cancel(&id("poll")), Ok(false));
    scheduled.wait();
    assert_eq!(scheduled.state(&id("poll")), Some(OperationState::Cancelled));
}
