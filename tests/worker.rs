#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

mod common;

use ctk::{
    RequestContext,
    types::Priority,
    worker::{self, WorkerBuilder, WorkerExit},
};
use std::{thread, time::Duration};

#[test]
fn cancellation_is_cooperative() {
    common::init_tracing();
    let worker = worker::spawn(Priority::Utility, |context| {
        while !context.is_cancelled() {
            thread::sleep(Duration::from_millis(1));
        }
    })
    .unwrap();
    assert_eq!(worker.priority(), Priority::Utility);

    let err = worker.join_timeout(Duration::from_millis(20)).unwrap_err();
    assert_eq!(err.timeout, Duration::from_millis(20));
    assert!(!worker.is_finished());

    worker.cancel();
    assert_eq!(worker.join(), WorkerExit::Cancelled);
    assert!(worker.is_finished());
}

#[test]
fn checkpoint_unwinds_a_body_with_question_mark() {
    common::init_tracing();
    let worker = WorkerBuilder::new()
        .name("stepper")
        .spawn(|context| {
            let steps = || -> Result<(), ctk::Cancelled> {
                loop {
                    context.checkpoint()?;
                    context.token().sleep(Duration::from_millis(5));
                }
            };
            assert!(steps().is_err());
        })
        .unwrap();
    assert_eq!(worker.name(), Some("stepper"));
    worker.cancel();
    assert_eq!(
        worker.join_timeout(Duration::from_secs(5)),
        Ok(WorkerExit::Cancelled)
    );
}

#[test]
fn panics_are_reported() {
    common::init_tracing();
    let worker = worker::spawn(Priority::Default, |_| panic!("worker exploded")).unwrap();
    assert_eq!(
        worker.join(),
        WorkerExit::Panicked("worker exploded".to_owned())
    );
}

#[test]
fn locals_are_not_inherited() {
    common::init_tracing();
    let parent = WorkerBuilder::new()
        .local("request_id", 7u64)
        .spawn(|context| {
            let orphan = WorkerBuilder::new()
                .spawn(|child| assert!(child.local::<u64>("request_id").is_none()))
                .unwrap();
            assert_eq!(orphan.join(), WorkerExit::Completed);

            let heir = WorkerBuilder::new()
                .locals_from(context.locals())
                .spawn(|child| {
                    assert_eq!(child.local::<u64>("request_id").as_deref(), Some(&7));
                    child.set_local("request_id", 8u64);
                })
                .unwrap();
            assert_eq!(heir.join(), WorkerExit::Completed);
            assert_eq!(context.local::<u64>("request_id").as_deref(), Some(&7));
        })
        .unwrap();
    assert_eq!(parent.join(), WorkerExit::Completed);
    assert_eq!(parent.local::<u64>("request_id").as_deref(), Some(&7));
}

#[test]
fn request_context_travels_explicitly() {
    common::init_tracing();
    let request = RequestContext::new().with_value("tenant", "acme");
    let child = request.fork();
    let worker = child
        .seed(WorkerBuilder::new())
        .spawn(move |context| {
            assert_eq!(context.local::<&str>("tenant").as_deref(), Some(&"acme"));
            assert_eq!(child.parent(), Some(request.id()));
        })
        .unwrap();
    assert_eq!(worker.join(), WorkerExit::Completed);
}
