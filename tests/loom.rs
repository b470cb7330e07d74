#![allow(missing_docs)]
#![cfg(feature = "loom")]

use ctk::{
    cancel::CancellationToken,
    primitives::{AtomicCounter, Semaphore, WaitGroup},
    stream::EventStream,
};
use loom::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

#[test]
fn loom_token_cancel_flips_once() {
    loom::model(|| {
        let token = CancellationToken::new();
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let token = token.clone();
                thread::spawn(move || token.cancel())
            })
            .collect();
        let flipped = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|&flipped| flipped)
            .count();
        assert_eq!(flipped, 1);
        assert!(token.is_cancelled());
        assert!(token.checkpoint().is_err());
    });
}

#[test]
fn loom_semaphore_admits_one_holder() {
    loom::model(|| {
        let semaphore = Arc::new(Semaphore::new(1));
        let holders = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let (semaphore, holders) = (Arc::clone(&semaphore), Arc::clone(&holders));
                thread::spawn(move || {
                    let _permit = semaphore.acquire();
                    // Only one thread may be between acquire and release.
                    assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                    holders.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(semaphore.available_permits(), 1);
    });
}

#[test]
fn loom_counter_loses_no_update() {
    loom::model(|| {
        let counter = Arc::new(AtomicCounter::new(0));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    counter.increment();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.get(), 2);
        assert_eq!(counter.decrement(), Some(1));
        assert_eq!(counter.decrement(), Some(0));
        assert_eq!(counter.decrement(), None);
    });
}

#[test]
fn loom_wait_group_wakes_after_last_leave() {
    loom::model(|| {
        let group = WaitGroup::new();
        let done = Arc::new(AtomicUsize::new(0));
        group.enter();
        group.enter();
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let (group, done) = (group.clone(), Arc::clone(&done));
                thread::spawn(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                    group.leave();
                })
            })
            .collect();
        group.wait();
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(group.outstanding(), 0);
        for handle in handles {
            handle.join().unwrap();
        }
    });
}

#[test]
fn loom_subscription_cancel_is_idempotent() {
    loom::model(|| {
        let hooks = Arc::new(AtomicUsize::new(0));
        let stream = {
            let hooks = Arc::clone(&hooks);
            EventStream::<u8>::from_fn(move |emitter| {
                let hooks = Arc::clone(&hooks);
                emitter.on_cancel(move || {
                    hooks.fetch_add(1, Ordering::SeqCst);
                });
            })
        };
        let subscription = Arc::new(stream.sink(|_| {}));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let subscription = Arc::clone(&subscription);
                thread::spawn(move || subscription.cancel())
            })
            .collect();
        let flipped = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|&flipped| flipped)
            .count();
        assert_eq!(flipped, 1);
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
    });
}
