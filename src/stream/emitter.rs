use crate::{
    stream::{Completion, Subscription},
    sync::{AtomicBool, Mutex, Ordering},
};
use derive_more::Debug;
use std::sync::Arc;
use tracing::trace;

type Hook = Box<dyn FnOnce() + Send>;
type ValueFn<T> = Box<dyn FnMut(T) + Send>;
type CompletionFn<E> = Box<dyn FnOnce(Completion<E>) + Send>;

/// Cancellation side of one subscription, shared by the [`Subscription`] and
/// the producer's [`Emitter`].
#[derive(Debug)]
pub(super) struct Control {
    cancelled: AtomicBool,
    /// `None` once cancelled or terminated.
    #[debug(skip)]
    hooks: Mutex<Option<Vec<Hook>>>,
}

impl Control {
    pub(super) fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            hooks: Mutex::new(Some(Vec::new())),
        }
    }

    pub(super) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Flips the flag and runs the registered hooks. Returns `true` for the
    /// call that flipped it.
    pub(super) fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let hooks = self.hooks.lock().take();
        trace!(hooks = hooks.as_ref().map_or(0, Vec::len), "subscription cancelled");
        for hook in hooks.into_iter().flatten() {
            hook();
        }
        true
    }

    /// Drops the registered hooks without running them.
    fn close(&self) {
        drop(self.hooks.lock().take());
    }

    fn on_cancel(&self, hook: Hook) {
        let mut hooks = self.hooks.lock();
        if let Some(hooks) = hooks.as_mut() {
            hooks.push(hook);
            return;
        }
        drop(hooks);
        if self.is_cancelled() {
            hook();
        }
    }
}

#[derive(Debug)]
struct Sink<T, E> {
    control: Arc<Control>,
    terminated: AtomicBool,
    delivery: Mutex<Delivery<T, E>>,
}

#[derive(Debug)]
struct Delivery<T, E> {
    #[debug(skip)]
    on_value: Option<ValueFn<T>>,
    #[debug(skip)]
    on_completion: Option<CompletionFn<E>>,
}

/// Producer side of one subscription.
///
/// Deliveries are serialized: two threads sending through clones of the same
/// emitter never run the subscriber's callbacks concurrently. Once the
/// subscription is cancelled or a terminal signal was sent, every further
/// call is ignored. The cancellation flag is checked again under the delivery
/// lock, so nothing starts after [`Subscription::cancel`] has returned.
///
/// Callbacks must not send through the emitter that is delivering to them.
#[derive(Debug)]
pub struct Emitter<T, E> {
    sink: Arc<Sink<T, E>>,
}

impl<T, E> Clone for Emitter<T, E> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
        }
    }
}

impl<T, E> Emitter<T, E> {
    pub(super) fn new(
        control: Arc<Control>,
        on_value: impl FnMut(T) + Send + 'static,
        on_completion: impl FnOnce(Completion<E>) + Send + 'static,
    ) -> Self {
        Self {
            sink: Arc::new(Sink {
                control,
                terminated: AtomicBool::new(false),
                delivery: Mutex::new(Delivery {
                    on_value: Some(Box::new(on_value)),
                    on_completion: Some(Box::new(on_completion)),
                }),
            }),
        }
    }

    /// Delivers `value`. Returns `false` if the subscriber no longer accepts
    /// values, which is the producer's cue to stop.
    pub fn send(&self, value: T) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut delivery = self.sink.delivery.lock();
        // Cancellation may have landed while this thread waited for the lock.
        if self.sink.control.is_cancelled() {
            delivery.on_value = None;
            return false;
        }
        match delivery.on_value.as_mut() {
            Some(on_value) => {
                on_value(value);
                true
            }
            None => false,
        }
    }

    /// Sends the terminal signal. Only the first terminal signal is
    /// delivered.
    pub fn complete(&self, completion: Completion<E>) {
        let Sink {
            control,
            terminated,
            delivery,
        } = &*self.sink;
        if control.is_cancelled() || terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let on_completion = {
            let mut delivery = delivery.lock();
            delivery.on_value = None;
            let on_completion = delivery.on_completion.take();
            on_completion.filter(|_| !control.is_cancelled())
        };
        trace!(failed = completion.is_failure(), "stream terminated");
        if let Some(on_completion) = on_completion {
            on_completion(completion);
        }
        control.close();
    }

    /// Sends [`Completion::Finished`].
    pub fn finish(&self) {
        self.complete(Completion::Finished);
    }

    /// Sends [`Completion::Failure`].
    pub fn fail(&self, error: E) {
        self.complete(Completion::Failure(error));
    }

    /// Returns `true` once the subscriber cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.sink.control.is_cancelled()
    }

    /// Returns `true` once the subscriber cancelled or a terminal signal was
    /// sent.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.is_cancelled() || self.sink.terminated.load(Ordering::Acquire)
    }

    /// Registers `hook` to run when the subscriber cancels.
    ///
    /// Runs `hook` immediately if the subscription is already cancelled. If
    /// the stream terminates first, the hook is dropped without running.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        self.sink.control.on_cancel(Box::new(hook));
    }

    /// Keeps an upstream subscription alive for as long as this one is, and
    /// cancels it together with this one.
    pub fn retain(&self, upstream: Subscription) {
        self.on_cancel(move || drop(upstream));
    }
}
