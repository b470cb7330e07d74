mod combine;
mod emitter;
mod operators;
mod subject;
mod subscription;

pub use self::{
    combine::{collect_all_results, combine_latest_and_sort, merge_and_sort, zip_and_sort},
    emitter::Emitter,
    subject::{CurrentValueSubject, PassthroughSubject},
    subscription::{Subscription, SubscriptionBag},
};
use self::emitter::Control;
use crate::worker::TimeoutError;
use core::convert::Infallible;
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

type Producer<T, E> = dyn Fn(Emitter<T, E>) + Send + Sync;

/// Terminal signal of a stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Completion<E> {
    /// The stream ended normally.
    Finished,
    /// The stream ended with an error.
    Failure(E),
}

impl<E> Completion<E> {
    /// Returns `true` for [`Completion::Finished`].
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Returns `true` for [`Completion::Failure`].
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Converts the error with `op`.
    pub fn map_err<F>(self, op: impl FnOnce(E) -> F) -> Completion<F> {
        match self {
            Self::Finished => Completion::Finished,
            Self::Failure(error) => Completion::Failure(op(error)),
        }
    }

    /// `Ok(())` for `Finished`, `Err(error)` for `Failure(error)`.
    ///
    /// # Errors
    /// The failure carried by the signal.
    pub fn into_result(self) -> Result<(), E> {
        match self {
            Self::Finished => Ok(()),
            Self::Failure(error) => Err(error),
        }
    }
}

/// Events as they travel through channels between threads.
#[derive(Debug)]
enum Event<T, E> {
    Value(T),
    Done(Completion<E>),
}

/// A cold stream of values followed by one terminal [`Completion`].
///
/// Nothing happens until [`subscribe`](Self::subscribe) is called; every
/// subscription runs the producer anew. Values are delivered synchronously
/// on whatever thread the producer emits from, unless moved with
/// [`deliver_on`](Self::deliver_on).
///
/// Cloning is cheap and yields the same stream.
pub struct EventStream<T, E = Infallible> {
    producer: Arc<Producer<T, E>>,
}

impl<T, E> Clone for EventStream<T, E> {
    fn clone(&self) -> Self {
        Self {
            producer: Arc::clone(&self.producer),
        }
    }
}

impl<T, E> fmt::Debug for EventStream<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

impl<T: Send + 'static, E: Send + 'static> EventStream<T, E> {
    /// Stream driven by `producer`, called once per subscription with the
    /// subscription's [`Emitter`].
    ///
    /// The producer may emit synchronously or keep the emitter and emit later
    /// from any thread. It should stop once [`Emitter::send`] returns `false`.
    pub fn from_fn(producer: impl Fn(Emitter<T, E>) + Send + Sync + 'static) -> Self {
        Self {
            producer: Arc::new(producer),
        }
    }

    /// Emits `value`, then finishes.
    pub fn just(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_fn(move |emitter| {
            emitter.send(value.clone());
            emitter.finish();
        })
    }

    /// Finishes without emitting.
    pub fn empty() -> Self {
        Self::from_fn(|emitter| emitter.finish())
    }

    /// Fails with `error` without emitting.
    pub fn fail(error: E) -> Self
    where
        E: Clone + Sync,
    {
        Self::from_fn(move |emitter| emitter.fail(error.clone()))
    }

    /// Emits every item of `items`, then finishes.
    pub fn from_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
    {
        Self::from_fn(move |emitter| {
            for item in items.clone() {
                if !emitter.send(item) {
                    return;
                }
            }
            emitter.finish();
        })
    }

    /// Builds the actual stream with `factory` at subscription time.
    pub fn deferred(factory: impl Fn() -> Self + Send + Sync + 'static) -> Self {
        Self::from_fn(move |emitter| factory().subscribe_into(&emitter))
    }

    /// Starts the producer and delivers to `on_value` and `on_completion`.
    pub fn subscribe(
        &self,
        on_value: impl FnMut(T) + Send + 'static,
        on_completion: impl FnOnce(Completion<E>) + Send + 'static,
    ) -> Subscription {
        let control = Arc::new(Control::new());
        let emitter = Emitter::new(Arc::clone(&control), on_value, on_completion);
        (self.producer)(emitter);
        Subscription::new(control)
    }

    /// Like [`subscribe`](Self::subscribe), ignoring the terminal signal.
    pub fn sink(&self, on_value: impl FnMut(T) + Send + 'static) -> Subscription {
        self.subscribe(on_value, |_| {})
    }

    /// Subscribes and blocks until the stream terminates.
    ///
    /// # Errors
    /// The stream's failure.
    pub fn collect_blocking(&self) -> Result<Vec<T>, E> {
        let (events, _subscription) = self.subscribe_channel();
        let mut values = Vec::new();
        for event in events {
            match event {
                Event::Value(value) => values.push(value),
                Event::Done(completion) => return completion.into_result().map(|()| values),
            }
        }
        // Every emitter was dropped without a terminal signal.
        Ok(values)
    }

    /// Like [`collect_blocking`](Self::collect_blocking), cancelling the
    /// subscription if the stream has not terminated within `timeout`.
    ///
    /// # Errors
    /// [`TimeoutError`] at the deadline; the stream's failure inside.
    pub fn collect_timeout(&self, timeout: Duration) -> Result<Result<Vec<T>, E>, TimeoutError> {
        let deadline = Instant::now() + timeout;
        let (events, _subscription) = self.subscribe_channel();
        let mut values = Vec::new();
        loop {
            match events.recv_deadline(deadline) {
                Ok(Event::Value(value)) => values.push(value),
                Ok(Event::Done(completion)) => {
                    return Ok(completion.into_result().map(|()| values));
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return Ok(Ok(values)),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    return Err(TimeoutError { timeout });
                }
            }
        }
    }

    fn subscribe_channel(&self) -> (crossbeam_channel::Receiver<Event<T, E>>, Subscription) {
        let (values, events) = crossbeam_channel::unbounded();
        let done = values.clone();
        let subscription = self.subscribe(
            move |value| drop(values.send(Event::Value(value))),
            move |completion| drop(done.send(Event::Done(completion))),
        );
        (events, subscription)
    }

    /// Subscribes with callbacks that receive `downstream` alongside each
    /// event, and ties the upstream subscription to `downstream`.
    pub(crate) fn relay<U, F>(
        &self,
        downstream: &Emitter<U, F>,
        mut on_value: impl FnMut(&Emitter<U, F>, T) + Send + 'static,
        on_completion: impl FnOnce(&Emitter<U, F>, Completion<E>) + Send + 'static,
    ) where
        U: Send + 'static,
        F: Send + 'static,
    {
        if downstream.is_closed() {
            return;
        }
        let values = downstream.clone();
        let done = downstream.clone();
        let subscription = self.subscribe(
            move |value| on_value(&values, value),
            move |completion| on_completion(&done, completion),
        );
        downstream.retain(subscription);
    }

    /// Forwards every event to `downstream`.
    pub(crate) fn subscribe_into(&self, downstream: &Emitter<T, E>) {
        self.relay(
            downstream,
            |downstream, value| {
                downstream.send(value);
            },
            |downstream, completion| downstream.complete(completion),
        );
    }
}
