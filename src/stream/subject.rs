use crate::{
    stream::{Completion, Emitter, EventStream},
    sync::Mutex,
};
use core::convert::Infallible;
use derive_more::Debug;
use std::sync::Arc;
use tracing::trace;

/// Emitters of the live subscriptions of a subject, plus its terminal signal
/// once sent.
#[derive(Debug)]
struct Subscribers<T, E> {
    #[debug(skip)]
    emitters: Vec<Emitter<T, E>>,
    #[debug(skip)]
    completion: Option<Completion<E>>,
}

impl<T, E: Clone> Subscribers<T, E> {
    fn new() -> Self {
        Self {
            emitters: Vec::new(),
            completion: None,
        }
    }

    fn is_terminated(&self) -> bool {
        self.completion.is_some()
    }

    fn prune(&mut self) {
        self.emitters.retain(|emitter| !emitter.is_closed());
    }

    fn broadcast(&mut self, value: &T)
    where
        T: Clone,
    {
        self.prune();
        for emitter in &self.emitters {
            emitter.send(value.clone());
        }
    }

    fn terminate(&mut self, completion: Completion<E>) {
        trace!(subscribers = self.emitters.len(), "subject terminated");
        for emitter in self.emitters.drain(..) {
            emitter.complete(completion.clone());
        }
        self.completion = Some(completion);
    }

    /// Registers `emitter`, or replays the terminal signal to it.
    fn attach(&mut self, emitter: Emitter<T, E>) {
        match &self.completion {
            Some(completion) => emitter.complete(completion.clone()),
            None => self.emitters.push(emitter),
        }
    }
}

/// Hot stream fed by explicit [`send`](Self::send) calls.
///
/// Subscribers only see values sent after they subscribed. Once the subject
/// has finished or failed, further sends are ignored and late subscribers
/// receive the terminal signal right away.
///
/// Delivery happens on the sending thread, under the subject's lock:
/// subscriber callbacks must not send into the same subject.
#[derive(Debug)]
pub struct PassthroughSubject<T, E = Infallible> {
    subscribers: Arc<Mutex<Subscribers<T, E>>>,
}

impl<T, E> Clone for PassthroughSubject<T, E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<T, E> Default for PassthroughSubject<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> PassthroughSubject<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a subject without subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Subscribers::new())),
        }
    }

    /// Delivers `value` to every current subscriber.
    pub fn send(&self, value: T) {
        let mut subscribers = self.subscribers.lock();
        if !subscribers.is_terminated() {
            subscribers.broadcast(&value);
        }
    }

    /// Finishes every current and future subscription.
    pub fn finish(&self) {
        self.complete(Completion::Finished);
    }

    /// Fails every current and future subscription with `error`.
    pub fn fail(&self, error: E) {
        self.complete(Completion::Failure(error));
    }

    fn complete(&self, completion: Completion<E>) {
        let mut subscribers = self.subscribers.lock();
        if !subscribers.is_terminated() {
            subscribers.terminate(completion);
        }
    }

    /// Stream whose subscriptions attach to this subject.
    pub fn stream(&self) -> EventStream<T, E> {
        let subscribers = Arc::clone(&self.subscribers);
        EventStream::from_fn(move |emitter| subscribers.lock().attach(emitter))
    }

    /// Number of subscriptions that are still live.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.prune();
        subscribers.emitters.len()
    }
}

#[derive(Debug)]
struct CurrentState<T, E> {
    value: T,
    subscribers: Subscribers<T, E>,
}

/// Hot stream holding a current value.
///
/// Every new subscriber receives the current value first, then every value
/// sent afterwards. Otherwise behaves like [`PassthroughSubject`].
#[derive(Debug)]
pub struct CurrentValueSubject<T, E = Infallible> {
    state: Arc<Mutex<CurrentState<T, E>>>,
}

impl<T, E> Clone for CurrentValueSubject<T, E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T, E> CurrentValueSubject<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a subject holding `initial`.
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self {
            state: Arc::new(Mutex::new(CurrentState {
                value: initial,
                subscribers: Subscribers::new(),
            })),
        }
    }

    /// The current value.
    #[must_use]
    pub fn value(&self) -> T {
        self.state.lock().value.clone()
    }

    /// Replaces the current value and delivers it to every subscriber.
    ///
    /// Ignored once the subject has terminated.
    pub fn send(&self, value: T) {
        let mut state = self.state.lock();
        if state.subscribers.is_terminated() {
            return;
        }
        state.subscribers.broadcast(&value);
        state.value = value;
    }

    /// Finishes every current and future subscription.
    pub fn finish(&self) {
        self.complete(Completion::Finished);
    }

    /// Fails every current and future subscription with `error`.
    pub fn fail(&self, error: E) {
        self.complete(Completion::Failure(error));
    }

    fn complete(&self, completion: Completion<E>) {
        let mut state = self.state.lock();
        if !state.subscribers.is_terminated() {
            state.subscribers.terminate(completion);
        }
    }

    /// Stream that starts with the current value.
    pub fn stream(&self) -> EventStream<T, E> {
        let state = Arc::clone(&self.state);
        EventStream::from_fn(move |emitter: Emitter<T, E>| {
            let mut state = state.lock();
            if !state.subscribers.is_terminated() {
                emitter.send(state.value.clone());
            }
            state.subscribers.attach(emitter);
        })
    }

    /// Number of subscriptions that are still live.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.prune();
        state.subscribers.emitters.len()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::{primitives::Lock, stream::Subscription};

    type Recorded<T> = (
        Arc<Lock<Vec<T>>>,
        Arc<Lock<Option<Completion<&'static str>>>>,
        Subscription,
    );

    fn record<T: Send + 'static>(stream: &EventStream<T, &'static str>) -> Recorded<T> {
        let values = Arc::new(Lock::new(Vec::new()));
        let completion = Arc::new(Lock::new(None));
        let subscription = {
            let (values, completion) = (Arc::clone(&values), Arc::clone(&completion));
            stream.subscribe(
                move |value| values.lock().push(value),
                move |done| *completion.lock() = Some(done),
            )
        };
        (values, completion, subscription)
    }

    #[test]
    fn passthrough_delivers_only_later_values() {
        let subject = PassthroughSubject::<u32, &'static str>::new();
        subject.send(0);
        let (values, completion, _subscription) = record(&subject.stream());
        subject.send(1);
        subject.send(2);
        subject.fail("gone");
        subject.send(3);
        assert_eq!(*values.lock(), [1, 2]);
        assert_eq!(*completion.lock(), Some(Completion::Failure("gone")));

        let (late, late_completion, _late) = record(&subject.stream());
        assert!(late.lock().is_empty());
        assert_eq!(*late_completion.lock(), Some(Completion::Failure("gone")));
    }

    #[test]
    fn cancelled_subscribers_are_pruned() {
        let subject = PassthroughSubject::<u32, &'static str>::new();
        let (values, _, subscription) = record(&subject.stream());
        let (_, _, _kept) = record(&subject.stream());
        assert_eq!(subject.subscriber_count(), 2);
        subject.send(1);
        drop(subscription);
        subject.send(2);
        assert_eq!(*values.lock(), [1]);
        assert_eq!(subject.subscriber_count(), 1);
    }

    #[test]
    fn current_value_replays_latest_value() {
        let subject = CurrentValueSubject::<&str, &'static str>::new("initial");
        subject.send("first");
        let (values, completion, _subscription) = record(&subject.stream());
        subject.send("second");
        assert_eq!(subject.value(), "second");
        subject.finish();
        assert_eq!(*values.lock(), ["first", "second"]);
        assert_eq!(*completion.lock(), Some(Completion::Finished));
    }
}
