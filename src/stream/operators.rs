use crate::{
    cancel::CancellationToken,
    queue::TaskQueue,
    stream::{Completion, Emitter, Event, EventStream},
    sync::Mutex,
    worker::WorkerBuilder,
};
use crossbeam_channel::Receiver;
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::warn;

impl<T: Send + 'static, E: Send + 'static> EventStream<T, E> {
    /// Transforms every value with `transform`.
    pub fn map<U: Send + 'static>(
        self,
        transform: impl Fn(T) -> U + Send + Sync + 'static,
    ) -> EventStream<U, E> {
        let transform = Arc::new(transform);
        EventStream::from_fn(move |downstream| {
            let transform = Arc::clone(&transform);
            self.relay(
                &downstream,
                move |downstream, value| {
                    downstream.send(transform(value));
                },
                |downstream, completion| downstream.complete(completion),
            );
        })
    }

    /// Transforms the failure with `transform`.
    pub fn map_err<F: Send + 'static>(
        self,
        transform: impl Fn(E) -> F + Send + Sync + 'static,
    ) -> EventStream<T, F> {
        let transform = Arc::new(transform);
        EventStream::from_fn(move |downstream| {
            let transform = Arc::clone(&transform);
            self.relay(
                &downstream,
                |downstream, value| {
                    downstream.send(value);
                },
                move |downstream, completion| {
                    downstream.complete(completion.map_err(&*transform));
                },
            );
        })
    }

    /// Shifts every event, the terminal signal included, `by` later.
    ///
    /// Each subscription gets its own timer worker; cancelling the
    /// subscription stops it, even while upstream stays silent. Relative
    /// spacing of events is preserved.
    pub fn delay(self, by: Duration) -> Self {
        EventStream::from_fn(move |downstream: Emitter<T, E>| {
            let (events, timeline) = crossbeam_channel::unbounded::<(Instant, Event<T, E>)>();
            let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
            let timer = {
                let downstream = downstream.clone();
                WorkerBuilder::new()
                    .name("stream-delay")
                    .spawn(move |worker| replay(worker.token(), &timeline, &stopped, &downstream))
            };
            let timer = match timer {
                Ok(timer) => timer,
                Err(err) => {
                    warn!(%err, "failed to start delay timer, delivering without delay");
                    self.subscribe_into(&downstream);
                    return;
                }
            };
            downstream.on_cancel(move || {
                drop(stop);
                timer.cancel();
            });
            let done = events.clone();
            self.relay(
                &downstream,
                move |_, value| drop(events.send((Instant::now() + by, Event::Value(value)))),
                move |_, completion| {
                    drop(done.send((Instant::now() + by, Event::Done(completion))));
                },
            );
        })
    }

    /// Delivers every event from an item of `queue`.
    ///
    /// A serial queue keeps the order of values; a parallel one may reorder
    /// them. The terminal signal is a barrier item, so it always comes after
    /// every value.
    pub fn deliver_on(self, queue: &TaskQueue) -> Self {
        let queue = queue.clone();
        EventStream::from_fn(move |downstream| {
            let (values, done) = (queue.clone(), queue.clone());
            self.relay(
                &downstream,
                move |downstream, value| {
                    let downstream = downstream.clone();
                    values.submit(move |_| {
                        downstream.send(value);
                        Ok(())
                    });
                },
                move |downstream, completion| {
                    let downstream = downstream.clone();
                    done.submit_barrier(move |_| {
                        downstream.complete(completion);
                        Ok(())
                    });
                },
            );
        })
    }

    /// Runs the upstream producer from an item of `queue` instead of the
    /// subscribing thread.
    pub fn subscribe_on(self, queue: &TaskQueue) -> Self {
        let queue = queue.clone();
        EventStream::from_fn(move |downstream: Emitter<T, E>| {
            let upstream = self.clone();
            queue.submit(move |_| {
                upstream.subscribe_into(&downstream);
                Ok(())
            });
        })
    }

    /// Pairs the n-th value of `self` with the n-th value of `other`.
    ///
    /// Finishes once either side has finished and has no unpaired value
    /// left. A failure of either side is forwarded at once.
    pub fn zip<U: Send + 'static>(self, other: EventStream<U, E>) -> EventStream<(T, U), E> {
        join(self, other, ZipState::default)
    }

    /// Emits the latest value of each side whenever either side emits, once
    /// both have emitted at least once.
    ///
    /// Finishes once both sides have finished. A failure of either side is
    /// forwarded at once.
    pub fn combine_latest<U>(self, other: EventStream<U, E>) -> EventStream<(T, U), E>
    where
        T: Clone,
        U: Clone + Send + 'static,
    {
        join(self, other, LatestState::default)
    }
}

/// Body of a delay timer: hands each event of `timeline` to `downstream` at
/// its due time. Returns after the terminal event, or once `stop`
/// disconnects or `token` is cancelled.
fn replay<T, E>(
    token: &CancellationToken,
    timeline: &Receiver<(Instant, Event<T, E>)>,
    stop: &Receiver<()>,
    downstream: &Emitter<T, E>,
) {
    loop {
        let (due, event) = crossbeam_channel::select! {
            recv(timeline) -> event => match event {
                Ok(event) => event,
                Err(_) => return,
            },
            recv(stop) -> _ => return,
        };
        if token.sleep_until(due) {
            return;
        }
        match event {
            Event::Value(value) => {
                downstream.send(value);
            }
            Event::Done(completion) => {
                downstream.complete(completion);
                return;
            }
        }
    }
}

/// State machine merging two upstreams into one downstream.
trait Join<L, R>: Send + 'static {
    type Output;

    fn push_left(&mut self, value: L) -> Option<Self::Output>;
    fn push_right(&mut self, value: R) -> Option<Self::Output>;
    fn finish_left(&mut self);
    fn finish_right(&mut self);
    /// Returns `true` once no further output can be produced.
    fn is_done(&self) -> bool;
}

fn join<L, R, E, J>(
    left: EventStream<L, E>,
    right: EventStream<R, E>,
    init: fn() -> J,
) -> EventStream<J::Output, E>
where
    L: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    J: Join<L, R>,
    J::Output: Send + 'static,
{
    EventStream::from_fn(move |downstream| {
        let state = Arc::new(Mutex::new(init()));
        attach(
            &left,
            &downstream,
            Arc::clone(&state),
            <J as Join<L, R>>::push_left,
            <J as Join<L, R>>::finish_left,
            <J as Join<L, R>>::is_done,
        );
        attach(
            &right,
            &downstream,
            state,
            <J as Join<L, R>>::push_right,
            <J as Join<L, R>>::finish_right,
            <J as Join<L, R>>::is_done,
        );
    })
}

/// Subscribes one side of a [`Join`]. Output is emitted under the state lock
/// so that both sides observe one order.
fn attach<V, O, E, J>(
    upstream: &EventStream<V, E>,
    downstream: &Emitter<O, E>,
    state: Arc<Mutex<J>>,
    push: fn(&mut J, V) -> Option<O>,
    finish: fn(&mut J),
    is_done: fn(&J) -> bool,
) where
    V: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
    J: Send + 'static,
{
    let values = Arc::clone(&state);
    upstream.relay(
        downstream,
        move |downstream, value| {
            let mut state = values.lock();
            if let Some(output) = push(&mut state, value) {
                downstream.send(output);
            }
            if is_done(&state) {
                downstream.finish();
            }
        },
        move |downstream, completion| match completion {
            Completion::Finished => {
                let mut state = state.lock();
                finish(&mut state);
                if is_done(&state) {
                    downstream.finish();
                }
            }
            Completion::Failure(error) => downstream.fail(error),
        },
    );
}

#[derive(Debug)]
struct ZipState<L, R> {
    left: VecDeque<L>,
    right: VecDeque<R>,
    left_finished: bool,
    right_finished: bool,
}

impl<L, R> Default for ZipState<L, R> {
    fn default() -> Self {
        Self {
            left: VecDeque::new(),
            right: VecDeque::new(),
            left_finished: false,
            right_finished: false,
        }
    }
}

impl<L: Send + 'static, R: Send + 'static> Join<L, R> for ZipState<L, R> {
    type Output = (L, R);

    fn push_left(&mut self, value: L) -> Option<(L, R)> {
        match self.right.pop_front() {
            Some(right) => Some((value, right)),
            None => {
                self.left.push_back(value);
                None
            }
        }
    }

    fn push_right(&mut self, value: R) -> Option<(L, R)> {
        match self.left.pop_front() {
            Some(left) => Some((left, value)),
            None => {
                self.right.push_back(value);
                None
            }
        }
    }

    fn finish_left(&mut self) {
        self.left_finished = true;
    }

    fn finish_right(&mut self) {
        self.right_finished = true;
    }

    fn is_done(&self) -> bool {
        (self.left_finished && self.left.is_empty()) || (self.right_finished && self.right.is_empty())
    }
}

#[derive(Debug)]
struct LatestState<L, R> {
    left: Option<L>,
    right: Option<R>,
    left_finished: bool,
    right_finished: bool,
}

impl<L, R> Default for LatestState<L, R> {
    fn default() -> Self {
        Self {
            left: None,
            right: None,
            left_finished: false,
            right_finished: false,
        }
    }
}

impl<L, R> Join<L, R> for LatestState<L, R>
where
    L: Clone + Send + 'static,
    R: Clone + Send + 'static,
{
    type Output = (L, R);

    fn push_left(&mut self, value: L) -> Option<(L, R)> {
        let output = self.right.clone().map(|right| (value.clone(), right));
        self.left = Some(value);
        output
    }

    fn push_right(&mut self, value: R) -> Option<(L, R)> {
        let output = self.left.clone().map(|left| (left, value.clone()));
        self.right = Some(value);
        output
    }

    fn finish_left(&mut self) {
        self.left_finished = true;
    }

    fn finish_right(&mut self) {
        self.right_finished = true;
    }

    fn is_done(&self) -> bool {
        self.left_finished && self.right_finished
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::{queue::TaskQueue, stream::emitter::Control};
    use core::convert::Infallible;

    #[test]
    fn zip_pairs_in_arrival_order_and_ends_with_shorter_side() {
        let mut zip = ZipState::<u8, char>::default();
        assert_eq!(zip.push_left(1), None);
        assert_eq!(zip.push_left(2), None);
        assert_eq!(zip.push_right('a'), Some((1, 'a')));
        zip.finish_left();
        assert!(!zip.is_done());
        assert_eq!(zip.push_right('b'), Some((2, 'b')));
        assert!(zip.is_done());
    }

    #[test]
    fn latest_waits_for_both_sides() {
        let mut latest = LatestState::<u8, char>::default();
        assert_eq!(latest.push_left(1), None);
        assert_eq!(latest.push_left(2), None);
        assert_eq!(latest.push_right('a'), Some((2, 'a')));
        assert_eq!(latest.push_left(3), Some((3, 'a')));
        latest.finish_left();
        assert!(!latest.is_done());
        assert_eq!(latest.push_right('b'), Some((3, 'b')));
        latest.finish_right();
        assert!(latest.is_done());
    }

    #[test]
    fn map_and_map_err() {
        let doubled = EventStream::<u32>::from_iter(vec![1, 2, 3]).map(|value| value * 2);
        assert_eq!(doubled.collect_blocking(), Ok(vec![2, 4, 6]));

        let failed = EventStream::<u32, &str>::fail("boom").map_err(str::len);
        assert_eq!(failed.collect_blocking(), Err(4));
    }

    #[test]
    fn zip_streams() {
        let left = EventStream::<u32>::from_iter(vec![1, 2, 3]);
        let right = EventStream::<&str>::from_iter(vec!["a", "b"]);
        assert_eq!(
            left.zip(right).collect_blocking(),
            Ok(vec![(1, "a"), (2, "b")])
        );
    }

    #[test]
    fn delay_shifts_events() {
        let started = Instant::now();
        let delayed = EventStream::<u32>::from_iter(vec![1, 2]).delay(Duration::from_millis(30));
        assert_eq!(delayed.collect_blocking(), Ok(vec![1, 2]));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn deliver_on_moves_delivery_to_the_queue() {
        let queue = TaskQueue::serial("delivery");
        let caller = std::thread::current().id();
        let threads = EventStream::<u32>::from_iter(vec![1, 2, 3])
            .deliver_on(&queue)
            .map(|value| (value, std::thread::current().id()))
            .collect_blocking()
            .unwrap();
        assert_eq!(
            threads.iter().map(|(value, _)| *value).collect::<Vec<_>>(),
            [1, 2, 3]
        );
        assert!(threads.iter().all(|(_, thread)| *thread != caller));
    }

    #[test]
    fn subscribe_on_runs_producer_on_the_queue() {
        let queue = TaskQueue::serial("producer");
        let caller = std::thread::current().id();
        let stream = EventStream::<std::thread::ThreadId>::from_fn(|emitter| {
            emitter.send(std::thread::current().id());
            emitter.finish();
        })
        .subscribe_on(&queue);
        let producers = stream.collect_blocking().unwrap();
        assert_eq!(producers.len(), 1);
        assert_ne!(producers[0], caller);
    }

    #[test]
    fn deliver_on_a_parallel_queue_finishes_after_every_value() {
        let queue = TaskQueue::parallel("fan-out", 4);
        for _ in 0..10 {
            let mut values = EventStream::<u32>::from_iter((0..50).collect::<Vec<_>>())
                .deliver_on(&queue)
                .collect_timeout(Duration::from_secs(5))
                .unwrap()
                .unwrap();
            values.sort_unstable();
            assert_eq!(values, (0..50).collect::<Vec<_>>());
        }
    }

    #[test]
    fn delay_timer_stops_on_cancel_while_upstream_is_silent() {
        let (events, timeline) = crossbeam_channel::unbounded::<(Instant, Event<u32, Infallible>)>();
        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
        let (exited, exit) = crossbeam_channel::bounded(1);
        let downstream = Emitter::new(Arc::new(Control::new()), |_: u32| {}, |_| {});
        std::thread::spawn(move || {
            replay(&CancellationToken::new(), &timeline, &stopped, &downstream);
            drop(exited.send(()));
        });
        assert!(exit.recv_timeout(Duration::from_millis(50)).is_err());
        drop(stop);
        assert!(exit.recv_timeout(Duration::from_secs(5)).is_ok());
        // The upstream side was never closed.
        drop(events);
    }

    #[test]
    fn cancelled_delay_subscription_delivers_nothing() {
        let upstream = Arc::new(Mutex::new(None));
        let stream = {
            let upstream = Arc::clone(&upstream);
            EventStream::<u32>::from_fn(move |emitter| *upstream.lock() = Some(emitter))
        };
        let received = Arc::new(Mutex::new(Vec::new()));
        let subscription = {
            let received = Arc::clone(&received);
            stream
                .delay(Duration::from_millis(20))
                .sink(move |value| received.lock().push(value))
        };
        let emitter = upstream.lock().take().unwrap();
        assert!(emitter.send(1));
        assert!(subscription.cancel());
        assert!(!emitter.send(2));
        std::thread::sleep(Duration::from_millis(60));
        assert!(received.lock().is_empty());
    }
}
