//! Combinators over an ordered list of input streams.
//!
//! Every combinator reports values in input order: the index of an input in
//! the list decides where its values land in an emitted `Vec`, no matter
//! which input emitted first.

use crate::{
    stream::{Completion, Emitter, EventStream},
    sync::Mutex,
};
use core::convert::Infallible;
use std::sync::Arc;

/// Buffers values tagged with their input index and releases them in chunks
/// sorted by index.
#[derive(Debug)]
struct Chunker<V> {
    size: usize,
    buffer: Vec<(usize, V)>,
    /// Inputs that have not terminated yet.
    running: usize,
}

impl<V> Chunker<V> {
    fn new(inputs: usize) -> Self {
        Self {
            size: inputs,
            buffer: Vec::with_capacity(inputs),
            running: inputs,
        }
    }

    fn push(&mut self, input: usize, value: V) -> Option<Vec<V>> {
        self.buffer.push((input, value));
        (self.buffer.len() >= self.size).then(|| self.drain_sorted())
    }

    /// Marks one input terminated. Returns the partial chunk once the last
    /// input has terminated.
    fn finish_input(&mut self) -> Option<Vec<V>> {
        self.running = self.running.saturating_sub(1);
        (self.running == 0).then(|| self.drain_sorted())
    }

    fn discard(&mut self) {
        self.buffer.clear();
    }

    fn drain_sorted(&mut self) -> Vec<V> {
        let mut chunk = core::mem::take(&mut self.buffer);
        // Stable: values of one input keep their emission order.
        chunk.sort_by_key(|&(input, _)| input);
        chunk.into_iter().map(|(_, value)| value).collect()
    }
}

/// Subscribes every input into one [`Chunker`].
///
/// `recover` decides what an input failure becomes: `Ok(value)` records the
/// value and counts the input as terminated, `Err(error)` drops the buffer
/// and fails the whole stream.
fn gather<T, E, V, F>(
    inputs: Vec<EventStream<T, E>>,
    wrap: fn(T) -> V,
    recover: fn(E) -> Result<V, F>,
) -> EventStream<Vec<V>, F>
where
    T: Send + 'static,
    E: Send + 'static,
    V: Send + 'static,
    F: Send + 'static,
{
    EventStream::from_fn(move |downstream: Emitter<Vec<V>, F>| {
        if inputs.is_empty() {
            downstream.finish();
            return;
        }
        let chunker = Arc::new(Mutex::new(Chunker::new(inputs.len())));
        for (index, input) in inputs.iter().enumerate() {
            let (values, done) = (Arc::clone(&chunker), Arc::clone(&chunker));
            input.relay(
                &downstream,
                move |downstream, value| {
                    let mut chunker = values.lock();
                    if let Some(chunk) = chunker.push(index, wrap(value)) {
                        downstream.send(chunk);
                    }
                },
                move |downstream, completion| {
                    let mut chunker = done.lock();
                    if let Completion::Failure(error) = completion {
                        match recover(error) {
                            Ok(value) => {
                                if let Some(chunk) = chunker.push(index, value) {
                                    downstream.send(chunk);
                                }
                            }
                            Err(error) => {
                                chunker.discard();
                                downstream.fail(error);
                                return;
                            }
                        }
                    }
                    if let Some(rest) = chunker.finish_input() {
                        if !rest.is_empty() {
                            downstream.send(rest);
                        }
                        downstream.finish();
                    }
                },
            );
        }
    })
}

/// Runs every input and emits their values in chunks of `inputs.len()`,
/// each chunk sorted into input order.
///
/// This is collect-then-sort: a chunk is released once it is full, and the
/// partial chunk left when every input has finished is flushed before the
/// stream finishes. The first input failure fails the stream and drops the
/// buffered values.
pub fn merge_and_sort<T, E, I>(inputs: I) -> EventStream<Vec<T>, E>
where
    T: Send + 'static,
    E: Send + 'static,
    I: IntoIterator<Item = EventStream<T, E>>,
{
    gather(inputs.into_iter().collect(), core::convert::identity, Err)
}

/// Pairs up the n-th values of every input into one `Vec` in input order.
///
/// Equivalent to a left fold of [`EventStream::zip`]: finishes once any
/// input has finished with no unpaired value left. An empty input list
/// finishes immediately.
pub fn zip_and_sort<T, E, I>(inputs: I) -> EventStream<Vec<T>, E>
where
    T: Send + 'static,
    E: Send + 'static,
    I: IntoIterator<Item = EventStream<T, E>>,
{
    let mut inputs = inputs.into_iter();
    let Some(first) = inputs.next() else {
        return EventStream::empty();
    };
    inputs.fold(first.map(|value| vec![value]), |sorted, next| {
        sorted.zip(next).map(|(mut values, value)| {
            values.push(value);
            values
        })
    })
}

/// Emits the latest value of every input, in input order, whenever any
/// input emits and once all of them have emitted.
///
/// Equivalent to a left fold of [`EventStream::combine_latest`]. An empty
/// input list finishes immediately.
pub fn combine_latest_and_sort<T, E, I>(inputs: I) -> EventStream<Vec<T>, E>
where
    T: Clone + Send + 'static,
    E: Send + 'static,
    I: IntoIterator<Item = EventStream<T, E>>,
{
    let mut inputs = inputs.into_iter();
    let Some(first) = inputs.next() else {
        return EventStream::empty();
    };
    inputs.fold(first.map(|value| vec![value]), |sorted, next| {
        sorted.combine_latest(next).map(|(mut values, value)| {
            values.push(value);
            values
        })
    })
}

/// Like [`merge_and_sort`], but every outcome is wrapped in a `Result`: an
/// input failure becomes an `Err` entry in place of that input's next value
/// and terminates only that input.
pub fn collect_all_results<T, E, I>(inputs: I) -> EventStream<Vec<Result<T, E>>, Infallible>
where
    T: Send + 'static,
    E: Send + 'static,
    I: IntoIterator<Item = EventStream<T, E>>,
{
    gather(inputs.into_iter().collect(), Ok, |error| Ok(Err(error)))
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn chunker_sorts_each_full_chunk_by_input() {
        let mut chunker = Chunker::new(3);
        assert_eq!(chunker.push(2, "c"), None);
        assert_eq!(chunker.push(0, "a"), None);
        assert_eq!(chunker.push(1, "b"), Some(vec!["a", "b", "c"]));
        assert_eq!(chunker.push(1, "b2"), None);
        assert_eq!(chunker.push(1, "b3"), None);
        assert_eq!(chunker.push(0, "a2"), Some(vec!["a2", "b2", "b3"]));
    }

    #[test]
    fn chunker_flushes_partial_chunk_after_last_input() {
        let mut chunker = Chunker::new(2);
        assert_eq!(chunker.push(1, 10), None);
        assert_eq!(chunker.finish_input(), None);
        assert_eq!(chunker.finish_input(), Some(vec![10]));
    }

    #[test]
    fn merge_and_sort_orders_by_input_not_by_arrival() {
        let inputs = vec![
            EventStream::<&str>::just("slow").delay(Duration::from_millis(40)),
            EventStream::just("fast"),
            EventStream::just("medium").delay(Duration::from_millis(20)),
        ];
        assert_eq!(
            merge_and_sort(inputs).collect_blocking(),
            Ok(vec![vec!["slow", "fast", "medium"]])
        );
    }

    #[test]
    fn merge_and_sort_fails_with_first_failure() {
        let inputs = vec![
            EventStream::<u8, &str>::just(1),
            EventStream::fail("broken"),
            EventStream::just(3),
        ];
        assert_eq!(merge_and_sort(inputs).collect_blocking(), Err("broken"));
    }

    #[test]
    fn collect_all_results_keeps_going_after_a_failure() {
        let inputs = vec![
            EventStream::<u8, &str>::just(1),
            EventStream::fail("broken"),
            EventStream::just(3),
        ];
        assert_eq!(
            collect_all_results(inputs).collect_blocking(),
            Ok(vec![vec![Ok(1), Err("broken"), Ok(3)]])
        );
    }

    #[test]
    fn empty_input_lists_finish_immediately() {
        let none = Vec::<EventStream<u8>>::new;
        assert_eq!(merge_and_sort(none()).collect_blocking(), Ok(vec![]));
        assert_eq!(zip_and_sort(none()).collect_blocking(), Ok(vec![]));
        assert_eq!(combine_latest_and_sort(none()).collect_blocking(), Ok(vec![]));
        assert_eq!(collect_all_results(none()).collect_blocking(), Ok(vec![]));
    }

    #[test]
    fn combine_latest_and_sort_emits_once_every_input_has_a_value() {
        let inputs = vec![
            EventStream::<u8>::from_iter(vec![1, 2]),
            EventStream::just(10),
            EventStream::from_iter(vec![100, 200]),
        ];
        // Inputs run one after the other, so only the last one interleaves.
        assert_eq!(
            combine_latest_and_sort(inputs).collect_blocking(),
            Ok(vec![vec![2, 10, 100], vec![2, 10, 200]])
        );
    }
}
