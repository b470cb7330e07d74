use crate::{
    config::QueueConfig,
    queue::{TaskQueue, WorkItem, WorkResult},
    types::SyncUnsafeCell,
};
use core::num::NonZeroUsize;
use std::{borrow::Cow, sync::Arc, thread};

/// A value guarded by its own parallel [`TaskQueue`].
///
/// Reads run as ordinary items and may overlap each other; writes run as
/// barriers and never overlap anything. Operations take effect in the order
/// they were issued.
#[derive(Debug)]
pub struct BarrierCell<T> {
    queue: TaskQueue,
    value: Arc<SyncUnsafeCell<T>>,
}

impl<T: Send + Sync + 'static> BarrierCell<T> {
    /// Wraps `value`, allowing as many concurrent readers as the machine has
    /// hardware threads.
    pub fn new(value: T) -> Self {
        let readers = thread::available_parallelism().map_or(4, NonZeroUsize::get);
        Self::with_config(QueueConfig::parallel("barrier-cell", readers), value)
    }

    /// Wraps `value`, guarding it with a queue created from `config`.
    pub fn with_config(config: QueueConfig, value: T) -> Self {
        Self {
            queue: TaskQueue::new(config),
            value: Arc::new(SyncUnsafeCell::new(value)),
        }
    }

    /// Same as [`with_config`](Self::with_config) with a serial queue, for
    /// values read rarely enough that readers need not overlap.
    pub fn serial(label: impl Into<Cow<'static, str>>, value: T) -> Self {
        Self::with_config(QueueConfig::serial(label), value)
    }

    /// Label of the guarding queue.
    #[must_use]
    pub fn label(&self) -> &str {
        self.queue.label()
    }

    /// Runs `reader` against the value and blocks for its result.
    ///
    /// # Errors
    /// If `reader` panics.
    pub fn read<R>(&self, reader: impl FnOnce(&T) -> R + Send + 'static) -> WorkResult<R>
    where
        R: Send + 'static,
    {
        let value = Arc::clone(&self.value);
        self.queue.sync(move |_| {
            // SAFETY: only barrier items write, and the queue never runs a
            // barrier alongside any other item.
            let value = unsafe { &*value.get() };
            Ok(reader(value))
        })
    }

    /// Runs `writer` with exclusive access and blocks for its result.
    ///
    /// # Errors
    /// If `writer` panics.
    pub fn modify<R>(&self, writer: impl FnOnce(&mut T) -> R + Send + 'static) -> WorkResult<R>
    where
        R: Send + 'static,
    {
        let value = Arc::clone(&self.value);
        self.queue.sync_barrier(move |_| {
            // SAFETY: a barrier runs alone on the queue.
            let value = unsafe { &mut *value.get() };
            Ok(writer(value))
        })
    }

    /// Schedules `writer` with exclusive access without waiting for it.
    pub fn modify_async(&self, writer: impl FnOnce(&mut T) + Send + 'static) -> WorkItem<()> {
        let value = Arc::clone(&self.value);
        self.queue.submit_barrier(move |_| {
            // SAFETY: a barrier runs alone on the queue.
            writer(unsafe { &mut *value.get() });
            Ok(())
        })
    }

    /// Returns a copy of the value.
    ///
    /// # Errors
    /// If cloning panics.
    pub fn get(&self) -> WorkResult<T>
    where
        T: Clone,
    {
        self.read(T::clone)
    }

    /// Blocks until every issued operation has run.
    pub fn flush(&self) {
        self.queue.wait_idle();
    }

    /// Waits for every issued operation and takes the value out.
    ///
    /// # Errors
    /// Gives the cell back if an operation still holds on to the value.
    pub fn into_inner(self) -> Result<T, Self> {
        self.flush();
        match Arc::try_unwrap(self.value) {
            Ok(value) => Ok(value.into_inner()),
            Err(value) => Err(Self {
                queue: self.queue,
                value,
            }),
        }
    }
}
