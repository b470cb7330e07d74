use core::cell::UnsafeCell;
use derive_more::{Deref, DerefMut, Display};
use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;
use std::{
    collections::{HashMap as _HashMap, HashSet as _HashSet},
    sync::Arc,
};

/// A minimal `UnsafeCell` wrapper that is `Sync` when `T: Send + Sync`.
///
/// Used by [`BarrierCell`](crate::queue::BarrierCell), where exclusion is
/// guaranteed by the owning queue's scheduling (a barrier never overlaps any
/// other item) rather than by a lock.
#[derive(Debug, Deref, DerefMut)]
#[repr(transparent)]
pub(crate) struct SyncUnsafeCell<T>(UnsafeCell<T>);

unsafe impl<T: Send + Sync> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    pub(crate) const fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }

    pub(crate) fn into_inner(self) -> T {
        self.0.into_inner()
    }
}

/// Scheduling priority hint, ordered from least to most urgent.
///
/// Priorities never preempt running work. A [`WorkerPool`](crate::worker::WorkerPool)
/// starts queued jobs of higher priority first, and the hint is attached to
/// worker thread names and log records.
#[derive(Debug, Display, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Work the user is not aware of, e.g. prefetching or maintenance.
    #[display("background")]
    Background,
    /// Long-running work with user-visible progress.
    #[display("utility")]
    Utility,
    /// The priority used when nothing else is specified.
    #[default]
    #[display("default")]
    Default,
    /// Work the user started and is waiting on.
    #[display("user-initiated")]
    UserInitiated,
    /// Work that must finish before the next interaction.
    #[display("user-interactive")]
    UserInteractive,
}

/// Name of an operation in an [`OperationGraph`](crate::graph::OperationGraph).
///
/// Cheap to clone; compares and hashes by its string contents.
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("{_0}")]
pub struct OperationId(Arc<str>);

impl OperationId {
    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OperationId {
    fn from(id: &str) -> Self {
        Self(id.into())
    }
}

impl From<String> for OperationId {
    fn from(id: String) -> Self {
        Self(id.into())
    }
}

impl From<&OperationId> for OperationId {
    fn from(id: &OperationId) -> Self {
        id.clone()
    }
}

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
pub(crate) type HashSet<T> = _HashSet<T, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
