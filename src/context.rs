use crate::{
    cancel::CancellationToken,
    worker::{LocalStorage, WorkerBuilder},
};
use core::sync::atomic::{AtomicU64, Ordering};
use derive_more::{Debug, Display};
use std::{any::Any, sync::Arc};

/// Identity of a [`RequestContext`], unique within the process.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("request-{_0}")]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Context of one logical request, passed explicitly to the work done on
/// its behalf.
///
/// Holds a request id, a cancellation token and a table of typed values.
/// Clones are handles to the same context. Child work gets its own context
/// from [`fork`](Self::fork): a new id, a copy of the values, and the same
/// token, so cancelling a request reaches everything forked from it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    id: RequestId,
    parent: Option<RequestId>,
    token: CancellationToken,
    #[debug(skip)]
    values: LocalStorage,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    /// Starts a new root request.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: RequestId::next(),
            parent: None,
            token: CancellationToken::new(),
            values: LocalStorage::new(),
        }
    }

    /// Adds a value, builder style.
    #[must_use]
    pub fn with_value<T: Any + Send + Sync>(self, key: impl Into<String>, value: T) -> Self {
        self.values.set(key, value);
        self
    }

    /// The request's id.
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Id of the context this one was forked from.
    #[must_use]
    pub fn parent(&self) -> Option<RequestId> {
        self.parent
    }

    /// The request's cancellation token, shared with every fork.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns `true` once the request is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stores `value` under `key` in this context only.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.values.set(key, value);
    }

    /// Returns the value under `key` if present and of type `T`.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.values.get(key)
    }

    /// Child context for work started on behalf of this request.
    ///
    /// Values set on the child afterwards stay invisible to the parent and
    /// the other way round.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            id: RequestId::next(),
            parent: Some(self.id),
            token: self.token.clone(),
            values: self.values.snapshot(),
        }
    }

    /// Copies the context's values into the local table of the worker built
    /// by `builder`.
    pub fn seed(&self, builder: WorkerBuilder) -> WorkerBuilder {
        builder.locals_from(&self.values)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn fork_copies_values_and_shares_cancellation() {
        let root = RequestContext::new().with_value("user", String::from("ada"));
        let child = root.fork();
        assert_eq!(child.parent(), Some(root.id()));
        assert_ne!(child.id(), root.id());
        assert_eq!(child.get::<String>("user").as_deref().map(String::as_str), Some("ada"));

        child.set("step", 2u8);
        root.set("user", String::from("grace"));
        assert!(root.get::<u8>("step").is_none());
        assert_eq!(child.get::<String>("user").as_deref().map(String::as_str), Some("ada"));

        root.token().cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn seed_hands_values_to_a_worker() {
        let context = RequestContext::new().with_value("attempt", 3u32);
        let worker = context
            .seed(WorkerBuilder::new().name("seeded"))
            .spawn(|_| {})
            .unwrap();
        worker.join();
        assert_eq!(worker.local::<u32>("attempt").as_deref(), Some(&3));
    }
}
