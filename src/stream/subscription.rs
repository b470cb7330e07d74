use crate::{stream::emitter::Control, sync::Mutex};
use std::sync::Arc;

/// Subscriber side of one subscription.
///
/// Dropping the subscription cancels it; keep it alive, or move it into a
/// [`SubscriptionBag`], for as long as values should arrive.
#[must_use = "dropping a subscription cancels it"]
#[derive(Debug)]
pub struct Subscription {
    control: Arc<Control>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.control.cancel();
    }
}

impl Subscription {
    pub(super) fn new(control: Arc<Control>) -> Self {
        Self { control }
    }

    /// Stops delivery and releases the producer's resources.
    ///
    /// Returns `true` for the call that cancelled; every later call is a
    /// no-op returning `false`. No delivery starts once this returns; one
    /// already running on another thread completes.
    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    /// Returns `true` once [`cancel`](Self::cancel) was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// Moves the subscription into `bag`.
    pub fn store_in(self, bag: &SubscriptionBag) {
        bag.insert(self);
    }
}

/// Caller-owned set of subscriptions, all cancelled when the bag is dropped.
#[derive(Debug)]
pub struct SubscriptionBag {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Default for SubscriptionBag {
    fn default() -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
        }
    }
}

impl Drop for SubscriptionBag {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

impl SubscriptionBag {
    /// Creates an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `subscription`.
    pub fn insert(&self, subscription: Subscription) {
        self.subscriptions.lock().push(subscription);
    }

    /// Cancels and removes every subscription in the bag.
    pub fn cancel_all(&self) {
        let subscriptions = core::mem::take(&mut *self.subscriptions.lock());
        for subscription in &subscriptions {
            subscription.cancel();
        }
    }

    /// Number of subscriptions held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Returns `true` if the bag holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.lock().is_empty()
    }
}
