//! Channel registry entries: the typed channel and its type-erased view.

use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::{Mutex, RwLock};

use crate::stats::RateCounter;
use crate::store::MessageStore;
use crate::subscription::{SubscriptionControl, SubscriptionCore};

/// Public metadata for one channel, as returned by channel enumeration.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub name: String,
    pub body_type: &'static str,
    pub subscription_count: usize,
    pub stored_keys: usize,
    pub total_published: u64,
    /// Publishes per second over the window since the previous
    /// enumeration.
    pub publish_rate: f64,
    pub last_published_by: Option<String>,
    /// Wall-clock nanoseconds of the most recent publish.
    pub last_published_at: Option<i64>,
}

/// A named, typed topic. One body type for the channel's lifetime; the
/// store is materialised on the first state-storing publish or the first
/// fetch-state subscribe.
pub(crate) struct Channel<T> {
    name: String,
    body_type: &'static str,
    publishes: RateCounter,
    store: OnceLock<MessageStore<T>>,
    subscriptions: RwLock<Vec<Arc<SubscriptionCore<T>>>>,
    last_publish: Mutex<Option<(Option<Arc<str>>, i64)>>,
}

impl<T: Clone + Send + Sync + 'static> Channel<T> {
    pub(crate) fn new(name: String, now_ns: i64) -> Self {
        Self {
            name,
            body_type: std::any::type_name::<T>(),
            publishes: RateCounter::new(now_ns),
            store: OnceLock::new(),
            subscriptions: RwLock::new(Vec::new()),
            last_publish: Mutex::new(None),
        }
    }

    pub(crate) fn store(&self) -> &MessageStore<T> {
        self.store.get_or_init(MessageStore::new)
    }

    pub(crate) fn existing_store(&self) -> Option<&MessageStore<T>> {
        self.store.get()
    }

    pub(crate) fn add_subscription(&self, subscription: Arc<SubscriptionCore<T>>) {
        self.subscriptions.write().push(subscription);
    }

    /// Snapshot of the subscriber list for fan-out. Additions racing the
    /// snapshot are picked up by the next publish; removals never fault
    /// the iteration.
    pub(crate) fn subscribers(&self) -> Vec<Arc<SubscriptionCore<T>>> {
        self.subscriptions.read().clone()
    }

    pub(crate) fn record_publish(&self, from: Option<Arc<str>>, wall_ns: i64) {
        self.publishes.increment();
        *self.last_publish.lock() = Some((from, wall_ns));
    }
}

/// Object-safe registry view used where the body type is unknown.
pub(crate) trait AnyChannel: Send + Sync {
    fn body_type(&self) -> &'static str;
    fn subscription_count(&self) -> usize;
    fn remove_subscription(&self, id: u64) -> bool;
    fn delete_stored(&self, key: &str) -> bool;
    fn reset_store(&self) -> usize;
    fn info(&self, now_ns: i64) -> ChannelInfo;
}

impl<T: Clone + Send + Sync + 'static> AnyChannel for Channel<T> {
    fn body_type(&self) -> &'static str {
        self.body_type
    }

    fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    fn remove_subscription(&self, id: u64) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| SubscriptionControl::id(s.as_ref()) != id);
        subscriptions.len() != before
    }

    fn delete_stored(&self, key: &str) -> bool {
        self.existing_store().is_some_and(|store| store.try_delete(key))
    }

    fn reset_store(&self) -> usize {
        self.existing_store().map_or(0, MessageStore::reset)
    }

    fn info(&self, now_ns: i64) -> ChannelInfo {
        let (last_published_by, last_published_at) = match self.last_publish.lock().clone() {
            Some((from, at)) => (from.map(|f| f.to_string()), Some(at)),
            None => (None, None),
        };
        ChannelInfo {
            name: self.name.clone(),
            body_type: self.body_type,
            subscription_count: self.subscription_count(),
            stored_keys: self.existing_store().map_or(0, MessageStore::len),
            total_published: self.publishes.total(),
            publish_rate: self.publishes.rate(now_ns),
            last_published_by,
            last_published_at,
        }
    }
}
