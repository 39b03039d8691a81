//! The CrossBar hub: channel registry, publish fan-out, subscriptions,
//! wildcard routing and lifecycle events.

use std::any::{Any, TypeId};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::channel::{AnyChannel, Channel, ChannelInfo};
use crate::clock::{Clock, QuantaClock};
use crate::config::{CrossBarOptions, SubscribeOptions};
use crate::message::Message;
use crate::pattern;
use crate::stats::StatsTracker;
use crate::subscription::{
    BoxedHandlerFuture, Handler, HandlerResult, OfferOutcome, Subscription, SubscriptionConfig,
    SubscriptionControl, SubscriptionCore,
};
use crate::{Error, Result};

const LIFECYCLE_CHANNEL: &str = "lifecycle";
const TRACE_CHANNEL: &str = "message.traces";

/// Optional per-publish envelope fields.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub key: Option<Arc<str>>,
    pub correlation_id: i64,
    /// Update the channel's last-value store under `key` before fan-out.
    pub store: bool,
    pub from: Option<Arc<str>>,
    pub tag_a: i64,
}

impl PublishOptions {
    pub fn key(mut self, key: impl AsRef<str>) -> Self {
        self.key = Some(Arc::from(key.as_ref()));
        self
    }

    pub fn from(mut self, from: impl AsRef<str>) -> Self {
        self.from = Some(Arc::from(from.as_ref()));
        self
    }

    pub fn store(mut self, store: bool) -> Self {
        self.store = store;
        self
    }

    pub fn correlation_id(mut self, correlation_id: i64) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn tag_a(mut self, tag_a: i64) -> Self {
        self.tag_a = tag_a;
        self
    }

    /// Shorthand for a state-storing publish under `key`.
    pub fn stored(key: impl AsRef<str>) -> Self {
        Self::default().key(key).store(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEventType {
    ChannelCreated,
    ChannelDeleted,
    SubscriptionCreated,
    SubscriptionDisposed,
}

/// Published on the lifecycle system channel when tracking is enabled.
/// System channels never emit events about themselves.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub event_type: LifecycleEventType,
    pub channel: String,
    pub subscription: Option<String>,
    pub body_type: &'static str,
    pub timestamp: i64,
}

/// Published on the trace system channel when message tracing is enabled.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub channel: String,
    pub message_id: u64,
    pub key: Option<Arc<str>>,
    pub from: Option<Arc<str>>,
    pub timestamp: i64,
}

struct ChannelSlot {
    type_id: TypeId,
    /// `Arc<Channel<T>>` behind `Any` for typed access.
    any: Arc<dyn Any + Send + Sync>,
    /// The same channel behind its object-safe registry view.
    ops: Arc<dyn AnyChannel>,
}

struct WildcardEntry {
    subscription_id: u64,
    pattern: String,
    type_id: TypeId,
    /// `Arc<SubscriptionCore<T>>` behind `Any`.
    target: Arc<dyn Any + Send + Sync>,
}

struct SubscriptionSlot {
    control: Arc<dyn SubscriptionControl>,
    /// Set for literal subscriptions; wildcard subscriptions live in the
    /// wildcard registry instead.
    literal_channel: Option<String>,
}

struct HubInner {
    options: CrossBarOptions,
    clock: Arc<dyn Clock>,
    lifecycle_channel: String,
    trace_channel: String,
    next_message_id: AtomicU64,
    next_subscription_id: AtomicU64,
    channels: DashMap<String, ChannelSlot>,
    user_channel_count: AtomicUsize,
    wildcards: RwLock<Vec<WildcardEntry>>,
    subscriptions: DashMap<u64, SubscriptionSlot>,
    disposed: AtomicBool,
}

/// The in-process pub/sub hub.
///
/// Cheap to clone; all clones share the same registry. Publishing never
/// blocks on consumer slowness unless a subscription opted into
/// `FailPublish`, in which case the publisher observes a synchronous
/// failed publish.
#[derive(Clone)]
pub struct CrossBar {
    inner: Arc<HubInner>,
}

impl Default for CrossBar {
    fn default() -> Self {
        Self::new()
    }
}

impl CrossBar {
    pub fn new() -> Self {
        Self::with_options(CrossBarOptions::default()).expect("default options are valid")
    }

    pub fn with_options(options: CrossBarOptions) -> Result<Self> {
        Self::with_options_and_clock(options, Arc::new(QuantaClock::new()))
    }

    pub fn with_options_and_clock(options: CrossBarOptions, clock: Arc<dyn Clock>) -> Result<Self> {
        options.validate()?;
        let prefix = options.system_channel_prefix.clone();
        let inner = Arc::new(HubInner {
            lifecycle_channel: format!("{prefix}{LIFECYCLE_CHANNEL}"),
            trace_channel: format!("{prefix}{TRACE_CHANNEL}"),
            options,
            clock,
            next_message_id: AtomicU64::new(1),
            next_subscription_id: AtomicU64::new(1),
            channels: DashMap::new(),
            user_channel_count: AtomicUsize::new(0),
            wildcards: RwLock::new(Vec::new()),
            subscriptions: DashMap::new(),
            disposed: AtomicBool::new(false),
        });
        // System channels are bound by the hub so later subscribers get a
        // type-checked channel instead of first-touch creating one.
        if inner.options.enable_lifecycle_tracking {
            inner.get_or_create_channel::<LifecycleEvent>(&inner.lifecycle_channel, false)?;
        }
        if inner.options.enable_message_tracing {
            inner.get_or_create_channel::<TraceEvent>(&inner.trace_channel, false)?;
        }
        Ok(Self { inner })
    }

    /// Publishes `body` on `channel` with default envelope fields.
    pub fn publish<T>(&self, channel: &str, body: T) -> Result<()>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.publish_with(channel, body, PublishOptions::default())
    }

    /// Publishes `body` on `channel`, creating the channel on first use.
    ///
    /// Fan-out offers the envelope to every direct subscription, then to
    /// every wildcard subscription whose pattern matches the channel
    /// name. Returns once each of them has accepted or rejected the
    /// envelope per its slow-consumer policy.
    pub fn publish_with<T>(&self, channel: &str, body: T, options: PublishOptions) -> Result<()>
    where
        T: Clone + Send + Sync + 'static,
    {
        let inner = &self.inner;
        inner.ensure_live()?;
        inner.validate_user_channel_name(channel)?;
        if options.store && options.key.is_none() {
            return Err(Error::FailedPublish(format!(
                "state-storing publish on '{channel}' requires a key"
            )));
        }
        inner.publish_internal(channel, body, options, true)
    }

    /// Subscribes with default options. See [`subscribe_with`].
    ///
    /// [`subscribe_with`]: CrossBar::subscribe_with
    pub fn subscribe<T, F, Fut>(&self, pattern: &str, handler: F) -> Result<Subscription>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_with(pattern, handler, SubscribeOptions::default())
    }

    /// Subscribes to a literal channel or a wildcard pattern.
    ///
    /// Must be called from within a tokio runtime: every subscription
    /// owns one spawned worker driving its dequeue loop.
    pub fn subscribe_with<T, F, Fut>(
        &self,
        pattern: &str,
        handler: F,
        options: SubscribeOptions,
    ) -> Result<Subscription>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let inner = &self.inner;
        inner.ensure_live()?;
        inner.validate_subscribe_pattern(pattern)?;

        let handler: Handler<T> =
            Arc::new(move |message| Box::pin(handler(message)) as BoxedHandlerFuture);
        let id = inner.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let name = options
            .name
            .unwrap_or_else(|| format!("subscription-{id}"));
        let wildcard = pattern::is_wildcard(pattern);
        let system = inner.is_system(pattern);

        let capacity = options.buffer_capacity.or(if system {
            Some(inner.options.system_channel_buffer_capacity)
        } else {
            inner.options.default_buffer_capacity
        });
        let strategy = options
            .slow_consumer_strategy
            .unwrap_or(inner.options.default_slow_consumer_strategy);
        let conflation_interval = options
            .conflation_interval
            .unwrap_or(inner.options.default_conflation_interval);
        let stats = Arc::new(StatsTracker::new(
            options.stats.unwrap_or_default(),
            inner.clock.steady_ns(),
        ));

        // Resolve the literal channel before spawning the worker so a
        // type conflict cannot leave a parked task behind.
        let literal = if wildcard {
            None
        } else {
            Some(inner.get_or_create_channel::<T>(pattern, !system)?)
        };

        let core = SubscriptionCore::spawn(SubscriptionConfig {
            id,
            name: name.clone(),
            pattern: pattern.to_string(),
            wildcard,
            body_type: std::any::type_name::<T>(),
            capacity,
            strategy,
            conflation_interval,
            handler,
            handler_timeout: options.handler_timeout,
            on_timeout: options.on_timeout,
            clock: Arc::clone(&inner.clock),
            stats,
        });

        let mut prelude: Vec<Message<T>> = Vec::new();
        match &literal {
            None => {
                // Registry first, then the scan of pre-existing channels,
                // so the unattached window stays as small as documented.
                inner.wildcards.write().push(WildcardEntry {
                    subscription_id: id,
                    pattern: pattern.to_string(),
                    type_id: TypeId::of::<T>(),
                    target: core.clone(),
                });
                if options.fetch_state {
                    for entry in inner.channels.iter() {
                        if inner.is_system(entry.key())
                            || entry.value().type_id != TypeId::of::<T>()
                            || !pattern::matches(pattern, entry.key())
                        {
                            continue;
                        }
                        let channel = entry
                            .value()
                            .any
                            .clone()
                            .downcast::<Channel<T>>()
                            .expect("registry type invariant");
                        if let Some(store) = channel.existing_store() {
                            prelude.extend(store.snapshot());
                        }
                    }
                }
            }
            Some(channel) => {
                // Install before snapshotting: live envelopes accumulate
                // in the parked queue and the prelude ids de-duplicate
                // overlap.
                channel.add_subscription(core.clone());
                if options.fetch_state {
                    prelude = channel.store().snapshot();
                }
            }
        }
        core.start(prelude);

        inner.subscriptions.insert(
            id,
            SubscriptionSlot {
                control: core.clone(),
                literal_channel: (!wildcard).then(|| pattern.to_string()),
            },
        );
        inner.emit_lifecycle(
            LifecycleEventType::SubscriptionCreated,
            pattern,
            Some(&name),
            std::any::type_name::<T>(),
        );
        log::debug!("subscription '{name}' created on '{pattern}'");

        let weak = Arc::downgrade(inner);
        let disposer = Arc::new(move |subscription_id: u64| {
            if let Some(inner) = weak.upgrade() {
                inner.dispose_subscription(subscription_id);
            }
        });
        Ok(Subscription::new(core, disposer))
    }

    /// Enumerates non-system channels with their public metadata.
    pub fn channels(&self) -> Vec<ChannelInfo> {
        let inner = &self.inner;
        let now_ns = inner.clock.steady_ns();
        inner
            .channels
            .iter()
            .filter(|entry| !inner.is_system(entry.key()))
            .map(|entry| entry.value().ops.info(now_ns))
            .collect()
    }

    /// Ordered snapshot of a stateful channel's store. Empty for unknown
    /// channels and for channels that never stored anything.
    pub fn channel_state<T>(&self, channel: &str) -> Result<Vec<Message<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let inner = &self.inner;
        inner.ensure_live()?;
        let Some(slot) = inner.channels.get(channel) else {
            return Ok(Vec::new());
        };
        if slot.type_id != TypeId::of::<T>() {
            return Err(Error::type_mismatch::<T>(channel, slot.ops.body_type()));
        }
        let typed = slot
            .any
            .clone()
            .downcast::<Channel<T>>()
            .expect("registry type invariant");
        drop(slot);
        Ok(typed
            .existing_store()
            .map(|store| store.snapshot())
            .unwrap_or_default())
    }

    /// Deletes one stored key. False when the channel, store or key does
    /// not exist.
    pub fn try_delete_message(&self, channel: &str, key: &str) -> Result<bool> {
        self.inner.ensure_live()?;
        let Some(slot) = self.inner.channels.get(channel) else {
            return Ok(false);
        };
        Ok(slot.ops.delete_stored(key))
    }

    /// Clears a channel's store, returning how many keys were dropped.
    pub fn reset_channel(&self, channel: &str) -> Result<usize> {
        self.inner.ensure_live()?;
        let Some(slot) = self.inner.channels.get(channel) else {
            return Ok(0);
        };
        Ok(slot.ops.reset_store())
    }

    /// Removes a channel from the registry. Attached subscriptions stop
    /// receiving from it; a later publish recreates it from scratch.
    pub fn try_delete_channel(&self, channel: &str) -> bool {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::Acquire) || inner.is_system(channel) {
            return false;
        }
        let Some((name, slot)) = inner.channels.remove(channel) else {
            return false;
        };
        inner.user_channel_count.fetch_sub(1, Ordering::AcqRel);
        inner.emit_lifecycle(
            LifecycleEventType::ChannelDeleted,
            &name,
            None,
            slot.ops.body_type(),
        );
        log::debug!("channel '{name}' deleted");
        true
    }

    /// Disposes every subscription and clears the registry. Idempotent;
    /// any further operation surfaces a disposed error.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let ids: Vec<u64> = inner.subscriptions.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            inner.dispose_subscription(id);
        }
        inner.channels.clear();
        inner.wildcards.write().clear();
        log::debug!("crossbar disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

impl HubInner {
    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed("CrossBar"));
        }
        Ok(())
    }

    fn is_system(&self, name: &str) -> bool {
        name.starts_with(&self.options.system_channel_prefix)
    }

    fn validate_user_channel_name(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::InvalidChannelName(
                "empty or whitespace name".to_string(),
            ));
        }
        if name.len() > self.options.max_channel_name_length {
            return Err(Error::InvalidChannelName(format!(
                "'{name}' exceeds {} characters",
                self.options.max_channel_name_length
            )));
        }
        if self.is_system(name) {
            return Err(Error::InvalidChannelName(format!(
                "'{name}' uses the reserved system prefix '{}'",
                self.options.system_channel_prefix
            )));
        }
        if !pattern::is_valid(name) || pattern::is_wildcard(name) {
            return Err(Error::InvalidChannelName(format!(
                "'{name}' is not a literal dot-separated name"
            )));
        }
        Ok(())
    }

    fn validate_subscribe_pattern(&self, value: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(Error::InvalidChannelName(
                "empty or whitespace pattern".to_string(),
            ));
        }
        if value.len() > self.options.max_channel_name_length {
            return Err(Error::InvalidChannelName(format!(
                "'{value}' exceeds {} characters",
                self.options.max_channel_name_length
            )));
        }
        if !pattern::is_valid(value) {
            return Err(Error::InvalidChannelName(format!(
                "'{value}' is not a valid channel pattern"
            )));
        }
        // Subscribing to a system channel is allowed, but only once the
        // hub has bound it; first-touch creation stays with the hub.
        if self.is_system(value)
            && !pattern::is_wildcard(value)
            && !self.channels.contains_key(value)
        {
            return Err(Error::InvalidChannelName(format!(
                "unknown system channel '{value}'"
            )));
        }
        Ok(())
    }

    fn get_or_create_channel<T>(&self, name: &str, counted: bool) -> Result<Arc<Channel<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        if let Some(slot) = self.channels.get(name) {
            return self.downcast_slot::<T>(name, &slot);
        }

        let mut created = false;
        let result = {
            match self.channels.entry(name.to_string()) {
                dashmap::mapref::entry::Entry::Occupied(occupied) => {
                    self.downcast_slot::<T>(name, occupied.get())
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    if counted {
                        if let Some(max) = self.options.max_channels {
                            let count = self.user_channel_count.fetch_add(1, Ordering::AcqRel);
                            if count >= max {
                                self.user_channel_count.fetch_sub(1, Ordering::AcqRel);
                                return Err(Error::FailedPublish(format!(
                                    "channel limit of {max} reached creating '{name}'"
                                )));
                            }
                        } else {
                            self.user_channel_count.fetch_add(1, Ordering::AcqRel);
                        }
                    }
                    let channel = Arc::new(Channel::<T>::new(
                        name.to_string(),
                        self.clock.steady_ns(),
                    ));
                    vacant.insert(ChannelSlot {
                        type_id: TypeId::of::<T>(),
                        any: channel.clone(),
                        ops: channel.clone(),
                    });
                    created = true;
                    Ok(channel)
                }
            }
        };
        if created {
            log::debug!(
                "channel '{name}' created for {}",
                std::any::type_name::<T>()
            );
            self.emit_lifecycle(
                LifecycleEventType::ChannelCreated,
                name,
                None,
                std::any::type_name::<T>(),
            );
        }
        result
    }

    fn downcast_slot<T>(&self, name: &str, slot: &ChannelSlot) -> Result<Arc<Channel<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        if slot.type_id != TypeId::of::<T>() {
            return Err(Error::type_mismatch::<T>(name, slot.ops.body_type()));
        }
        Ok(slot
            .any
            .clone()
            .downcast::<Channel<T>>()
            .expect("registry type invariant"))
    }

    fn publish_internal<T>(
        &self,
        channel: &str,
        body: T,
        options: PublishOptions,
        user: bool,
    ) -> Result<()>
    where
        T: Clone + Send + Sync + 'static,
    {
        let typed = self.get_or_create_channel::<T>(channel, user)?;

        let message = Message {
            id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            timestamp: self.clock.wall_ns(),
            inception: self.clock.steady_ns(),
            correlation_id: options.correlation_id,
            key: options.key,
            from: options.from,
            tag_a: options.tag_a,
            body,
        };

        if options.store {
            let key = message
                .key
                .clone()
                .ok_or_else(|| Error::FailedPublish("store without key".to_string()))?;
            // Stored once per channel, never per subscription.
            typed.store().set(key, message.clone());
        }
        typed.record_publish(message.from.clone(), message.timestamp);

        let mut rejected: Option<String> = None;
        for subscription in typed.subscribers() {
            if subscription.offer(message.clone()) == OfferOutcome::Rejected {
                rejected.get_or_insert_with(|| subscription.name().to_string());
            }
        }
        if user {
            let wildcards = self.wildcards.read();
            for entry in wildcards.iter() {
                if entry.type_id != TypeId::of::<T>()
                    || !pattern::matches(&entry.pattern, channel)
                {
                    continue;
                }
                let subscription = entry
                    .target
                    .clone()
                    .downcast::<SubscriptionCore<T>>()
                    .expect("wildcard registry type invariant");
                if subscription.offer(message.clone()) == OfferOutcome::Rejected {
                    rejected.get_or_insert_with(|| subscription.name().to_string());
                }
            }
            drop(wildcards);
        }

        if user {
            if self.options.enable_publish_logging {
                log::trace!(
                    "published id={} channel='{channel}' key={:?}",
                    message.id,
                    message.key()
                );
            }
            if self.options.enable_message_tracing {
                let trace = TraceEvent {
                    channel: channel.to_string(),
                    message_id: message.id,
                    key: message.key.clone(),
                    from: message.from.clone(),
                    timestamp: message.timestamp,
                };
                if let Err(err) = self.publish_internal(
                    &self.trace_channel,
                    trace,
                    PublishOptions::default(),
                    false,
                ) {
                    log::debug!("trace publish failed: {err}");
                }
            }
        }

        match rejected {
            Some(subscription) => Err(Error::FailedPublish(format!(
                "queue full for subscription '{subscription}' on channel '{channel}'"
            ))),
            None => Ok(()),
        }
    }

    fn emit_lifecycle(
        &self,
        event_type: LifecycleEventType,
        channel: &str,
        subscription: Option<&str>,
        body_type: &'static str,
    ) {
        if !self.options.enable_lifecycle_tracking
            || self.is_system(channel)
            || self.disposed.load(Ordering::Acquire)
        {
            return;
        }
        let event = LifecycleEvent {
            event_type,
            channel: channel.to_string(),
            subscription: subscription.map(str::to_string),
            body_type,
            timestamp: self.clock.wall_ns(),
        };
        if let Err(err) = self.publish_internal(
            &self.lifecycle_channel,
            event,
            PublishOptions::default(),
            false,
        ) {
            log::debug!("lifecycle publish failed: {err}");
        }
    }

    fn dispose_subscription(&self, id: u64) {
        let Some((_, slot)) = self.subscriptions.remove(&id) else {
            return;
        };
        match &slot.literal_channel {
            Some(channel) => {
                if let Some(entry) = self.channels.get(channel) {
                    entry.ops.remove_subscription(id);
                }
            }
            None => {
                self.wildcards
                    .write()
                    .retain(|entry| entry.subscription_id != id);
            }
        }
        slot.control.dispose_runtime();
        self.emit_lifecycle(
            LifecycleEventType::SubscriptionDisposed,
            slot.control.pattern(),
            Some(slot.control.name()),
            slot.control.body_type(),
        );
    }
}
