//! Per-subscription runtime: queue, dequeue loop, conflation, suspension,
//! detachment, handler timeout and disposal.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use crate::clock::Clock;
use crate::config::{SlowConsumerStrategy, TimeoutCallback};
use crate::message::Message;
use crate::stats::{Stats, StatsTracker};

/// What a handler invocation returns. An `Err` is logged and swallowed by
/// the loop; it never reaches the publisher and never stops the
/// subscription.
pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub(crate) type BoxedHandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
pub(crate) type Handler<T> = Arc<dyn Fn(Message<T>) -> BoxedHandlerFuture + Send + Sync>;

/// Outcome of offering an envelope to a subscription's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OfferOutcome {
    Enqueued,
    Skipped,
    /// Bounded queue full under the FailPublish policy; the publisher
    /// observes a failed publish.
    Rejected,
}

enum QueueTx<T> {
    Bounded(mpsc::Sender<Message<T>>),
    Unbounded(mpsc::UnboundedSender<Message<T>>),
}

enum QueueRx<T> {
    Bounded(mpsc::Receiver<Message<T>>),
    Unbounded(mpsc::UnboundedReceiver<Message<T>>),
}

impl<T> QueueRx<T> {
    async fn recv(&mut self) -> Option<Message<T>> {
        match self {
            QueueRx::Bounded(rx) => rx.recv().await,
            QueueRx::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// Conflation accumulator: latest envelope per key, drained by the
/// periodic flusher which is the sole queue writer in conflation mode.
struct Accumulator<T> {
    entries: Mutex<IndexMap<Option<Arc<str>>, Message<T>>>,
}

struct StartPayload<T> {
    /// Stored envelopes delivered strictly before anything queued.
    prelude: Vec<Message<T>>,
    /// Envelope ids already covered by the prelude; a queued duplicate is
    /// dropped exactly once per id.
    delivered_ids: HashSet<u64>,
}

pub(crate) struct SubscriptionCore<T> {
    id: u64,
    name: String,
    pattern: String,
    wildcard: bool,
    body_type: &'static str,
    strategy: SlowConsumerStrategy,
    conflation_interval: Duration,
    clock: Arc<dyn Clock>,
    stats: Arc<StatsTracker>,
    queue: QueueTx<T>,
    queue_length: AtomicU64,
    accumulator: Option<Accumulator<T>>,
    detached: AtomicBool,
    suspended: watch::Sender<bool>,
    cancelled: watch::Sender<bool>,
    disposed: AtomicBool,
    start: Mutex<Option<oneshot::Sender<StartPayload<T>>>>,
}

pub(crate) struct SubscriptionConfig<T> {
    pub id: u64,
    pub name: String,
    pub pattern: String,
    pub wildcard: bool,
    pub body_type: &'static str,
    pub capacity: Option<usize>,
    pub strategy: SlowConsumerStrategy,
    pub conflation_interval: Duration,
    pub handler: Handler<T>,
    pub handler_timeout: Option<Duration>,
    pub on_timeout: Option<TimeoutCallback>,
    pub clock: Arc<dyn Clock>,
    pub stats: Arc<StatsTracker>,
}

impl<T: Clone + Send + Sync + 'static> SubscriptionCore<T> {
    /// Builds the core and spawns its worker (and, in conflation mode,
    /// the flusher). The worker parks until [`start`] hands it the
    /// fetch-state prelude.
    ///
    /// [`start`]: SubscriptionCore::start
    pub(crate) fn spawn(config: SubscriptionConfig<T>) -> Arc<Self> {
        let (queue_tx, queue_rx) = match config.capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (QueueTx::Bounded(tx), QueueRx::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (QueueTx::Unbounded(tx), QueueRx::Unbounded(rx))
            }
        };
        let (suspended, _) = watch::channel(false);
        let (cancelled, _) = watch::channel(false);
        let (start_tx, start_rx) = oneshot::channel();

        let core = Arc::new(Self {
            id: config.id,
            name: config.name,
            pattern: config.pattern,
            wildcard: config.wildcard,
            body_type: config.body_type,
            strategy: config.strategy,
            conflation_interval: config.conflation_interval,
            clock: config.clock,
            stats: config.stats,
            queue: queue_tx,
            queue_length: AtomicU64::new(0),
            accumulator: (!config.conflation_interval.is_zero()).then(|| Accumulator {
                entries: Mutex::new(IndexMap::new()),
            }),
            detached: AtomicBool::new(false),
            suspended,
            cancelled,
            disposed: AtomicBool::new(false),
            start: Mutex::new(Some(start_tx)),
        });

        tokio::spawn(Self::run_loop(
            Arc::clone(&core),
            queue_rx,
            start_rx,
            config.handler,
            config.handler_timeout,
            config.on_timeout,
        ));
        if core.accumulator.is_some() {
            tokio::spawn(Self::run_flusher(Arc::clone(&core)));
        }
        core
    }

    /// Releases the parked worker. `prelude` entries are delivered before
    /// anything already sitting in the queue; their ids double as the
    /// de-duplication set for the live tail.
    pub(crate) fn start(&self, prelude: Vec<Message<T>>) {
        for _ in &prelude {
            self.stats.record_enqueue_attempt();
        }
        let delivered_ids = prelude.iter().map(|m| m.id).collect();
        if let Some(sender) = self.start.lock().take() {
            let _ = sender.send(StartPayload {
                prelude,
                delivered_ids,
            });
        }
    }

    /// Producer-side entry point, called from publish fan-out.
    pub(crate) fn offer(&self, message: Message<T>) -> OfferOutcome {
        if self.disposed.load(Ordering::Acquire) {
            return OfferOutcome::Skipped;
        }
        if self.detached.load(Ordering::Acquire) {
            // Dropped at the boundary: only the skipped counter moves.
            self.stats.record_skip();
            return OfferOutcome::Skipped;
        }
        self.stats.record_enqueue_attempt();

        if let Some(accumulator) = &self.accumulator {
            accumulator.entries.lock().insert(message.key.clone(), message);
            return OfferOutcome::Enqueued;
        }
        self.push(message)
    }

    fn push(&self, message: Message<T>) -> OfferOutcome {
        match &self.queue {
            QueueTx::Unbounded(tx) => {
                if tx.send(message).is_ok() {
                    self.queue_length.fetch_add(1, Ordering::Relaxed);
                    OfferOutcome::Enqueued
                } else {
                    OfferOutcome::Skipped
                }
            }
            QueueTx::Bounded(tx) => match tx.try_send(message) {
                Ok(()) => {
                    self.queue_length.fetch_add(1, Ordering::Relaxed);
                    OfferOutcome::Enqueued
                }
                Err(mpsc::error::TrySendError::Full(_)) => match self.strategy {
                    SlowConsumerStrategy::SkipUpdates => {
                        self.stats.record_skip();
                        OfferOutcome::Skipped
                    }
                    SlowConsumerStrategy::FailPublish => OfferOutcome::Rejected,
                },
                Err(mpsc::error::TrySendError::Closed(_)) => OfferOutcome::Skipped,
            },
        }
    }

    async fn run_flusher(core: Arc<Self>) {
        let mut cancelled = core.cancelled.subscribe();
        let mut ticker = tokio::time::interval(core.conflation_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = watch_cancel(&mut cancelled) => return,
                _ = ticker.tick() => {}
            }
            let accumulator = core.accumulator.as_ref().expect("flusher without accumulator");
            let drained: Vec<Message<T>> = {
                let mut entries = accumulator.entries.lock();
                entries.drain(..).map(|(_, message)| message).collect()
            };
            for message in drained {
                // The flusher has no publisher to fail; a full queue under
                // either policy counts the envelope as skipped.
                if core.push(message) == OfferOutcome::Rejected {
                    core.stats.record_skip();
                }
            }
        }
    }

    async fn run_loop(
        core: Arc<Self>,
        mut queue: QueueRx<T>,
        start: oneshot::Receiver<StartPayload<T>>,
        handler: Handler<T>,
        handler_timeout: Option<Duration>,
        on_timeout: Option<TimeoutCallback>,
    ) {
        let mut cancelled = core.cancelled.subscribe();
        let mut suspended = core.suspended.subscribe();

        let payload = tokio::select! {
            payload = start => match payload {
                Ok(payload) => payload,
                Err(_) => return,
            },
            _ = watch_cancel(&mut cancelled) => return,
        };
        let StartPayload {
            prelude,
            mut delivered_ids,
        } = payload;

        for message in prelude {
            if watch_suspension(&core, &mut cancelled, &mut suspended).await {
                return;
            }
            core.deliver(message, &handler, handler_timeout, on_timeout.as_ref())
                .await;
        }

        loop {
            let message = tokio::select! {
                _ = watch_cancel(&mut cancelled) => return,
                message = queue.recv() => match message {
                    Some(message) => message,
                    None => return,
                },
            };
            core.queue_length.fetch_sub(1, Ordering::Relaxed);
            if watch_suspension(&core, &mut cancelled, &mut suspended).await {
                return;
            }
            // A queued copy of an envelope the prelude already delivered.
            if !delivered_ids.is_empty() && delivered_ids.remove(&message.id) {
                let latency = core.clock.steady_ns() - message.inception;
                core.stats.record_dequeue(latency);
                continue;
            }
            core.deliver(message, &handler, handler_timeout, on_timeout.as_ref())
                .await;
        }
    }

    async fn deliver(
        &self,
        message: Message<T>,
        handler: &Handler<T>,
        handler_timeout: Option<Duration>,
        on_timeout: Option<&TimeoutCallback>,
    ) {
        let latency = self.clock.steady_ns() - message.inception;
        self.stats.record_dequeue(latency);

        let started = self.clock.steady_ns();
        match handler_timeout {
            None => {
                if let Err(err) = handler(message).await {
                    log::warn!("subscription '{}': handler error: {err}", self.name);
                }
            }
            Some(deadline) => {
                // The handler runs on its own task so an expired wait
                // releases the loop without cancelling in-flight work.
                let task = tokio::spawn(handler(message));
                match tokio::time::timeout(deadline, task).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(err))) => {
                        log::warn!("subscription '{}': handler error: {err}", self.name);
                    }
                    Ok(Err(join_err)) => {
                        log::warn!("subscription '{}': handler panicked: {join_err}", self.name);
                    }
                    Err(_) => {
                        self.stats.record_timeout();
                        log::warn!(
                            "subscription '{}': handler exceeded {:?}",
                            self.name,
                            deadline
                        );
                        if let Some(callback) = on_timeout {
                            // A misbehaving callback must not take the
                            // loop down with it.
                            let callback = Arc::clone(callback);
                            let result = std::panic::catch_unwind(
                                std::panic::AssertUnwindSafe(move || callback()),
                            );
                            if result.is_err() {
                                log::warn!(
                                    "subscription '{}': timeout callback panicked",
                                    self.name
                                );
                            }
                        }
                        return;
                    }
                }
            }
        }
        self.stats.record_processed(self.clock.steady_ns() - started);
    }
}

async fn watch_cancel(cancelled: &mut watch::Receiver<bool>) {
    while !*cancelled.borrow() {
        if cancelled.changed().await.is_err() {
            return;
        }
    }
}

/// Parks while the subscription is suspended. Returns true when the
/// subscription was cancelled while waiting.
async fn watch_suspension<T>(
    core: &SubscriptionCore<T>,
    cancelled: &mut watch::Receiver<bool>,
    suspended: &mut watch::Receiver<bool>,
) -> bool {
    while *suspended.borrow() {
        tokio::select! {
            _ = watch_cancel(cancelled) => return true,
            changed = suspended.changed() => {
                if changed.is_err() {
                    return true;
                }
            }
        }
    }
    *cancelled.borrow()
}

/// Type-erased view of a subscription used by the hub registry and the
/// public handle.
pub(crate) trait SubscriptionControl: Send + Sync {
    fn id(&self) -> u64;
    fn name(&self) -> &str;
    fn pattern(&self) -> &str;
    fn is_wildcard(&self) -> bool;
    fn body_type(&self) -> &'static str;
    fn suspend(&self);
    fn resume(&self);
    fn is_suspended(&self) -> bool;
    fn detach(&self);
    fn attach(&self);
    fn is_detached(&self) -> bool;
    fn queue_length(&self) -> u64;
    fn stats(&self, reset: bool) -> Stats;
    fn is_disposed(&self) -> bool;
    /// Stops the worker and flusher and discards the accumulator.
    /// Idempotent; registry removal is the hub's half of disposal.
    fn dispose_runtime(&self) -> bool;
}

impl<T: Clone + Send + Sync + 'static> SubscriptionControl for SubscriptionCore<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn pattern(&self) -> &str {
        &self.pattern
    }

    fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    fn body_type(&self) -> &'static str {
        self.body_type
    }

    fn suspend(&self) {
        let _ = self.suspended.send(true);
    }

    fn resume(&self) {
        let _ = self.suspended.send(false);
    }

    fn is_suspended(&self) -> bool {
        *self.suspended.borrow()
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    fn attach(&self) {
        self.detached.store(false, Ordering::Release);
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    fn queue_length(&self) -> u64 {
        self.queue_length.load(Ordering::Relaxed)
    }

    fn stats(&self, reset: bool) -> Stats {
        self.stats
            .observe(reset, self.clock.steady_ns(), self.queue_length())
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn dispose_runtime(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.cancelled.send(true);
        self.start.lock().take();
        if let Some(accumulator) = &self.accumulator {
            accumulator.entries.lock().clear();
        }
        log::debug!("subscription '{}' disposed", self.name);
        true
    }
}

/// A consumer's attachment to one channel or wildcard pattern.
///
/// The hub keeps the subscription alive until [`dispose`] is called or the
/// hub itself is disposed; dropping this handle does not stop delivery.
///
/// [`dispose`]: Subscription::dispose
#[derive(Clone)]
pub struct Subscription {
    control: Arc<dyn SubscriptionControl>,
    disposer: Arc<dyn Fn(u64) + Send + Sync>,
}

impl Subscription {
    pub(crate) fn new(
        control: Arc<dyn SubscriptionControl>,
        disposer: Arc<dyn Fn(u64) + Send + Sync>,
    ) -> Self {
        Self { control, disposer }
    }

    pub fn id(&self) -> u64 {
        self.control.id()
    }

    pub fn name(&self) -> &str {
        self.control.name()
    }

    pub fn pattern(&self) -> &str {
        self.control.pattern()
    }

    pub fn is_wildcard(&self) -> bool {
        self.control.is_wildcard()
    }

    /// Blocks the dequeue side; the queue keeps filling and may trip the
    /// slow-consumer policy.
    pub fn suspend(&self) {
        self.control.suspend();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn is_suspended(&self) -> bool {
        self.control.is_suspended()
    }

    /// Drops all further envelopes at the enqueue boundary, as if the
    /// subscription did not exist. Orthogonal to suspension.
    pub fn detach(&self) {
        self.control.detach();
    }

    pub fn attach(&self) {
        self.control.attach();
    }

    pub fn is_detached(&self) -> bool {
        self.control.is_detached()
    }

    pub fn queue_length(&self) -> u64 {
        self.control.queue_length()
    }

    /// Reads the subscription's statistics window. With `reset` the
    /// interval counters and EWMA/percentile state re-arm; totals never
    /// reset.
    pub fn stats(&self, reset: bool) -> Stats {
        self.control.stats(reset)
    }

    pub fn is_disposed(&self) -> bool {
        self.control.is_disposed()
    }

    /// Detaches from every channel, stops the worker and discards any
    /// conflated backlog. Idempotent.
    pub fn dispose(&self) {
        (self.disposer)(self.control.id());
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.control.id())
            .field("name", &self.control.name())
            .field("pattern", &self.control.pattern())
            .field("disposed", &self.control.is_disposed())
            .finish()
    }
}
