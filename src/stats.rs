//! Subscription and channel statistics.
//!
//! Hot counters are plain atomic increments. The EWMA and percentile
//! state sits behind a short `parking_lot` critical section taken once
//! per processed message and once per observation.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::StatsOptions;

/// Point-in-time statistics for a subscription.
///
/// Interval rates cover the window since the previous `reset = true`
/// observation; totals are monotonic for the subscription's lifetime and
/// satisfy `total_enqueued >= total_dequeued >= total_processed`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    /// Window length the rates were computed over, in seconds.
    pub interval_secs: f64,
    pub enqueue_rate: f64,
    pub dequeue_rate: f64,
    pub process_rate: f64,
    /// Enqueue attempts, including envelopes dropped by a full queue.
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_processed: u64,
    /// Envelopes dropped at the enqueue boundary (full queue under
    /// SkipUpdates, or a detached subscription).
    pub total_skipped: u64,
    pub total_timeouts: u64,
    pub queue_length: u64,
    /// EWMA of enqueue-to-dequeue latency, nanoseconds.
    pub avg_latency_ns: f64,
    pub latency_percentile_ns: Option<f64>,
    /// EWMA of handler service time, nanoseconds.
    pub avg_service_time_ns: f64,
    pub service_time_percentile_ns: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    fn new(window_size: usize) -> Self {
        Self {
            alpha: 2.0 / (window_size.max(1) as f64 + 1.0),
            value: None,
        }
    }

    fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(value) => value + self.alpha * (sample - value),
        };
        self.value = Some(next);
        next
    }

    fn value(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }

    fn reset(&mut self) {
        self.value = None;
    }
}

/// Step-adjusted streaming percentile estimator.
///
/// The adjustment step adapts to the sample's deviation from the running
/// EWMA, smoothed by `alpha` and scaled by `delta`. Tracked percentiles
/// are bounded to the open interval (0.01, 0.99).
#[derive(Debug, Clone, Copy)]
struct MovingPercentile {
    percentile: f64,
    alpha: f64,
    delta: f64,
    estimate: Option<f64>,
    step: f64,
}

impl MovingPercentile {
    fn new(percentile: f64, alpha: f64, delta: f64) -> Self {
        Self {
            percentile: percentile.clamp(0.01 + f64::EPSILON, 0.99 - f64::EPSILON),
            alpha,
            delta,
            estimate: None,
            step: 0.0,
        }
    }

    fn update(&mut self, sample: f64, ewma: f64) {
        let deviation = (sample - ewma).abs();
        self.step += self.alpha * (deviation * self.delta - self.step);
        let Some(estimate) = self.estimate else {
            self.estimate = Some(sample);
            return;
        };
        let next = if sample > estimate {
            estimate + self.step * self.percentile
        } else {
            estimate - self.step * (1.0 - self.percentile)
        };
        self.estimate = Some(next);
    }

    fn value(&self) -> Option<f64> {
        self.estimate
    }

    fn reset(&mut self) {
        self.estimate = None;
        self.step = 0.0;
    }
}

struct Window {
    last_observed_ns: i64,
    base_enqueued: u64,
    base_dequeued: u64,
    base_processed: u64,
    latency: Ewma,
    service: Ewma,
    latency_percentile: Option<MovingPercentile>,
    service_percentile: Option<MovingPercentile>,
}

/// Per-subscription latency/service statistics plus lifetime counters.
pub struct StatsTracker {
    total_enqueued: AtomicU64,
    total_dequeued: AtomicU64,
    total_processed: AtomicU64,
    total_skipped: AtomicU64,
    total_timeouts: AtomicU64,
    window: Mutex<Window>,
}

impl StatsTracker {
    pub(crate) fn new(options: StatsOptions, now_ns: i64) -> Self {
        let percentile = options
            .percentile
            .map(|p| MovingPercentile::new(p, options.alpha, options.delta));
        Self {
            total_enqueued: AtomicU64::new(0),
            total_dequeued: AtomicU64::new(0),
            total_processed: AtomicU64::new(0),
            total_skipped: AtomicU64::new(0),
            total_timeouts: AtomicU64::new(0),
            window: Mutex::new(Window {
                last_observed_ns: now_ns,
                base_enqueued: 0,
                base_dequeued: 0,
                base_processed: 0,
                latency: Ewma::new(options.ewma_window_size),
                service: Ewma::new(options.ewma_window_size),
                latency_percentile: percentile,
                service_percentile: percentile,
            }),
        }
    }

    pub(crate) fn record_enqueue_attempt(&self) {
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skip(&self) {
        self.total_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dequeue(&self, latency_ns: i64) {
        self.total_dequeued.fetch_add(1, Ordering::Relaxed);
        let sample = latency_ns.max(0) as f64;
        let mut window = self.window.lock();
        let ewma = window.latency.update(sample);
        if let Some(percentile) = window.latency_percentile.as_mut() {
            percentile.update(sample, ewma);
        }
    }

    pub(crate) fn record_processed(&self, service_ns: i64) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        let sample = service_ns.max(0) as f64;
        let mut window = self.window.lock();
        let ewma = window.service.update(sample);
        if let Some(percentile) = window.service_percentile.as_mut() {
            percentile.update(sample, ewma);
        }
    }

    pub(crate) fn record_timeout(&self) {
        self.total_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads the current window. With `reset` the interval base and the
    /// EWMA/percentile state re-arm for the next window; totals are never
    /// reset.
    pub(crate) fn observe(&self, reset: bool, now_ns: i64, queue_length: u64) -> Stats {
        let total_enqueued = self.total_enqueued.load(Ordering::Relaxed);
        let total_dequeued = self.total_dequeued.load(Ordering::Relaxed);
        let total_processed = self.total_processed.load(Ordering::Relaxed);

        let mut window = self.window.lock();
        let interval_ns = now_ns.saturating_sub(window.last_observed_ns);
        let interval_secs = interval_ns.max(0) as f64 / 1e9;
        let rate = |delta: u64| {
            if interval_secs > 0.0 {
                delta as f64 / interval_secs
            } else {
                0.0
            }
        };

        let stats = Stats {
            interval_secs,
            enqueue_rate: rate(total_enqueued - window.base_enqueued),
            dequeue_rate: rate(total_dequeued - window.base_dequeued),
            process_rate: rate(total_processed - window.base_processed),
            total_enqueued,
            total_dequeued,
            total_processed,
            total_skipped: self.total_skipped.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
            queue_length,
            avg_latency_ns: window.latency.value(),
            latency_percentile_ns: window.latency_percentile.as_ref().and_then(|p| p.value()),
            avg_service_time_ns: window.service.value(),
            service_time_percentile_ns: window.service_percentile.as_ref().and_then(|p| p.value()),
        };

        if reset {
            window.last_observed_ns = now_ns;
            window.base_enqueued = total_enqueued;
            window.base_dequeued = total_dequeued;
            window.base_processed = total_processed;
            window.latency.reset();
            window.service.reset();
            if let Some(percentile) = window.latency_percentile.as_mut() {
                percentile.reset();
            }
            if let Some(percentile) = window.service_percentile.as_mut() {
                percentile.reset();
            }
        }
        stats
    }
}

/// Publish counter for a channel: lifetime total plus a rate over the
/// window since the previous observation.
pub(crate) struct RateCounter {
    total: AtomicU64,
    window: Mutex<(u64, i64)>,
}

impl RateCounter {
    pub(crate) fn new(now_ns: i64) -> Self {
        Self {
            total: AtomicU64::new(0),
            window: Mutex::new((0, now_ns)),
        }
    }

    pub(crate) fn increment(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub(crate) fn rate(&self, now_ns: i64) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        let mut window = self.window.lock();
        let (base, since_ns) = *window;
        let elapsed = now_ns.saturating_sub(since_ns).max(0) as f64 / 1e9;
        *window = (total, now_ns);
        if elapsed > 0.0 {
            (total - base) as f64 / elapsed
        } else {
            0.0
        }
    }
}
