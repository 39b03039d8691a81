use std::sync::Arc;
use std::time::Duration;

use crate::{Error, Result};

/// Policy applied when a subscription's bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlowConsumerStrategy {
    /// Drop the new envelope and count it as skipped. Publishers never
    /// observe consumer slowness.
    #[default]
    SkipUpdates,
    /// Surface the full queue to the publisher as a failed publish.
    FailPublish,
}

/// Invoked from the dequeue loop when a handler misses its deadline.
/// Errors and panics inside the callback are contained by the loop.
pub type TimeoutCallback = Arc<dyn Fn() + Send + Sync>;

/// Hub-wide configuration. Validated by [`CrossBar::with_options`].
///
/// [`CrossBar::with_options`]: crate::CrossBar::with_options
#[derive(Clone)]
pub struct CrossBarOptions {
    /// Queue capacity applied to subscriptions that do not choose their
    /// own. `None` means unbounded.
    pub default_buffer_capacity: Option<usize>,
    pub default_slow_consumer_strategy: SlowConsumerStrategy,
    /// Conflation interval applied to subscriptions that do not choose
    /// their own. Zero disables conflation.
    pub default_conflation_interval: Duration,
    /// Upper bound on the number of non-system channels.
    pub max_channels: Option<usize>,
    pub max_channel_name_length: usize,
    /// Publish a trace event per message on the trace system channel.
    pub enable_message_tracing: bool,
    /// Publish channel/subscription lifecycle events on the lifecycle
    /// system channel.
    pub enable_lifecycle_tracking: bool,
    /// Log every publish at trace level.
    pub enable_publish_logging: bool,
    pub system_channel_prefix: String,
    pub system_channel_buffer_capacity: usize,
}

impl Default for CrossBarOptions {
    fn default() -> Self {
        Self {
            default_buffer_capacity: None,
            default_slow_consumer_strategy: SlowConsumerStrategy::SkipUpdates,
            default_conflation_interval: Duration::ZERO,
            max_channels: None,
            max_channel_name_length: 256,
            enable_message_tracing: false,
            enable_lifecycle_tracking: false,
            enable_publish_logging: false,
            system_channel_prefix: "$".to_string(),
            system_channel_buffer_capacity: 1000,
        }
    }
}

impl CrossBarOptions {
    pub fn validate(&self) -> Result<()> {
        if let Some(max) = self.max_channels {
            if max == 0 {
                return Err(Error::InvalidConfiguration("max_channels must be > 0"));
            }
        }
        if self.max_channel_name_length == 0 {
            return Err(Error::InvalidConfiguration(
                "max_channel_name_length must be > 0",
            ));
        }
        if self.system_channel_buffer_capacity == 0 {
            return Err(Error::InvalidConfiguration(
                "system_channel_buffer_capacity must be > 0",
            ));
        }
        if self.system_channel_prefix.is_empty() {
            return Err(Error::InvalidConfiguration(
                "system_channel_prefix must not be empty",
            ));
        }
        Ok(())
    }
}

/// Tuning for a subscription's latency/service-time statistics.
#[derive(Debug, Clone, Copy)]
pub struct StatsOptions {
    /// Streaming percentile to track, in (0.01, 0.99). `None` disables the
    /// estimator and keeps only EWMA + counters.
    pub percentile: Option<f64>,
    /// Smoothing factor for the deviation average the percentile step is
    /// derived from.
    pub alpha: f64,
    /// Scale applied to the deviation average to obtain the adjustment
    /// step.
    pub delta: f64,
    /// EWMA window size n; the smoothing factor is 2 / (n + 1).
    pub ewma_window_size: usize,
}

impl Default for StatsOptions {
    fn default() -> Self {
        Self {
            percentile: None,
            alpha: 0.015,
            delta: 0.01,
            ewma_window_size: 128,
        }
    }
}

impl StatsOptions {
    pub fn with_percentile(percentile: f64) -> Self {
        Self {
            percentile: Some(percentile.clamp(0.01 + f64::EPSILON, 0.99 - f64::EPSILON)),
            ..Self::default()
        }
    }
}

/// Per-subscription configuration. `None` fields fall back to the hub
/// defaults from [`CrossBarOptions`].
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Display name. Autogenerated from the subscription id when empty.
    pub name: Option<String>,
    pub buffer_capacity: Option<usize>,
    pub slow_consumer_strategy: Option<SlowConsumerStrategy>,
    pub conflation_interval: Option<Duration>,
    /// Seed the subscription with the stored state of matching channels
    /// before live messages.
    pub fetch_state: bool,
    /// Deadline for a single handler invocation. The loop abandons the
    /// wait on expiry; the handler itself keeps running.
    pub handler_timeout: Option<Duration>,
    pub on_timeout: Option<TimeoutCallback>,
    pub stats: Option<StatsOptions>,
}

impl SubscribeOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn fetch_state() -> Self {
        Self {
            fetch_state: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_validate() {
        CrossBarOptions::default().validate().expect("valid");
    }

    #[test]
    fn zero_max_channels_rejected() {
        let options = CrossBarOptions {
            max_channels: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn empty_prefix_rejected() {
        let options = CrossBarOptions {
            system_channel_prefix: String::new(),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn percentile_clamped_into_open_interval() {
        let stats = StatsOptions::with_percentile(1.0);
        assert!(stats.percentile.unwrap() < 0.99);
        let stats = StatsOptions::with_percentile(0.0);
        assert!(stats.percentile.unwrap() > 0.01);
    }
}
