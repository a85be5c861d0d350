//! Scheduler configuration.

use crate::adaptive::AdaptiveConfig;
use crate::events::SchedulerEvent;
use fieldgate_core::events::{EventListeners, FnListener};
use std::time::Duration;

/// Configuration for a [`BatchScheduler`](crate::BatchScheduler).
pub struct SchedulerConfig {
    pub(crate) adaptive: AdaptiveConfig,
    /// Oldest-request age that forces a flush of its group.
    pub(crate) batch_timeout: Duration,
    /// Period of the global flush tick.
    pub(crate) flush_interval: Duration,
    /// Priorities strictly above this force an early flush.
    pub(crate) high_priority_threshold: u8,
    /// Dispatch guard for requests that carry no deadline.
    pub(crate) default_op_timeout: Duration,
    /// Slack added on top of the earliest request deadline when guarding a
    /// dispatch.
    pub(crate) grace: Duration,
    pub(crate) max_retries: usize,
    pub(crate) retry_initial_delay: Duration,
    pub(crate) retry_max_delay: Duration,
    pub(crate) retry_jitter: f64,
    pub(crate) listeners: EventListeners<SchedulerEvent>,
}

impl SchedulerConfig {
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::new()
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`SchedulerConfig`].
pub struct SchedulerConfigBuilder {
    adaptive: AdaptiveConfig,
    batch_timeout: Duration,
    flush_interval: Duration,
    high_priority_threshold: u8,
    default_op_timeout: Duration,
    grace: Duration,
    max_retries: usize,
    retry_initial_delay: Duration,
    retry_max_delay: Duration,
    retry_jitter: f64,
    listeners: EventListeners<SchedulerEvent>,
}

impl Default for SchedulerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerConfigBuilder {
    /// Defaults: batches of 16 (1..=100 adaptive), 100ms batch timeout, 1s
    /// global flush, priority > 7 flushes early, 3 retries with 100ms..5s
    /// exponential backoff and 10% jitter.
    pub fn new() -> Self {
        Self {
            adaptive: AdaptiveConfig::default(),
            batch_timeout: Duration::from_millis(100),
            flush_interval: Duration::from_secs(1),
            high_priority_threshold: 7,
            default_op_timeout: Duration::from_secs(10),
            grace: Duration::from_secs(5),
            max_retries: 3,
            retry_initial_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            retry_jitter: 0.1,
            listeners: EventListeners::new(),
        }
    }

    pub fn batch_sizes(mut self, min: usize, initial: usize, max: usize) -> Self {
        self.adaptive.min_batch_size = min.max(1);
        self.adaptive.max_batch_size = max.max(min.max(1));
        self.adaptive.initial_batch_size = initial;
        self
    }

    pub fn latency_threshold(mut self, threshold: Duration) -> Self {
        self.adaptive.latency_threshold = threshold;
        self
    }

    pub fn adjustment_window(mut self, window: Duration) -> Self {
        self.adaptive.window = window;
        self
    }

    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn high_priority_threshold(mut self, threshold: u8) -> Self {
        self.high_priority_threshold = threshold.min(9);
        self
    }

    pub fn default_op_timeout(mut self, timeout: Duration) -> Self {
        self.default_op_timeout = timeout;
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn retries(mut self, max_retries: usize, initial: Duration, max: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_initial_delay = initial;
        self.retry_max_delay = max;
        self
    }

    pub fn retry_jitter(mut self, jitter: f64) -> Self {
        self.retry_jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Callback invoked when the adaptive controller resizes a device's
    /// batches.
    pub fn on_batch_size_adjusted<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, usize, usize) + Send + Sync + 'static,
    {
        self.listeners.add(FnListener::new(move |event| {
            if let SchedulerEvent::BatchSizeAdjusted {
                device, old, new, ..
            } = event
            {
                f(device, *old, *new);
            }
        }));
        self
    }

    pub fn build(self) -> SchedulerConfig {
        SchedulerConfig {
            adaptive: self.adaptive,
            batch_timeout: self.batch_timeout,
            flush_interval: self.flush_interval,
            high_priority_threshold: self.high_priority_threshold,
            default_op_timeout: self.default_op_timeout,
            grace: self.grace,
            max_retries: self.max_retries,
            retry_initial_delay: self.retry_initial_delay,
            retry_max_delay: self.retry_max_delay,
            retry_jitter: self.retry_jitter,
            listeners: self.listeners,
        }
    }
}
