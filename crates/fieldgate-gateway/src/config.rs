//! Gateway-core configuration.

use std::time::Duration;

/// Tunables for the gateway core (cache, subscriptions, routing).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// GOOD values unrefreshed past this become STALE.
    pub(crate) tag_ttl: Duration,
    /// Window over which per-tag read errors are counted.
    pub(crate) error_window: Duration,
    /// Errors within the window beyond this flip a tag to BAD.
    pub(crate) error_threshold: usize,
    /// Deadline applied to requests whose context carries none.
    pub(crate) default_deadline: Duration,
    /// Per-subscriber queue depth; the oldest update drops when full.
    pub(crate) subscription_buffer: usize,
    /// How often the staleness sweeper runs.
    pub(crate) stale_sweep_interval: Duration,
}

impl GatewayConfig {
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::new()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`GatewayConfig`].
pub struct GatewayConfigBuilder {
    tag_ttl: Duration,
    error_window: Duration,
    error_threshold: usize,
    default_deadline: Duration,
    subscription_buffer: usize,
    stale_sweep_interval: Duration,
}

impl Default for GatewayConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayConfigBuilder {
    /// Defaults: 30s tag TTL, 60s error window with a threshold of 5, 10s
    /// default deadline, 256-deep subscriber queues, 5s staleness sweep.
    pub fn new() -> Self {
        Self {
            tag_ttl: Duration::from_secs(30),
            error_window: Duration::from_secs(60),
            error_threshold: 5,
            default_deadline: Duration::from_secs(10),
            subscription_buffer: 256,
            stale_sweep_interval: Duration::from_secs(5),
        }
    }

    pub fn tag_ttl(mut self, ttl: Duration) -> Self {
        self.tag_ttl = ttl;
        self
    }

    pub fn error_window(mut self, window: Duration, threshold: usize) -> Self {
        self.error_window = window;
        self.error_threshold = threshold;
        self
    }

    pub fn default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = deadline;
        self
    }

    pub fn subscription_buffer(mut self, depth: usize) -> Self {
        self.subscription_buffer = depth.max(1);
        self
    }

    pub fn stale_sweep_interval(mut self, interval: Duration) -> Self {
        self.stale_sweep_interval = interval;
        self
    }

    pub fn build(self) -> GatewayConfig {
        GatewayConfig {
            tag_ttl: self.tag_ttl,
            error_window: self.error_window,
            error_threshold: self.error_threshold,
            default_deadline: self.default_deadline,
            subscription_buffer: self.subscription_buffer,
            stale_sweep_interval: self.stale_sweep_interval,
        }
    }
}
