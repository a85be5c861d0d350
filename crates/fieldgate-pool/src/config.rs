//! Pool configuration.

use crate::events::PoolEvent;
use fieldgate_core::events::{EventListeners, FnListener};
use std::time::Duration;

/// Configuration for a [`ConnectionPool`](crate::ConnectionPool).
pub struct PoolConfig {
    pub(crate) max_per_device: usize,
    pub(crate) max_total: usize,
    pub(crate) connect_timeout: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) health_check_interval: Duration,
    pub(crate) breaker_max_failures: u32,
    pub(crate) breaker_reset_timeout: Duration,
    pub(crate) listeners: EventListeners<PoolEvent>,
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`PoolConfig`].
pub struct PoolConfigBuilder {
    max_per_device: usize,
    max_total: usize,
    connect_timeout: Duration,
    idle_timeout: Duration,
    health_check_interval: Duration,
    breaker_max_failures: u32,
    breaker_reset_timeout: Duration,
    listeners: EventListeners<PoolEvent>,
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolConfigBuilder {
    /// Defaults: 4 connections per device, 64 total, 5s connect timeout,
    /// 60s idle timeout, health checks every 10s, breaker opens after 5
    /// consecutive failures with a 30s reset.
    pub fn new() -> Self {
        Self {
            max_per_device: 4,
            max_total: 64,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(10),
            breaker_max_failures: 5,
            breaker_reset_timeout: Duration::from_secs(30),
            listeners: EventListeners::new(),
        }
    }

    pub fn max_per_device(mut self, max: usize) -> Self {
        self.max_per_device = max.max(1);
        self
    }

    pub fn max_total(mut self, max: usize) -> Self {
        self.max_total = max.max(1);
        self
    }

    /// Bound on waiting for a lease slot and on opening a new transport.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Idle connections older than this close on the next health tick.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Parameters of each device's circuit breaker.
    pub fn breaker(mut self, max_failures: u32, reset_timeout: Duration) -> Self {
        self.breaker_max_failures = max_failures.max(1);
        self.breaker_reset_timeout = reset_timeout;
        self
    }

    /// Callback invoked when an acquisition times out.
    pub fn on_exhausted<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.listeners.add(FnListener::new(move |event| {
            if let PoolEvent::Exhausted { device, .. } = event {
                f(device);
            }
        }));
        self
    }

    pub fn build(self) -> PoolConfig {
        PoolConfig {
            max_per_device: self.max_per_device,
            max_total: self.max_total,
            connect_timeout: self.connect_timeout,
            idle_timeout: self.idle_timeout,
            health_check_interval: self.health_check_interval,
            breaker_max_failures: self.breaker_max_failures,
            breaker_reset_timeout: self.breaker_reset_timeout,
            listeners: self.listeners,
        }
    }
}
