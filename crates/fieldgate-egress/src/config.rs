//! Connector configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Per-connector delivery settings.
///
/// Plain data with serde derives; collaborators load it from whatever
/// format they use and hand the result over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Unique name; routing rules refer to it.
    pub name: String,
    /// Provider discriminator ("mqtt", "azure-iot", "sparkplug", ...);
    /// opaque to the pipeline.
    #[serde(rename = "type")]
    pub kind: String,
    pub endpoint: String,
    /// Per-attempt delivery timeout.
    pub timeout: Duration,
    /// Retries per delivery attempt cycle.
    pub retry_count: usize,
    /// Initial backoff delay between retries.
    pub retry_delay: Duration,
    /// Capacity of the in-memory buffer.
    pub buffer_size: usize,
    /// Samples drained per flush.
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// When set, samples survive process restarts under the pipeline's
    /// persistence root.
    pub disk_persistent: bool,
    /// Hard TTL; samples older than this are dropped undelivered.
    #[serde(default)]
    pub sample_ttl: Option<Duration>,
    /// Provider-specific settings, opaque to the pipeline.
    #[serde(default)]
    pub provider_config: HashMap<String, String>,
}

impl ConnectorConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(10),
            retry_count: 3,
            retry_delay: Duration::from_millis(500),
            buffer_size: 10_000,
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            disk_persistent: false,
            sample_ttl: None,
            provider_config: HashMap::new(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, count: usize, delay: Duration) -> Self {
        self.retry_count = count;
        self.retry_delay = delay;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn disk_persistent(mut self, enabled: bool) -> Self {
        self.disk_persistent = enabled;
        self
    }

    pub fn sample_ttl(mut self, ttl: Duration) -> Self {
        self.sample_ttl = Some(ttl);
        self
    }

    pub fn provider_setting(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.provider_config.insert(key.into(), value.into());
        self
    }
}
