//! Buffer configuration.

use crate::events::BufferEvent;
use fieldgate_core::events::{EventListeners, FnListener};
use std::path::PathBuf;
use std::time::Duration;

/// What `add` does when the in-memory buffer is at `max_size` and no disk
/// persistence is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Reject the new message with `BufferFull`.
    Reject,
    /// Drop the oldest message of the lowest occupied priority band, then
    /// accept the new one.
    EvictOldest,
}

/// On-disk persistence settings.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Root directory; segments live under `buffers/<name>/`.
    pub root: PathBuf,
    /// Active segment rotates once it grows past this size.
    pub max_segment_bytes: u64,
}

impl PersistenceConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_segment_bytes: 8 * 1024 * 1024,
        }
    }

    pub fn max_segment_bytes(mut self, bytes: u64) -> Self {
        self.max_segment_bytes = bytes.max(1024);
        self
    }
}

/// Configuration for a [`MessageBuffer`](crate::MessageBuffer).
pub struct BufferConfig {
    pub(crate) name: String,
    pub(crate) max_size: usize,
    pub(crate) overflow: OverflowPolicy,
    pub(crate) message_ttl: Option<Duration>,
    pub(crate) persistence: Option<PersistenceConfig>,
    pub(crate) listeners: EventListeners<BufferEvent>,
}

impl BufferConfig {
    pub fn builder(name: impl Into<String>) -> BufferConfigBuilder {
        BufferConfigBuilder::new(name)
    }
}

/// Builder for [`BufferConfig`].
pub struct BufferConfigBuilder {
    name: String,
    max_size: usize,
    overflow: OverflowPolicy,
    message_ttl: Option<Duration>,
    persistence: Option<PersistenceConfig>,
    listeners: EventListeners<BufferEvent>,
}

impl BufferConfigBuilder {
    /// Defaults: 10_000 messages, reject on overflow, no TTL, memory-only.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_size: 10_000,
            overflow: OverflowPolicy::Reject,
            message_ttl: None,
            persistence: None,
            listeners: EventListeners::new(),
        }
    }

    /// Maximum number of messages held in memory.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size.max(1);
        self
    }

    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }

    /// Messages older than this are skipped by `get` and reaped by
    /// `sweep_expired`, unless the message carries its own expiry.
    pub fn message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Enables write-ahead persistence; overflowing messages spill to disk
    /// instead of being dropped, and the buffer survives restarts.
    pub fn persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Callback invoked when a message is rejected or dropped on overflow.
    pub fn on_overflow<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.listeners.add(FnListener::new(move |event| {
            if matches!(
                event,
                BufferEvent::Rejected { .. } | BufferEvent::Dropped { .. }
            ) {
                f();
            }
        }));
        self
    }

    pub fn build(self) -> BufferConfig {
        BufferConfig {
            name: self.name,
            max_size: self.max_size,
            overflow: self.overflow,
            message_ttl: self.message_ttl,
            persistence: self.persistence,
            listeners: self.listeners,
        }
    }
}
