//! Events emitted by the connection pool.

use fieldgate_core::events::GatewayEvent;
use std::time::Instant;

#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A new transport was opened for a device.
    ConnectionOpened { device: String, timestamp: Instant },
    /// A transport was closed.
    ConnectionClosed {
        device: String,
        timestamp: Instant,
        reason: &'static str,
    },
    /// An acquisition timed out waiting for a lease slot.
    Exhausted { device: String, timestamp: Instant },
    /// A health probe failed on an idle connection.
    ProbeFailed { device: String, timestamp: Instant },
    /// An idle connection outlived the idle timeout and was evicted.
    IdleEvicted { device: String, timestamp: Instant },
}

impl GatewayEvent for PoolEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PoolEvent::ConnectionOpened { .. } => "connection_opened",
            PoolEvent::ConnectionClosed { .. } => "connection_closed",
            PoolEvent::Exhausted { .. } => "exhausted",
            PoolEvent::ProbeFailed { .. } => "probe_failed",
            PoolEvent::IdleEvicted { .. } => "idle_evicted",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            PoolEvent::ConnectionOpened { timestamp, .. }
            | PoolEvent::ConnectionClosed { timestamp, .. }
            | PoolEvent::Exhausted { timestamp, .. }
            | PoolEvent::ProbeFailed { timestamp, .. }
            | PoolEvent::IdleEvicted { timestamp, .. } => *timestamp,
        }
    }

    fn component(&self) -> &str {
        match self {
            PoolEvent::ConnectionOpened { device, .. }
            | PoolEvent::ConnectionClosed { device, .. }
            | PoolEvent::Exhausted { device, .. }
            | PoolEvent::ProbeFailed { device, .. }
            | PoolEvent::IdleEvicted { device, .. } => device,
        }
    }
}
