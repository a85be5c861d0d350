//! Events emitted by the buffer.

use fieldgate_core::events::GatewayEvent;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum BufferEvent {
    /// `add` rejected a message because the buffer was full.
    Rejected { name: String, timestamp: Instant },
    /// An old message was dropped to make room (memory-only eviction).
    Dropped {
        name: String,
        timestamp: Instant,
        id: Uuid,
    },
    /// A message's payload was moved out of memory onto disk.
    Spilled {
        name: String,
        timestamp: Instant,
        id: Uuid,
    },
    /// Expired messages were reaped.
    Expired {
        name: String,
        timestamp: Instant,
        count: usize,
    },
}

impl GatewayEvent for BufferEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BufferEvent::Rejected { .. } => "rejected",
            BufferEvent::Dropped { .. } => "dropped",
            BufferEvent::Spilled { .. } => "spilled",
            BufferEvent::Expired { .. } => "expired",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            BufferEvent::Rejected { timestamp, .. }
            | BufferEvent::Dropped { timestamp, .. }
            | BufferEvent::Spilled { timestamp, .. }
            | BufferEvent::Expired { timestamp, .. } => *timestamp,
        }
    }

    fn component(&self) -> &str {
        match self {
            BufferEvent::Rejected { name, .. }
            | BufferEvent::Dropped { name, .. }
            | BufferEvent::Spilled { name, .. }
            | BufferEvent::Expired { name, .. } => name,
        }
    }
}
