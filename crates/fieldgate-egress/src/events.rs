//! Events emitted by the egress pipeline.

use fieldgate_core::events::GatewayEvent;
use std::time::Instant;

#[derive(Debug, Clone)]
pub enum EgressEvent {
    /// A batch reached its connector.
    BatchDelivered {
        connector: String,
        timestamp: Instant,
        count: usize,
    },
    /// A delivery cycle failed after retries; samples stay buffered.
    DeliveryFailed { connector: String, timestamp: Instant },
    /// Samples ran out their TTL and were dropped undelivered.
    SamplesExpired {
        connector: String,
        timestamp: Instant,
        count: usize,
    },
}

impl GatewayEvent for EgressEvent {
    fn event_type(&self) -> &'static str {
        match self {
            EgressEvent::BatchDelivered { .. } => "batch_delivered",
            EgressEvent::DeliveryFailed { .. } => "delivery_failed",
            EgressEvent::SamplesExpired { .. } => "samples_expired",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            EgressEvent::BatchDelivered { timestamp, .. }
            | EgressEvent::DeliveryFailed { timestamp, .. }
            | EgressEvent::SamplesExpired { timestamp, .. } => *timestamp,
        }
    }

    fn component(&self) -> &str {
        match self {
            EgressEvent::BatchDelivered { connector, .. }
            | EgressEvent::DeliveryFailed { connector, .. }
            | EgressEvent::SamplesExpired { connector, .. } => connector,
        }
    }
}
