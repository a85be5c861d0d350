//! Events emitted by the batch scheduler.

use fieldgate_core::events::GatewayEvent;
use std::time::Instant;

#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A batch left for the handler.
    BatchDispatched {
        device: String,
        timestamp: Instant,
        size: usize,
    },
    /// The adaptive controller changed a device's batch size.
    BatchSizeAdjusted {
        device: String,
        timestamp: Instant,
        old: usize,
        new: usize,
    },
    /// A queued request ran past its deadline and was completed with
    /// `Timeout`.
    RequestExpired { device: String, timestamp: Instant },
    /// A queued request was cancelled before dispatch.
    RequestCancelled { device: String, timestamp: Instant },
}

impl GatewayEvent for SchedulerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SchedulerEvent::BatchDispatched { .. } => "batch_dispatched",
            SchedulerEvent::BatchSizeAdjusted { .. } => "batch_size_adjusted",
            SchedulerEvent::RequestExpired { .. } => "request_expired",
            SchedulerEvent::RequestCancelled { .. } => "request_cancelled",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            SchedulerEvent::BatchDispatched { timestamp, .. }
            | SchedulerEvent::BatchSizeAdjusted { timestamp, .. }
            | SchedulerEvent::RequestExpired { timestamp, .. }
            | SchedulerEvent::RequestCancelled { timestamp, .. } => *timestamp,
        }
    }

    fn component(&self) -> &str {
        match self {
            SchedulerEvent::BatchDispatched { device, .. }
            | SchedulerEvent::BatchSizeAdjusted { device, .. }
            | SchedulerEvent::RequestExpired { device, .. }
            | SchedulerEvent::RequestCancelled { device, .. } => device,
        }
    }
}
