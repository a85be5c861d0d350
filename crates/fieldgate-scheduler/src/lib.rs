//! Adaptive batch scheduling for the fieldgate gateway.
//!
//! The scheduler coalesces compatible tag operations per device into
//! batches, dispatches them through pooled leases inside the per-device
//! resilience manager, and adapts the batch size to observed latency and
//! success rate.
//!
//! Batch keys are `(device, op, data type, adjacency class)`; the adjacency
//! class is an opaque token produced by the protocol handler, so what "fits
//! in one wire transaction" stays the handler's business. Writes to the same
//! address never merge into one batch, and a tag with a write in flight
//! admits no concurrent read or second write.
//!
//! Every submitted request resolves its completion receiver exactly once:
//! with a value, a typed error, `Timeout` at its deadline, `Cancelled`, or
//! `Shutdown`. Nothing is dropped silently.

mod adaptive;
mod config;
mod events;
mod request;
mod scheduler;

pub use adaptive::{AdaptiveConfig, AdaptiveController};
pub use config::{SchedulerConfig, SchedulerConfigBuilder};
pub use events::SchedulerEvent;
pub use request::{BatchOp, BatchRequest, BatchResult, CompletionReceiver, OpKind};
pub use scheduler::BatchScheduler;
