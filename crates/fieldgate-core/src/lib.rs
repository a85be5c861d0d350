//! Shared primitives for the fieldgate gateway runtime.
//!
//! This crate holds the pieces every other fieldgate crate builds on:
//!
//! - [`GatewayError`]: the stable error taxonomy exposed to north-bound
//!   callers, with a retryability classification consumed by the resilience
//!   layer.
//! - [`events`]: a typed, panic-isolated event listener system. Components
//!   expose their own event enums and accept `on_*` callbacks through their
//!   config builders.
//! - [`model`]: the tag-oriented data model (devices, tags, values, quality).
//! - [`OpContext`]: the cancellation-and-deadline context threaded through
//!   every public entry point.
//! - [`health`]: health snapshot types consumed by north-bound collectors.

pub mod context;
pub mod error;
pub mod events;
pub mod health;
pub mod model;

pub use context::OpContext;
pub use error::{ErrorClass, GatewayError};
pub use events::{EventListener, EventListeners, FnListener, GatewayEvent};
pub use health::{HealthSnapshot, HealthState};
pub use model::{
    DataType, Device, DeviceId, Endpoint, Protocol, Quality, Tag, TagId, TagValue, Value,
};
