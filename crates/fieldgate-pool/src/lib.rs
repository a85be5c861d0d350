//! Per-device connection pooling for the fieldgate gateway.
//!
//! The pool owns every live transport. Callers borrow one through a
//! [`Lease`] for the duration of a single operation, then resolve the lease
//! with an outcome. Per-device circuit breakers guard transport creation and
//! are shared with the dispatch path, so connect failures and operation
//! failures feed one failure window per device.
//!
//! Guarantees:
//!
//! - Live connections per device never exceed `max_per_device`, and
//!   `max_total` overall (probing counts as a lease).
//! - Lease acquisition is FIFO per device; there is no cross-device order.
//! - No two concurrent handler invocations share a connection.

mod config;
mod events;
mod lease;
mod pool;

pub use config::{PoolConfig, PoolConfigBuilder};
pub use events::PoolEvent;
pub use lease::Lease;
pub use pool::{ConnectionPool, PoolStats};
