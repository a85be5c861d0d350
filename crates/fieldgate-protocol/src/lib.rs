//! Protocol handler contracts.
//!
//! Every protocol driver (Modbus TCP/RTU, EtherNet/IP, OPC UA, ...)
//! implements [`ProtocolHandler`]: a factory-and-validator bound to one
//! protocol family. Connecting yields a [`DeviceSession`], the live
//! transport the connection pool owns and leases out for one operation at a
//! time.
//!
//! Handlers are cache-free by contract: the gateway core owns the tag-value
//! cache, and a handler that cached reads behind the core's back would break
//! quality tracking.

mod handler;
mod registry;
mod session;

pub use handler::{DiscoveryRange, ProtocolHandler};
pub use registry::HandlerRegistry;
pub use session::{DeviceSession, TagReadOutcome, TagWriteOutcome};
