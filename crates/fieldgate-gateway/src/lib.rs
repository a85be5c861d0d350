//! The fieldgate gateway core.
//!
//! Ties the runtime together: a device/tag registry, the tag-value cache
//! with its quality state machine, subscription fan-out, per-device polling,
//! and the request router that feeds the batch scheduler. Start assembles
//! the component registry (pool, scheduler, housekeeping); shutdown tears it
//! down in reverse dependency order with a deadline.
//!
//! # Example
//!
//! ```no_run
//! use fieldgate_gateway::{Gateway, SubscriptionFilter};
//! use fieldgate_core::{DataType, Device, Endpoint, OpContext, Protocol, Tag};
//! use std::time::Duration;
//! # use std::sync::Arc;
//!
//! # async fn example(modbus: Arc<dyn fieldgate_protocol::ProtocolHandler>) {
//! let gateway = Gateway::builder().handler(modbus).start();
//!
//! let device = Device::new(
//!     "plc-1",
//!     Protocol::ModbusTcp,
//!     Endpoint::Tcp { host: "10.0.0.9".into(), port: 502 },
//! );
//! gateway.register_device(device).unwrap();
//! gateway
//!     .add_tag("plc-1", Tag::new("temp", "HR:100", DataType::UInt16))
//!     .unwrap();
//!
//! let ctx = OpContext::background().with_timeout(Duration::from_secs(2));
//! let values = gateway.read_tags(&ctx, "plc-1", &["temp".into()]).await.unwrap();
//! println!("{:?}", values["temp"]);
//! gateway.shutdown(Duration::from_secs(5)).await;
//! # }
//! ```

mod cache;
mod config;
mod gateway;
mod subscription;

pub use cache::TagCache;
pub use config::{GatewayConfig, GatewayConfigBuilder};
pub use gateway::{Gateway, GatewayBuilder};
pub use subscription::{Subscription, SubscriptionFilter, SubscriptionHub, TagUpdate};
