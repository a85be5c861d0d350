//! The live transport bound to one device.

use async_trait::async_trait;
use fieldgate_core::{GatewayError, Tag, TagId, Value};
use std::collections::HashMap;

/// Per-tag result of a multi-read. Embedded errors never fail peer tags.
pub type TagReadOutcome = HashMap<TagId, Result<Value, GatewayError>>;

/// Per-tag result of a multi-write.
pub type TagWriteOutcome = HashMap<TagId, Result<(), GatewayError>>;

/// A connected session speaking one protocol to one device.
///
/// Sessions are owned exclusively by the connection pool; the pool hands a
/// mutable borrow to exactly one operation at a time, so implementations
/// need no internal locking for request/response pairing.
#[async_trait]
pub trait DeviceSession: Send {
    /// Reads one tag.
    async fn read_tag(&mut self, tag: &Tag) -> Result<Value, GatewayError>;

    /// Writes one tag. The value's type has already been checked against
    /// the tag's declared data type by the gateway core.
    async fn write_tag(&mut self, tag: &Tag, value: &Value) -> Result<(), GatewayError>;

    /// Reads many tags in as few wire transactions as the protocol allows.
    ///
    /// This is the batching entry point: handlers exploit wire-level
    /// multi-read (Modbus multi-register reads, OPC UA bulk reads, ...)
    /// where the protocol supports it. A per-tag failure is embedded in the
    /// result map; the call as a whole fails only when the transport is
    /// lost.
    async fn read_multiple(&mut self, tags: &[Tag]) -> Result<TagReadOutcome, GatewayError> {
        let mut out = TagReadOutcome::with_capacity(tags.len());
        for tag in tags {
            let result = self.read_tag(tag).await;
            if let Err(err) = &result {
                if err.is_retryable() {
                    // Transport is gone; the whole call fails.
                    return Err(err.clone());
                }
            }
            out.insert(tag.id.clone(), result);
        }
        Ok(out)
    }

    /// Writes many tags, in the order given. Callers guarantee no two
    /// entries target the same address.
    async fn write_multiple(
        &mut self,
        writes: &[(Tag, Value)],
    ) -> Result<TagWriteOutcome, GatewayError> {
        let mut out = TagWriteOutcome::with_capacity(writes.len());
        for (tag, value) in writes {
            let result = self.write_tag(tag, value).await;
            if let Err(err) = &result {
                if err.is_retryable() {
                    return Err(err.clone());
                }
            }
            out.insert(tag.id.clone(), result);
        }
        Ok(out)
    }

    /// Cheap liveness probe.
    async fn ping(&mut self) -> Result<(), GatewayError>;

    /// Closes the session. Idempotent: disconnecting twice equals
    /// disconnecting once.
    async fn disconnect(&mut self) -> Result<(), GatewayError>;

    fn is_connected(&self) -> bool;
}
