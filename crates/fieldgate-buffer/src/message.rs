//! The unit of buffered data.

use bytes::Bytes;
use std::time::SystemTime;
use uuid::Uuid;

/// Priority values run 0..=9; higher drains first.
pub const MAX_PRIORITY: u8 = 9;

/// A message held by a [`MessageBuffer`](crate::MessageBuffer).
///
/// `expires_at` is optional; when absent, the buffer's configured message
/// TTL (if any) applies, measured from `created_at`. Records reloaded from
/// disk always fall back to the buffer TTL because the on-disk record format
/// does not carry per-message expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedMessage {
    pub id: Uuid,
    pub priority: u8,
    pub created_at: SystemTime,
    pub expires_at: Option<SystemTime>,
    pub payload: Bytes,
}

impl BufferedMessage {
    pub fn new(priority: u8, payload: Bytes) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority: priority.min(MAX_PRIORITY),
            created_at: SystemTime::now(),
            expires_at: None,
            payload,
        }
    }

    pub fn with_expiry(mut self, expires_at: SystemTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}
