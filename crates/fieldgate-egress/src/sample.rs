//! Samples bound for cloud egress.

use fieldgate_core::{GatewayError, Quality, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;
use uuid::Uuid;

/// One tag observation headed for one or more connectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudSample {
    pub id: Uuid,
    pub device_id: String,
    pub tag_id: String,
    pub value: Value,
    pub quality: Quality,
    pub timestamp: SystemTime,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl CloudSample {
    pub fn new(
        device_id: impl Into<String>,
        tag_id: impl Into<String>,
        value: Value,
        quality: Quality,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            tag_id: tag_id.into(),
            value,
            quality,
            timestamp: SystemTime::now(),
            metadata: HashMap::new(),
            retry_count: 0,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Serializes the sample for the delivery buffer.
    pub fn to_bytes(&self) -> Result<bytes::Bytes, GatewayError> {
        serde_json::to_vec(self)
            .map(bytes::Bytes::from)
            .map_err(|e| GatewayError::UnsupportedConfig(format!("unencodable sample: {e}")))
    }

    /// Deserializes a buffered sample.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GatewayError> {
        serde_json::from_slice(bytes)
            .map_err(|e| GatewayError::Transport(format!("undecodable sample: {e}")))
    }
}
