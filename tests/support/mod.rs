//! Shared test doubles: a scriptable field device and a recording cloud
//! connector.

#![allow(dead_code)]

use async_trait::async_trait;
use fieldgate_core::{DataType, Device, Endpoint, GatewayError, Protocol, Tag, Value};
use fieldgate_egress::{CloudConnector, CloudSample};
use fieldgate_protocol::{
    DeviceSession, DiscoveryRange, ProtocolHandler, TagReadOutcome, TagWriteOutcome,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Addresses look like `HR:<n>`; reads within a 64-register block share an
/// adjacency class, so adjacent tags coalesce and distant ones do not.
const ADJACENCY_BLOCK: u64 = 64;

#[derive(Default)]
pub struct FieldDeviceState {
    pub registers: Mutex<HashMap<String, Value>>,
    pub read_batches: AtomicUsize,
    pub write_batches: AtomicUsize,
    /// Fail the next N multi-reads with a transport error.
    pub fail_reads: AtomicUsize,
    /// While set, every multi-read fails.
    pub always_fail: AtomicBool,
}

impl FieldDeviceState {
    pub fn set_register(&self, address: &str, value: Value) {
        self.registers.lock().insert(address.to_string(), value);
    }

    pub fn register(&self, address: &str) -> Option<Value> {
        self.registers.lock().get(address).cloned()
    }
}

pub struct FieldDeviceHandler {
    pub state: Arc<FieldDeviceState>,
}

impl FieldDeviceHandler {
    pub fn new() -> (Self, Arc<FieldDeviceState>) {
        let state = Arc::new(FieldDeviceState::default());
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

pub struct FieldDeviceSession {
    state: Arc<FieldDeviceState>,
    connected: bool,
}

#[async_trait]
impl DeviceSession for FieldDeviceSession {
    async fn read_tag(&mut self, tag: &Tag) -> Result<Value, GatewayError> {
        Ok(self
            .state
            .registers
            .lock()
            .get(&tag.address)
            .cloned()
            .unwrap_or(Value::UInt16(0)))
    }

    async fn write_tag(&mut self, tag: &Tag, value: &Value) -> Result<(), GatewayError> {
        self.state
            .registers
            .lock()
            .insert(tag.address.clone(), value.clone());
        Ok(())
    }

    async fn read_multiple(&mut self, tags: &[Tag]) -> Result<TagReadOutcome, GatewayError> {
        self.state.read_batches.fetch_add(1, Ordering::AcqRel);
        if self.state.always_fail.load(Ordering::Acquire) {
            return Err(GatewayError::Transport("injected failure".into()));
        }
        if self.state.fail_reads.load(Ordering::Acquire) > 0 {
            self.state.fail_reads.fetch_sub(1, Ordering::AcqRel);
            return Err(GatewayError::Transport("injected failure".into()));
        }
        let registers = self.state.registers.lock();
        Ok(tags
            .iter()
            .map(|t| {
                (
                    t.id.clone(),
                    Ok(registers.get(&t.address).cloned().unwrap_or(Value::UInt16(0))),
                )
            })
            .collect())
    }

    async fn write_multiple(
        &mut self,
        writes: &[(Tag, Value)],
    ) -> Result<TagWriteOutcome, GatewayError> {
        self.state.write_batches.fetch_add(1, Ordering::AcqRel);
        let mut registers = self.state.registers.lock();
        Ok(writes
            .iter()
            .map(|(tag, value)| {
                registers.insert(tag.address.clone(), value.clone());
                (tag.id.clone(), Ok(()))
            })
            .collect())
    }

    async fn ping(&mut self) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), GatewayError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[async_trait]
impl ProtocolHandler for FieldDeviceHandler {
    fn protocol(&self) -> Protocol {
        Protocol::ModbusTcp
    }

    async fn connect(&self, _device: &Device) -> Result<Box<dyn DeviceSession>, GatewayError> {
        Ok(Box::new(FieldDeviceSession {
            state: Arc::clone(&self.state),
            connected: true,
        }))
    }

    fn validate_address(&self, address: &str) -> Result<(), GatewayError> {
        match address.strip_prefix("HR:").map(str::parse::<u64>) {
            Some(Ok(_)) => Ok(()),
            _ => Err(GatewayError::InvalidAddress {
                address: address.to_string(),
                reason: "expected HR:<register>".into(),
            }),
        }
    }

    fn batch_class(&self, address: &str) -> u64 {
        address
            .strip_prefix("HR:")
            .and_then(|n| n.parse::<u64>().ok())
            .map(|n| n / ADJACENCY_BLOCK)
            .unwrap_or(u64::MAX)
    }

    fn supported_data_types(&self) -> &[DataType] {
        &[DataType::Bool, DataType::UInt16, DataType::Float32]
    }

    async fn discover(&self, range: &DiscoveryRange) -> Result<Vec<Device>, GatewayError> {
        Ok(vec![Device::new(
            format!("candidate@{}", range.network),
            Protocol::ModbusTcp,
            Endpoint::Tcp {
                host: range.network.clone(),
                port: range.port.unwrap_or(502),
            },
        )])
    }
}

pub fn test_device(id: &str) -> Device {
    Device::new(
        id,
        Protocol::ModbusTcp,
        Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port: 1502,
        },
    )
}

pub fn uint_tag(id: &str, address: &str) -> Tag {
    Tag::new(id, address, DataType::UInt16).writable()
}

#[derive(Default)]
pub struct RecordingConnectorState {
    pub received: Mutex<Vec<CloudSample>>,
    pub online: AtomicBool,
}

pub struct RecordingConnector {
    pub name: String,
    pub state: Arc<RecordingConnectorState>,
}

impl RecordingConnector {
    pub fn new(name: &str, online: bool) -> (Arc<Self>, Arc<RecordingConnectorState>) {
        let state = Arc::new(RecordingConnectorState::default());
        state.online.store(online, Ordering::Release);
        (
            Arc::new(Self {
                name: name.to_string(),
                state: Arc::clone(&state),
            }),
            state,
        )
    }
}

#[async_trait]
impl CloudConnector for RecordingConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), GatewayError> {
        if self.state.online.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(GatewayError::Unreachable(self.name.clone()))
        }
    }

    async fn disconnect(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.online.load(Ordering::Acquire)
    }

    async fn send_data(&self, sample: &CloudSample) -> Result<(), GatewayError> {
        if !self.state.online.load(Ordering::Acquire) {
            return Err(GatewayError::Unreachable(self.name.clone()));
        }
        self.state.received.lock().push(sample.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}
