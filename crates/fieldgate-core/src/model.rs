//! The tag-oriented data model: devices, tags, values, and quality.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

/// Identifies a device across the gateway. Unique per runtime registry.
pub type DeviceId = String;

/// Identifies a tag within its device.
pub type TagId = String;

/// The protocol family a device speaks.
///
/// Registration of a matching [`ProtocolHandler`] is explicit at startup;
/// there is no runtime-typed dispatch.
///
/// [`ProtocolHandler`]: https://docs.rs/fieldgate-protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    ModbusTcp,
    ModbusRtu,
    EthernetIp,
    OpcUa,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::ModbusTcp => "modbus-tcp",
            Protocol::ModbusRtu => "modbus-rtu",
            Protocol::EthernetIp => "ethernet-ip",
            Protocol::OpcUa => "opc-ua",
        };
        f.write_str(name)
    }
}

/// Where a device lives: a network socket or a serial line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    Tcp {
        host: String,
        port: u16,
    },
    Serial {
        path: String,
        baud_rate: u32,
    },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Serial { path, baud_rate } => write!(f, "{path}@{baud_rate}"),
        }
    }
}

/// A registered field device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub protocol: Protocol,
    pub endpoint: Endpoint,
    /// Protocol-specific settings the handler interprets (unit id, rack/slot,
    /// security policy, ...). Opaque to the core.
    #[serde(default)]
    pub config: HashMap<String, String>,
    /// When set, the gateway polls subscribed tags at this interval.
    #[serde(default)]
    pub update_interval: Option<Duration>,
}

impl Device {
    pub fn new(id: impl Into<DeviceId>, protocol: Protocol, endpoint: Endpoint) -> Self {
        Self {
            id: id.into(),
            protocol,
            endpoint,
            config: HashMap::new(),
            update_interval: None,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = Some(interval);
        self
    }
}

/// The declared type of a tag's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int16,
    Int32,
    Int64,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    String,
    Bytes,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Bool => "bool",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::UInt16 => "uint16",
            DataType::UInt32 => "uint32",
            DataType::UInt64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::String => "string",
            DataType::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// A typed sample value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Bytes),
}

impl Value {
    /// The data type this value inhabits.
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Bool(_) => DataType::Bool,
            Value::Int16(_) => DataType::Int16,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::UInt16(_) => DataType::UInt16,
            Value::UInt32(_) => DataType::UInt32,
            Value::UInt64(_) => DataType::UInt64,
            Value::Float32(_) => DataType::Float32,
            Value::Float64(_) => DataType::Float64,
            Value::String(_) => DataType::String,
            Value::Bytes(_) => DataType::Bytes,
        }
    }

    /// Returns `true` if this value may be written to a tag declared with
    /// `data_type`.
    pub fn matches(&self, data_type: DataType) -> bool {
        self.data_type() == data_type
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt16(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Float32(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v:?}"),
            Value::Bytes(v) => write!(f, "{} bytes", v.len()),
        }
    }
}

/// A named, addressable data point on a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    /// Protocol-specific address string; must pass the handler's
    /// address validation before the tag is admitted.
    pub address: String,
    pub data_type: DataType,
    pub writable: bool,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Optional grouping label for tags polled together; carried through
    /// registration so collaborators can scope subscriptions by group.
    #[serde(default)]
    pub poll_group: Option<String>,
}

impl Tag {
    pub fn new(id: impl Into<TagId>, address: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            data_type,
            writable: false,
            unit: None,
            description: None,
            poll_group: None,
        }
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_poll_group(mut self, poll_group: impl Into<String>) -> Self {
        self.poll_group = Some(poll_group.into());
        self
    }
}

/// Freshness/validity metadata attached to every observed sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quality {
    Good,
    Bad,
    Uncertain,
    Stale,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Quality::Good => "GOOD",
            Quality::Bad => "BAD",
            Quality::Uncertain => "UNCERTAIN",
            Quality::Stale => "STALE",
        };
        f.write_str(name)
    }
}

/// The last observed sample for a tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagValue {
    pub value: Value,
    pub quality: Quality,
    pub timestamp: SystemTime,
    pub read_latency: Duration,
}

impl TagValue {
    pub fn good(value: Value, read_latency: Duration) -> Self {
        Self {
            value,
            quality: Quality::Good,
            timestamp: SystemTime::now(),
            read_latency,
        }
    }
}
