//! The per-protocol driver contract.

use crate::session::DeviceSession;
use async_trait::async_trait;
use fieldgate_core::{DataType, Device, GatewayError, Protocol};

/// An address range to probe for devices.
#[derive(Debug, Clone)]
pub struct DiscoveryRange {
    /// CIDR notation for network protocols, a device-path glob for serial.
    pub network: String,
    /// Port to probe; handlers fall back to the protocol's default.
    pub port: Option<u16>,
}

impl DiscoveryRange {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            port: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

/// A protocol driver: session factory, address validator, and discovery.
///
/// One handler instance serves every device of its protocol; per-device
/// state lives in the [`DeviceSession`]s it creates. Registration is
/// explicit at startup, keyed by [`Protocol`].
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// The protocol family this handler drives.
    fn protocol(&self) -> Protocol;

    /// Opens a transport to the device.
    ///
    /// Fails with `Unreachable` when the endpoint does not answer,
    /// `AuthFailed` when the device rejects credentials, and
    /// `UnsupportedConfig` when the device's protocol-specific config makes
    /// no sense to this handler.
    async fn connect(&self, device: &Device) -> Result<Box<dyn DeviceSession>, GatewayError>;

    /// Checks an address string without touching the wire. Tags are only
    /// admitted after their address passes this check.
    fn validate_address(&self, address: &str) -> Result<(), GatewayError>;

    /// The handler-private adjacency class for an address.
    ///
    /// Requests whose addresses share a class may be merged into one wire
    /// transaction; the scheduler treats the returned token as opaque.
    /// Typically a contiguous-span bucket (e.g. holding-register block of a
    /// bounded width). A handler with no multi-read advantage may hash the
    /// whole address so nothing merges.
    fn batch_class(&self, address: &str) -> u64;

    /// The data types this protocol can represent on the wire.
    fn supported_data_types(&self) -> &[DataType];

    /// Probes an address range for live devices. Candidates come back
    /// unregistered; the caller decides what to admit.
    async fn discover(&self, range: &DiscoveryRange) -> Result<Vec<Device>, GatewayError>;
}
