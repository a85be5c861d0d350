//! Explicit handler registration.

use crate::handler::ProtocolHandler;
use fieldgate_core::{GatewayError, Protocol};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps protocols to their registered drivers.
///
/// Assembled once at startup and then read-only; there is no runtime-typed
/// dispatch anywhere in the core.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<Protocol, Arc<dyn ProtocolHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for its protocol. A second registration for the
    /// same protocol replaces the first.
    pub fn register(&mut self, handler: Arc<dyn ProtocolHandler>) {
        let protocol = handler.protocol();
        if self.handlers.insert(protocol, handler).is_some() {
            tracing::warn!(%protocol, "protocol handler replaced");
        }
    }

    /// Looks up the handler for a protocol.
    pub fn get(&self, protocol: Protocol) -> Result<Arc<dyn ProtocolHandler>, GatewayError> {
        self.handlers.get(&protocol).cloned().ok_or_else(|| {
            GatewayError::UnsupportedConfig(format!("no handler registered for {protocol}"))
        })
    }

    pub fn protocols(&self) -> impl Iterator<Item = Protocol> + '_ {
        self.handlers.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::DiscoveryRange;
    use crate::session::DeviceSession;
    use async_trait::async_trait;
    use fieldgate_core::{DataType, Device};

    struct NullHandler(Protocol);

    #[async_trait]
    impl ProtocolHandler for NullHandler {
        fn protocol(&self) -> Protocol {
            self.0
        }

        async fn connect(
            &self,
            device: &Device,
        ) -> Result<Box<dyn DeviceSession>, GatewayError> {
            Err(GatewayError::Unreachable(device.endpoint.to_string()))
        }

        fn validate_address(&self, _address: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        fn batch_class(&self, _address: &str) -> u64 {
            0
        }

        fn supported_data_types(&self) -> &[DataType] {
            &[DataType::UInt16]
        }

        async fn discover(
            &self,
            _range: &DiscoveryRange,
        ) -> Result<Vec<Device>, GatewayError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn lookup_finds_registered_handlers() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(NullHandler(Protocol::ModbusTcp)));

        assert!(registry.get(Protocol::ModbusTcp).is_ok());
        assert!(matches!(
            registry.get(Protocol::OpcUa),
            Err(GatewayError::UnsupportedConfig(_))
        ));
    }
}
