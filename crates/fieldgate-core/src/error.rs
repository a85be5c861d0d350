//! The stable error taxonomy shared by every fieldgate component.
//!
//! Errors are classified along two axes: *source* (transport, protocol,
//! framework) and *retryability*. The retryability axis is what the
//! resilience layer consumes: retryable failures are eligible for backoff
//! and retry, terminal failures bypass retry entirely, and cancellable
//! failures abort without counting against any breaker.

use crate::model::DataType;
use thiserror::Error;

/// Retryability classification for a [`GatewayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; eligible for retry with backoff.
    Retryable,
    /// Permanent; retrying cannot help.
    Terminal,
    /// The operation was cancelled or the process is shutting down; never
    /// retried and never counted as a breaker failure.
    Cancelled,
}

/// Error type exposed to north-bound callers and used between components.
///
/// The variant names are a stable contract: collaborators map them onto
/// their own wire formats but must not rename them.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// The device endpoint could not be reached.
    #[error("device unreachable: {0}")]
    Unreachable(String),

    /// The device rejected the session credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The operation deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled by its context.
    #[error("operation cancelled")]
    Cancelled,

    /// The tag address was rejected by the protocol handler.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The supplied value does not match the tag's declared data type.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: DataType,
        actual: DataType,
    },

    /// The tag is read-only.
    #[error("tag is not writable")]
    NotWritable,

    /// The device answered with a protocol-level exception.
    ///
    /// Handlers classify their own exception codes: a code like a Modbus
    /// "slave device busy" is transient, while "illegal data address" is
    /// permanent.
    #[error("protocol exception (code {code})")]
    ProtocolException { code: u16, retryable: bool },

    /// The transport failed mid-operation (reset, broken pipe, short read).
    #[error("transport error: {0}")]
    Transport(String),

    /// No connection could be leased within the connect timeout.
    #[error("connection pool exhausted for device {0:?}")]
    PoolExhausted(String),

    /// The circuit breaker guarding this dependency is open.
    #[error("circuit breaker open")]
    CircuitOpen,

    /// The buffer rejected the message because it is at capacity.
    #[error("buffer full")]
    BufferFull,

    /// The gateway is shutting down and no longer accepts work.
    #[error("gateway shutting down")]
    Shutdown,

    /// The device's protocol-specific configuration is not supported by the
    /// registered handler.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfig(String),
}

impl GatewayError {
    /// Classifies the error for the resilience layer.
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::Transport(_)
            | GatewayError::Timeout
            | GatewayError::Unreachable(_)
            | GatewayError::PoolExhausted(_)
            | GatewayError::BufferFull
            | GatewayError::CircuitOpen => ErrorClass::Retryable,

            GatewayError::ProtocolException { retryable, .. } => {
                if *retryable {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Terminal
                }
            }

            GatewayError::InvalidAddress { .. }
            | GatewayError::TypeMismatch { .. }
            | GatewayError::NotWritable
            | GatewayError::AuthFailed(_)
            | GatewayError::UnsupportedConfig(_) => ErrorClass::Terminal,

            GatewayError::Cancelled | GatewayError::Shutdown => ErrorClass::Cancelled,
        }
    }

    /// Returns `true` if the resilience layer may retry this error.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Returns `true` if this error ends the operation permanently.
    pub fn is_terminal(&self) -> bool {
        self.class() == ErrorClass::Terminal
    }

    /// Returns `true` for cancellation-family errors.
    pub fn is_cancellation(&self) -> bool {
        self.class() == ErrorClass::Cancelled
    }

    /// The stable name of the variant, used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unreachable(_) => "Unreachable",
            GatewayError::AuthFailed(_) => "AuthFailed",
            GatewayError::Timeout => "Timeout",
            GatewayError::Cancelled => "Cancelled",
            GatewayError::InvalidAddress { .. } => "InvalidAddress",
            GatewayError::TypeMismatch { .. } => "TypeMismatch",
            GatewayError::NotWritable => "NotWritable",
            GatewayError::ProtocolException { .. } => "ProtocolException",
            GatewayError::Transport(_) => "Transport",
            GatewayError::PoolExhausted(_) => "PoolExhausted",
            GatewayError::CircuitOpen => "CircuitOpen",
            GatewayError::BufferFull => "BufferFull",
            GatewayError::Shutdown => "Shutdown",
            GatewayError::UnsupportedConfig(_) => "UnsupportedConfig",
        }
    }
}

impl From<std::io::Error> for GatewayError {
    /// Unclassified I/O errors are treated as retryable transport errors.
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => GatewayError::Timeout,
            _ => GatewayError::Transport(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_family_is_retryable() {
        assert!(GatewayError::Transport("reset".into()).is_retryable());
        assert!(GatewayError::Timeout.is_retryable());
        assert!(GatewayError::Unreachable("10.0.0.9:502".into()).is_retryable());
        assert!(GatewayError::PoolExhausted("plc-1".into()).is_retryable());
        assert!(GatewayError::BufferFull.is_retryable());
        assert!(GatewayError::CircuitOpen.is_retryable());
    }

    #[test]
    fn protocol_family_is_terminal() {
        assert!(GatewayError::NotWritable.is_terminal());
        assert!(GatewayError::AuthFailed("bad key".into()).is_terminal());
        assert!(GatewayError::InvalidAddress {
            address: "HR:99999".into(),
            reason: "out of range".into()
        }
        .is_terminal());
        assert!(GatewayError::TypeMismatch {
            expected: DataType::UInt16,
            actual: DataType::Float32
        }
        .is_terminal());
    }

    #[test]
    fn exception_classification_follows_handler() {
        let busy = GatewayError::ProtocolException {
            code: 6,
            retryable: true,
        };
        let illegal = GatewayError::ProtocolException {
            code: 2,
            retryable: false,
        };
        assert!(busy.is_retryable());
        assert!(illegal.is_terminal());
    }

    #[test]
    fn cancellation_family_is_never_retried() {
        assert!(GatewayError::Cancelled.is_cancellation());
        assert!(GatewayError::Shutdown.is_cancellation());
        assert!(!GatewayError::Cancelled.is_retryable());
    }

    #[test]
    fn io_errors_map_to_transport() {
        let err: GatewayError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert_eq!(err.code(), "Transport");

        let err: GatewayError =
            std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline").into();
        assert_eq!(err, GatewayError::Timeout);
    }
}
