//! Error types for the ipvs-weather-ble crate.

use thiserror::Error;

use crate::ble::connection::ConnectionState;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The host has not authorized scanning or connecting.
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// Bluetooth is not available or is powered off on this system.
    #[error("Bluetooth adapter not available or disabled")]
    AdapterUnavailable,

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// A GATT request completed with a failure status.
    #[error("GATT {operation} failed: {reason}")]
    GattOperationFailed {
        /// The request that failed.
        operation: GattOperation,
        /// Status reported by the radio stack.
        reason: String,
    },

    /// A payload could not be decoded into a reading.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The radio did not answer within the configured bound.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// The phase that timed out.
        operation: GattOperation,
        /// The configured bound in milliseconds.
        timeout_ms: u64,
    },

    /// The established link dropped.
    #[error("Connection lost")]
    ConnectionLost,

    /// Operation requires a connection but no session is active.
    #[error("Not connected")]
    NotConnected,

    /// The connection state machine refused a request in its current state.
    #[error("Invalid connection state: {state}")]
    InvalidState {
        /// State at the time of the request.
        state: ConnectionState,
    },

    /// Internal channel or task failure.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The requested operation is not supported.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },
}

impl Error {
    /// Whether a fresh connection attempt may succeed after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::ConnectionLost
                | Self::Bluetooth(_)
                | Self::GattOperationFailed {
                    operation: GattOperation::Connect | GattOperation::DiscoverServices,
                    ..
                }
        )
    }

    /// Map a platform error raised while scanning or connecting.
    pub(crate) fn from_radio(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied => Self::PermissionDenied,
            other => Self::Bluetooth(other),
        }
    }
}

/// GATT request kinds, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattOperation {
    /// Opening the link.
    Connect,
    /// Service discovery.
    DiscoverServices,
    /// Client configuration descriptor write.
    Subscribe,
    /// Characteristic read.
    Read,
}

impl std::fmt::Display for GattOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::DiscoverServices => write!(f, "service discovery"),
            Self::Subscribe => write!(f, "subscribe"),
            Self::Read => write!(f, "read"),
        }
    }
}

/// Payload decoding errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload is shorter than the fixed layout.
    #[error("invalid payload length: need at least 5 bytes, got {len}")]
    InvalidLength {
        /// Length of the rejected payload.
        len: usize,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
