//! Error types for meter operations
//!
//! Covers command validation, link availability and the transient radio
//! failures reported by a [`Central`](crate::central::Central) backend.

use thiserror::Error;
use uuid::Uuid;

/// Main error type for meter operations
#[derive(Error, Debug)]
pub enum MeterError {
    // ===== Validation Errors =====
    /// Command text does not fit in a frame
    #[error("Command too long: {len} bytes exceeds frame size of {max} bytes")]
    CommandTooLong {
        /// Actual command length
        len: usize,
        /// Frame size
        max: usize,
    },

    /// Command text contains non-ASCII characters
    #[error("Command is not ASCII: {0:?}")]
    NonAsciiCommand(String),

    /// Worldline slot outside 0..=7
    #[error("Worldline index must be in the range of 0 to 7, got {0}")]
    InvalidWorldlineIndex(i32),

    /// Worldline text of the wrong length
    #[error("Worldline text must have length 8, got {len}")]
    InvalidWorldlineText {
        /// Actual text length
        len: usize,
    },

    // ===== Availability Errors =====
    /// The meter is not connected; surfaced as a service communication failure
    #[error("Service communication failure: meter is not connected")]
    ServiceUnavailable,

    // ===== Radio Errors =====
    /// Radio-level connect failed
    #[error("Failed to connect to {peripheral}: {reason}")]
    ConnectFailed {
        /// Peripheral identifier
        peripheral: String,
        /// Failure reason
        reason: String,
    },

    /// Service or characteristic discovery failed
    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),

    /// The command characteristic is not present on the peripheral
    #[error("Characteristic {0} not found on peripheral")]
    CharacteristicMissing(Uuid),

    /// Write to the characteristic failed
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Starting or stopping a scan failed
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    /// Peripheral is not known to the central
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),

    /// Any other radio backend error
    #[error("Radio error: {0}")]
    Radio(String),

    // ===== Setup Errors =====
    /// No Bluetooth adapter available
    #[error("No Bluetooth adapter found")]
    NoAdapter,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// The service loop has stopped
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeterError {
    /// Check if this error is a transient radio failure that the state machine recovers from
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            MeterError::ConnectFailed { .. }
                | MeterError::DiscoveryFailed(_)
                | MeterError::CharacteristicMissing(_)
                | MeterError::WriteFailed(_)
                | MeterError::ScanFailed(_)
                | MeterError::ServiceUnavailable
        )
    }

    /// Check if this is a rejected command (never written to the device)
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            MeterError::CommandTooLong { .. }
                | MeterError::NonAsciiCommand(_)
                | MeterError::InvalidWorldlineIndex(_)
                | MeterError::InvalidWorldlineText { .. }
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            MeterError::CommandTooLong { .. } => "COMMAND_TOO_LONG",
            MeterError::NonAsciiCommand(_) => "NON_ASCII_COMMAND",
            MeterError::InvalidWorldlineIndex(_) => "INVALID_WORLDLINE_INDEX",
            MeterError::InvalidWorldlineText { .. } => "INVALID_WORLDLINE_TEXT",
            MeterError::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            MeterError::ConnectFailed { .. } => "CONNECT_FAILED",
            MeterError::DiscoveryFailed(_) => "DISCOVERY_FAILED",
            MeterError::CharacteristicMissing(_) => "CHARACTERISTIC_MISSING",
            MeterError::WriteFailed(_) => "WRITE_FAILED",
            MeterError::ScanFailed(_) => "SCAN_FAILED",
            MeterError::UnknownPeripheral(_) => "UNKNOWN_PERIPHERAL",
            MeterError::Radio(_) => "RADIO_ERROR",
            MeterError::NoAdapter => "NO_ADAPTER",
            MeterError::InvalidConfig(_) => "INVALID_CONFIG",
            MeterError::ChannelClosed => "CHANNEL_CLOSED",
            MeterError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for meter operations
pub type Result<T> = std::result::Result<T, MeterError>;

#[cfg(feature = "ble")]
impl From<btleplug::Error> for MeterError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::DeviceNotFound => {
                MeterError::UnknownPeripheral("device not found".to_string())
            }
            btleplug::Error::NotConnected => MeterError::ServiceUnavailable,
            other => MeterError::Radio(other.to_string()),
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MeterError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MeterError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(MeterError::ServiceUnavailable.error_code(), "SERVICE_UNAVAILABLE");
        assert_eq!(
            MeterError::CommandTooLong { len: 19, max: 18 }.error_code(),
            "COMMAND_TOO_LONG"
        );
    }

    #[test]
    fn test_is_retriable() {
        assert!(MeterError::DiscoveryFailed("gatt".to_string()).is_retriable());
        assert!(MeterError::ServiceUnavailable.is_retriable());
        assert!(!MeterError::InvalidWorldlineIndex(9).is_retriable());
    }

    #[test]
    fn test_is_validation() {
        assert!(MeterError::InvalidWorldlineText { len: 3 }.is_validation());
        assert!(MeterError::NonAsciiCommand("#3é".to_string()).is_validation());
        assert!(!MeterError::ChannelClosed.is_validation());
    }

    #[test]
    fn test_command_too_long_message() {
        let err = MeterError::CommandTooLong { len: 20, max: 18 };
        assert!(err.to_string().contains("20"));
        assert!(err.to_string().contains("18"));
    }
}
