//! Error types for lifeband-core.
//!
//! Transport failures never escape the connection state machine: every
//! awaited operation is wrapped so failures degrade to a
//! `Disconnected { last_error }` transition, and the error values here are
//! what callers see on the operation result itself. Protocol-level noise
//! (malformed payloads) is handled locally by the notification pump and
//! never becomes an `Error`.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when communicating with a LifeBand.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error from the platform stack.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Radio permissions were denied or no adapter is available.
    #[error("Bluetooth unavailable: {0}")]
    Permission(String),

    /// No qualifying band was found, or a known identity is gone.
    #[error("{0}")]
    DeviceNotFound(String),

    /// Operation attempted without an active link.
    #[error("Not connected to band")]
    NotConnected,

    /// Required GATT characteristic not found on the band.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout that was exceeded.
        duration: Duration,
    },

    /// Write to a characteristic failed.
    #[error("Write failed to characteristic {uuid}: {reason}")]
    WriteFailed {
        /// The characteristic UUID.
        uuid: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Protocol-level error on an otherwise healthy link.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation was cancelled by a concurrent teardown.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Persistence collaborator failure. Observed only for logging; never
    /// propagates into the connection state machine.
    #[error("Store error: {0}")]
    Store(String),
}

impl Error {
    /// Create a device not found error.
    pub fn device_not_found(message: impl Into<String>) -> Self {
        Self::DeviceNotFound(message.into())
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl std::fmt::Display) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.to_string(),
        }
    }

    /// Create a write failure.
    pub fn write_failed(uuid: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::WriteFailed {
            uuid: uuid.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// The message surfaced through `ConnectionState::Disconnected`.
    ///
    /// `DeviceNotFound` carries a user-facing message already; other kinds
    /// use their full display form.
    pub fn state_message(&self) -> String {
        match self {
            Self::DeviceNotFound(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type alias using lifeband-core's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_forms() {
        let err = Error::device_not_found("no device found");
        assert_eq!(err.to_string(), "no device found");

        let err = Error::NotConnected;
        assert_eq!(err.to_string(), "Not connected to band");

        let err = Error::timeout("connect", Duration::from_secs(10));
        assert!(err.to_string().contains("connect"));
        assert!(err.to_string().contains("10s"));

        let err = Error::write_failed("abcd", "busy");
        assert!(err.to_string().contains("abcd"));
        assert!(err.to_string().contains("busy"));
    }

    #[test]
    fn state_message_unwraps_device_not_found() {
        assert_eq!(
            Error::device_not_found("no device found").state_message(),
            "no device found"
        );
        assert_eq!(
            Error::Cancelled.state_message(),
            "Operation cancelled"
        );
    }
}
