use thiserror::Error;

use crate::types::ConnectionState;

/// Errors that can occur while acquiring heart-rate data
///
/// Only connection-level failures are represented here. Corruption inside the
/// byte stream is recovered by resynchronising and never reaches callers.
#[derive(Error, Debug)]
pub enum HrError {
    /// No device address has been configured
    #[error("No heart-rate monitor address configured")]
    NotConfigured,

    /// No channel on the device accepted a connection
    #[error("Device {address} unavailable (probed channels {first}..={last})")]
    DeviceUnavailable {
        /// Address that was probed
        address: String,
        /// First channel tried
        first: u8,
        /// Last channel in the probe range
        last: u8,
    },

    /// OS-level socket failure
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Operation not allowed in the current connection state
    #[error("Invalid connection state: {state}")]
    InvalidState {
        /// State the transport was in
        state: ConnectionState,
    },

    /// Bluetooth Low Energy stack error
    #[cfg(feature = "ble")]
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),
}

/// Result type for heart-rate acquisition operations
pub type Result<T> = std::result::Result<T, HrError>;

impl HrError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        match self {
            Self::DeviceUnavailable { .. } | Self::Transport(_) => true,
            #[cfg(feature = "ble")]
            Self::Ble(_) => true,
            _ => false,
        }
    }

    /// Check if retrying the same operation later can succeed
    ///
    /// A missing or malformed address needs user action first.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DeviceUnavailable { .. } | Self::Transport(_) | Self::InvalidState { .. }
        )
    }
}
