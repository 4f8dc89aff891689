//! Error types for the BLE ingestion path.

use thiserror::Error;

/// Errors surfaced by the client, the command channel and the configuration layer.
///
/// Only [`ClientError::DeviceNotFound`] and [`ClientError::ConnectFailed`] are
/// expected to reach a user.  Steady-state transport faults are retried inside
/// [`crate::eeg_client::EegClient::run`] and only logged.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Scanning exhausted its retries without a name match.
    #[error("no device advertising a name containing {name:?} after {attempts} scan(s)")]
    DeviceNotFound { name: String, attempts: u32 },

    /// A matching device was found but the link could not be set up.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The notification stream or a write failed mid-session.
    #[error("transport disconnected: {0}")]
    TransportDisconnected(String),

    /// A command was issued while no link was established.
    #[error("not connected")]
    NotConnected,

    /// Trigger tags are `1..=255`; `0` means "no marker" in the stream.
    #[error("invalid trigger tag {0}")]
    InvalidTrigger(u8),

    /// A frame handed to the decoder does not have the layout's length.
    #[error("malformed frame: expected {expected} bytes, got {actual}")]
    MalformedFrame { expected: usize, actual: usize },

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was interrupted by [`crate::eeg_client::StopHandle::stop`].
    #[error("stopped")]
    Stopped,
}

impl From<toml::de::Error> for ClientError {
    fn from(e: toml::de::Error) -> Self {
        ClientError::Config(e.to_string())
    }
}

/// Failures reported by a [`crate::transport::BleBackend`] or [`crate::transport::BleLink`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,

    /// The device was not seen by the most recent scan.
    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(uuid::Uuid),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("link closed")]
    Closed,

    #[error("bluetooth error: {0}")]
    Bluetooth(String),
}

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        TransportError::Bluetooth(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
