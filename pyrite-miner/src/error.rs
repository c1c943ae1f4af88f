//! Common error types for pyrite-miner.
//!
//! One central Error enum using thiserror, with conversions from the
//! underlying transport error types. Asynchronous failures inside a running
//! driver are not surfaced through these values; they are logged and handled
//! by the reconnect path. Callers only see errors for synchronous problems
//! such as bad configuration or commands sent to an unloaded device.

use thiserror::Error;

/// Main error type for pyrite-miner operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port errors
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Failed to establish a connection (port missing, open refused)
    #[error("connection error: {0}")]
    Connection(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Device wire protocol errors
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Command sent to a device that has been unloaded
    #[error("device is unloaded")]
    Unloaded,
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
