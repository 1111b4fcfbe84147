//! Transport errors.

use thiserror::Error;

/// Link level failure. Never fatal: the supervisor reattaches on its next tick.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No matching device found")]
    NotFound,
    #[error("Not connected")]
    NotConnected,
    #[error("Invalid device id {0:?}, expected VID:PID in hex")]
    InvalidDeviceId(String),
    #[error("Failed to enumerate serial ports: {0}")]
    Enumerate(#[source] serialport::Error),
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: serialport::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
