//! Bus channel errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Unknown bus: {0}")]
    UnknownBus(u32),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transmit failed: {0}")]
    TransmitFailed(String),

    #[error("Bus disconnected")]
    Disconnected,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Bus backend not supported: {0}")]
    Unsupported(String),
}
