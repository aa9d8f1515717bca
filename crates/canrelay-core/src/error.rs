//! Crate-level error type

use thiserror::Error;

use crate::bus::BusError;
use crate::config::ConfigError;
use crate::frame::FrameError;
use crate::isotp::IsoTpError;
use crate::session::SessionError;

/// Any error raised by the relay and diagnostic core
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Transport error: {0}")]
    IsoTp(#[from] IsoTpError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

pub type Result<T> = std::result::Result<T, Error>;
