//! UDS transport session
//!
//! This module owns the request/response exchange over ISO 15765-2: one
//! session at a time, one outstanding request per session.

mod manager;

pub use manager::{UdsTransportSession, RESPONSE_PENDING_LIMIT, RESPONSE_POLL_INTERVAL};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No session; `initialize` must be called first
    #[default]
    Uninitialized,
    /// Session configured and idle
    Ready,
    /// A request is outstanding; further requests are rejected
    RequestInFlight,
}

/// Session management errors
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("A UDS session is already active")]
    AlreadyActive,

    #[error("No UDS session initialized")]
    NotInitialized,

    #[error("A UDS request is already in flight")]
    RequestInFlight,

    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),
}
