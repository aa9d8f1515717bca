//! CAN/CAN-FD frames and bus identifiers

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum payload of a classic CAN frame
pub const CAN_MAX_LEN: usize = 8;

/// Maximum payload of a CAN-FD frame
pub const CANFD_MAX_LEN: usize = 64;

/// Payload lengths a CAN-FD frame can carry (DLC 0..=15)
const CANFD_LENGTHS: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// Round a payload length up to the next length a CAN-FD DLC can express.
///
/// Returns `None` for lengths above 64.
pub fn canfd_padded_len(len: usize) -> Option<usize> {
    CANFD_LENGTHS.iter().copied().find(|&l| l >= len)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLong { len: usize, max: usize },
}

/// Opaque identifier of a bus channel known to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusHandle(u32);

impl BusHandle {
    pub const fn new(bus_id: u32) -> Self {
        Self(bus_id)
    }

    pub const fn bus_id(self) -> u32 {
        self.0
    }
}

impl From<u32> for BusHandle {
    fn from(bus_id: u32) -> Self {
        Self(bus_id)
    }
}

impl std::fmt::Display for BusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A bus channel as reported by host bus enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusInfo {
    #[serde(rename = "busID", alias = "bus_id")]
    pub bus_id: u32,
    #[serde(rename = "devType", alias = "device_type", default)]
    pub device_type: u32,
    #[serde(rename = "devIndex", alias = "device_index", default)]
    pub device_index: u32,
    #[serde(rename = "chnIndex", alias = "channel_index", default)]
    pub channel_index: u32,
}

impl BusInfo {
    pub fn new(bus_id: u32) -> Self {
        Self {
            bus_id,
            device_type: 0,
            device_index: 0,
            channel_index: 0,
        }
    }

    pub fn handle(&self) -> BusHandle {
        BusHandle(self.bus_id)
    }
}

/// A single CAN or CAN-FD frame.
///
/// Frames are immutable once built. The payload limit is enforced at
/// construction: 8 bytes for classic CAN, 64 bytes for CAN-FD. The bit rate
/// switch flag only exists on CAN-FD frames and always reads `false` otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    id: u32,
    is_fd: bool,
    brs: bool,
    payload: Vec<u8>,
    timestamp_micros: u64,
}

impl Frame {
    /// Build a classic CAN frame
    pub fn new(id: u32, payload: impl Into<Vec<u8>>) -> Result<Self, FrameError> {
        Self::build(id, false, false, payload.into())
    }

    /// Build a CAN-FD frame
    pub fn new_fd(id: u32, payload: impl Into<Vec<u8>>, brs: bool) -> Result<Self, FrameError> {
        Self::build(id, true, brs, payload.into())
    }

    /// Build a frame of either kind; `brs` is dropped for classic frames
    pub fn build(id: u32, is_fd: bool, brs: bool, payload: Vec<u8>) -> Result<Self, FrameError> {
        let max = if is_fd { CANFD_MAX_LEN } else { CAN_MAX_LEN };
        if payload.len() > max {
            return Err(FrameError::PayloadTooLong {
                len: payload.len(),
                max,
            });
        }
        Ok(Self {
            id,
            is_fd,
            brs: is_fd && brs,
            payload,
            timestamp_micros: 0,
        })
    }

    /// Return the same frame stamped with a receive time
    pub fn with_timestamp(mut self, timestamp_micros: u64) -> Self {
        self.timestamp_micros = timestamp_micros;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_fd(&self) -> bool {
        self.is_fd
    }

    pub fn brs(&self) -> bool {
        self.brs
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn timestamp_micros(&self) -> u64 {
        self.timestamp_micros
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}
