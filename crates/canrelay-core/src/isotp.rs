//! ISO 15765-2 segmentation
//!
//! Encodes and decodes the protocol control information (PCI) of single,
//! first, consecutive and flow control frames, splits UDS messages into frame
//! payloads and reassembles them again. Normal addressing only: the PCI always
//! starts at byte 0 and the CAN identifier carries the address.
//!
//! Length encodings per edition:
//!
//! | frame | 2004                    | 2016 additions                          |
//! |-------|-------------------------|-----------------------------------------|
//! | SF    | `0L` (L = 1..=7)        | `00 LL` on CAN-FD frames (LL = 8..=62)  |
//! | FF    | `1L LL` (12-bit, ≤4095) | `10 00 LL LL LL LL` (32-bit, >4095)     |

use std::time::Duration;

use thiserror::Error;

use crate::config::{TransportVersion, UdsSessionConfig};
use crate::frame::{canfd_padded_len, CANFD_MAX_LEN, CAN_MAX_LEN};

/// Filler for unused frame bytes
pub const PADDING_BYTE: u8 = 0xCC;

/// Largest message a 12-bit first frame length can announce
pub const MAX_FF_DL_12BIT: usize = 4095;

const PCI_SINGLE: u8 = 0x0;
const PCI_FIRST: u8 = 0x1;
const PCI_CONSECUTIVE: u8 = 0x2;
const PCI_FLOW_CONTROL: u8 = 0x3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IsoTpError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Message of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Empty message")]
    EmptyPayload,

    #[error("Wrong sequence number: expected {expected}, got {got}")]
    BadSequence { expected: u8, got: u8 },
}

fn invalid(msg: impl Into<String>) -> IsoTpError {
    IsoTpError::InvalidFrame(msg.into())
}

/// Flow control status sent by a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    /// Clear to send the next block
    ClearToSend,
    /// Keep waiting for another flow control frame
    Wait,
    /// Receiver cannot take the message
    Overflow,
}

/// Decoded protocol data unit, borrowing from the frame payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu<'a> {
    SingleFrame { data: &'a [u8] },
    FirstFrame { len: usize, data: &'a [u8] },
    ConsecutiveFrame { sn: u8, data: &'a [u8] },
    FlowControl { status: FlowStatus, block_size: u8, st_min: u8 },
}

/// Frame geometry derived from the session configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub use_canfd: bool,
    pub version: TransportVersion,
}

impl FrameLayout {
    pub fn new(use_canfd: bool, version: TransportVersion) -> Self {
        Self { use_canfd, version }
    }

    pub fn from_config(config: &UdsSessionConfig) -> Self {
        Self::new(config.use_canfd, config.transport_version)
    }

    /// Largest CAN payload used for segments
    pub fn frame_len(&self) -> usize {
        if self.use_canfd {
            CANFD_MAX_LEN
        } else {
            CAN_MAX_LEN
        }
    }

    /// Largest message that still fits a single frame
    pub fn single_frame_capacity(&self) -> usize {
        match (self.use_canfd, self.version) {
            (true, TransportVersion::Iso15765_2016) => CANFD_MAX_LEN - 2,
            _ => CAN_MAX_LEN - 1,
        }
    }

    /// Largest message the edition can announce
    pub fn max_message_len(&self) -> usize {
        match self.version {
            TransportVersion::Iso15765_2004 => MAX_FF_DL_12BIT,
            TransportVersion::Iso15765_2016 => u32::MAX as usize,
        }
    }

    /// Check a first frame length announced by the peer
    pub fn accept_first_frame(&self, len: usize) -> Result<(), IsoTpError> {
        let max = self.max_message_len();
        if len > max {
            return Err(IsoTpError::PayloadTooLarge { len, max });
        }
        Ok(())
    }

    /// Pad a frame payload to a length the bus can carry
    fn pad(&self, mut buf: Vec<u8>) -> Vec<u8> {
        let target = if self.use_canfd {
            canfd_padded_len(buf.len()).unwrap_or(CANFD_MAX_LEN).max(CAN_MAX_LEN)
        } else {
            CAN_MAX_LEN
        };
        buf.resize(target, PADDING_BYTE);
        buf
    }
}

/// A message split into frame payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segmented {
    /// The whole message fits one single frame
    Single(Vec<u8>),
    /// First frame plus consecutive frames, sent under flow control
    Multi {
        first: Vec<u8>,
        consecutive: Vec<Vec<u8>>,
    },
}

/// Split a message into padded frame payloads
pub fn segment(payload: &[u8], layout: FrameLayout) -> Result<Segmented, IsoTpError> {
    if payload.is_empty() {
        return Err(IsoTpError::EmptyPayload);
    }
    let max = layout.max_message_len();
    if payload.len() > max {
        return Err(IsoTpError::PayloadTooLarge {
            len: payload.len(),
            max,
        });
    }

    let frame_len = layout.frame_len();
    if payload.len() <= layout.single_frame_capacity() {
        let mut buf = Vec::with_capacity(frame_len);
        if payload.len() < CAN_MAX_LEN {
            buf.push((PCI_SINGLE << 4) | payload.len() as u8);
        } else {
            buf.push(PCI_SINGLE << 4);
            buf.push(payload.len() as u8);
        }
        buf.extend_from_slice(payload);
        return Ok(Segmented::Single(layout.pad(buf)));
    }

    let mut first = Vec::with_capacity(frame_len);
    if payload.len() <= MAX_FF_DL_12BIT {
        first.push((PCI_FIRST << 4) | ((payload.len() >> 8) as u8 & 0x0F));
        first.push((payload.len() & 0xFF) as u8);
    } else {
        first.push(PCI_FIRST << 4);
        first.push(0x00);
        first.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    }
    // At least one consecutive frame always follows the first frame.
    let first_chunk = (frame_len - first.len()).min(payload.len() - 1);
    first.extend_from_slice(&payload[..first_chunk]);

    let consecutive = payload[first_chunk..]
        .chunks(frame_len - 1)
        .enumerate()
        .map(|(i, chunk)| {
            let sn = ((i + 1) & 0x0F) as u8;
            let mut buf = Vec::with_capacity(frame_len);
            buf.push((PCI_CONSECUTIVE << 4) | sn);
            buf.extend_from_slice(chunk);
            layout.pad(buf)
        })
        .collect();

    Ok(Segmented::Multi {
        first: layout.pad(first),
        consecutive,
    })
}

/// Build a flow control frame payload
pub fn encode_flow_control(
    status: FlowStatus,
    block_size: u8,
    st_min: u8,
    layout: FrameLayout,
) -> Vec<u8> {
    let status_nibble = match status {
        FlowStatus::ClearToSend => 0x0,
        FlowStatus::Wait => 0x1,
        FlowStatus::Overflow => 0x2,
    };
    layout.pad(vec![(PCI_FLOW_CONTROL << 4) | status_nibble, block_size, st_min])
}

/// Decode the PCI of a frame payload
pub fn decode(data: &[u8]) -> Result<Pdu<'_>, IsoTpError> {
    let Some(&pci) = data.first() else {
        return Err(invalid("empty frame"));
    };

    match pci >> 4 {
        PCI_SINGLE => {
            let nibble = (pci & 0x0F) as usize;
            let (len, start) = if nibble == 0 {
                // CAN-FD escape: length in the second byte
                if data.len() <= CAN_MAX_LEN || data.len() < 2 {
                    return Err(invalid("single frame with zero length"));
                }
                (data[1] as usize, 2)
            } else {
                (nibble, 1)
            };
            if len == 0 || data.len() < start + len {
                return Err(invalid(format!("single frame length {} out of range", len)));
            }
            Ok(Pdu::SingleFrame {
                data: &data[start..start + len],
            })
        }
        PCI_FIRST => {
            if data.len() < 2 {
                return Err(invalid("truncated first frame"));
            }
            let len12 = (((pci & 0x0F) as usize) << 8) | data[1] as usize;
            let (len, start) = if len12 == 0 {
                if data.len() < 6 {
                    return Err(invalid("truncated first frame escape length"));
                }
                let len = u32::from_be_bytes([data[2], data[3], data[4], data[5]]) as usize;
                if len <= MAX_FF_DL_12BIT {
                    return Err(invalid(format!(
                        "escaped first frame length {} fits 12 bits",
                        len
                    )));
                }
                (len, 6)
            } else {
                (len12, 2)
            };
            if len < CAN_MAX_LEN {
                return Err(invalid(format!("first frame length {} too small", len)));
            }
            let end = data.len().min(start + len);
            Ok(Pdu::FirstFrame {
                len,
                data: &data[start..end],
            })
        }
        PCI_CONSECUTIVE => Ok(Pdu::ConsecutiveFrame {
            sn: pci & 0x0F,
            data: &data[1..],
        }),
        PCI_FLOW_CONTROL => {
            if data.len() < 3 {
                return Err(invalid("truncated flow control frame"));
            }
            let status = match pci & 0x0F {
                0x0 => FlowStatus::ClearToSend,
                0x1 => FlowStatus::Wait,
                0x2 => FlowStatus::Overflow,
                other => return Err(invalid(format!("flow status {}", other))),
            };
            Ok(Pdu::FlowControl {
                status,
                block_size: data[1],
                st_min: data[2],
            })
        }
        other => Err(invalid(format!("unknown PCI type {}", other))),
    }
}

/// Minimum separation time encoded in a flow control frame.
///
/// Reserved values are treated as the maximum of 127 ms.
pub fn st_min_to_duration(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(raw as u64),
        0xF1..=0xF9 => Duration::from_micros((raw as u64 - 0xF0) * 100),
        _ => Duration::from_millis(0x7F),
    }
}

/// Collects consecutive frames after a first frame
#[derive(Debug, Clone)]
pub struct Reassembler {
    expected: usize,
    buf: Vec<u8>,
    next_sn: u8,
}

impl Reassembler {
    pub fn start(len: usize, first: &[u8]) -> Self {
        // The announced length comes from the bus; grow on demand past 12 bits
        let mut buf = Vec::with_capacity(len.min(MAX_FF_DL_12BIT));
        buf.extend_from_slice(&first[..first.len().min(len)]);
        Self {
            expected: len,
            buf,
            next_sn: 1,
        }
    }

    /// Append a consecutive frame; returns `true` once the message is complete
    pub fn push(&mut self, sn: u8, data: &[u8]) -> Result<bool, IsoTpError> {
        if sn != self.next_sn {
            return Err(IsoTpError::BadSequence {
                expected: self.next_sn,
                got: sn,
            });
        }
        self.next_sn = (self.next_sn + 1) & 0x0F;
        let take = data.len().min(self.remaining());
        self.buf.extend_from_slice(&data[..take]);
        Ok(self.is_complete())
    }

    pub fn remaining(&self) -> usize {
        self.expected - self.buf.len()
    }

    pub fn is_complete(&self) -> bool {
        self.buf.len() >= self.expected
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.buf
    }
}
