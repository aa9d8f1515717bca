//! SocketCAN bus channels (Linux only)
//!
//! Each configured bus maps to one non-blocking CAN-FD raw socket, which also
//! carries classic CAN frames.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use socketcan::{
    CanAnyFrame, CanFdFrame, CanFdSocket, CanFrame, EmbeddedFrame, ExtendedId, Id, Socket,
    StandardId,
};
use socketcan::Frame as _;

use super::{BusChannel, BusError};
use crate::config::BusConfig;
use crate::frame::{BusHandle, BusInfo, Frame};

/// Largest identifier sent as an 11-bit standard id
const MAX_STANDARD_ID: u32 = 0x7FF;

struct Channel {
    info: BusInfo,
    interface: String,
    socket: CanFdSocket,
}

/// Bus channels backed by SocketCAN interfaces
pub struct SocketCanBus {
    channels: BTreeMap<u32, Channel>,
}

impl SocketCanBus {
    pub fn open(buses: &[BusConfig]) -> Result<Self, BusError> {
        let mut channels = BTreeMap::new();
        for bus in buses {
            let interface = bus.interface.clone().ok_or_else(|| {
                BusError::Unsupported(format!("bus {} has no interface configured", bus.bus_id))
            })?;
            let socket = CanFdSocket::open(&interface).map_err(|e| {
                BusError::ReceiveFailed(format!("Failed to open {}: {}", interface, e))
            })?;
            socket.set_nonblocking(true).map_err(|e| {
                let reason = format!("Failed to set non-blocking on {}: {}", interface, e);
                BusError::ReceiveFailed(reason)
            })?;
            tracing::info!(bus_id = bus.bus_id, %interface, "Opened SocketCAN channel");
            channels.insert(
                bus.bus_id,
                Channel {
                    info: bus.info(),
                    interface,
                    socket,
                },
            );
        }
        Ok(Self { channels })
    }

    fn channel(&self, bus: BusHandle) -> Result<&Channel, BusError> {
        self.channels
            .get(&bus.bus_id())
            .ok_or(BusError::UnknownBus(bus.bus_id()))
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn to_can_id(raw: u32) -> Result<Id, BusError> {
    let id = if raw <= MAX_STANDARD_ID {
        StandardId::new(raw as u16).map(Id::Standard)
    } else {
        ExtendedId::new(raw).map(Id::Extended)
    };
    id.ok_or_else(|| BusError::InvalidFrame(format!("Invalid CAN ID: 0x{:X}", raw)))
}

fn from_any_frame(frame: CanAnyFrame, timestamp: u64) -> Option<Frame> {
    let converted = match frame {
        CanAnyFrame::Normal(f) => Frame::new(f.raw_id(), f.data().to_vec()),
        CanAnyFrame::Fd(f) => Frame::new_fd(f.raw_id(), f.data().to_vec(), f.is_brs()),
        CanAnyFrame::Remote(_) | CanAnyFrame::Error(_) => return None,
    };
    converted.ok().map(|f| f.with_timestamp(timestamp))
}

#[async_trait]
impl BusChannel for SocketCanBus {
    fn list_buses(&self) -> Result<Vec<BusInfo>, BusError> {
        Ok(self.channels.values().map(|c| c.info.clone()).collect())
    }

    async fn receive(&self, bus: BusHandle) -> Result<Vec<Frame>, BusError> {
        let channel = self.channel(bus)?;
        let mut frames = Vec::new();
        loop {
            match channel.socket.read_frame() {
                Ok(any) => {
                    if let Some(frame) = from_any_frame(any, now_micros()) {
                        frames.push(frame);
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if frames.is_empty() => {
                    return Err(BusError::ReceiveFailed(format!(
                        "{}: {}",
                        channel.interface, e
                    )));
                }
                Err(e) => {
                    tracing::warn!(
                        interface = %channel.interface,
                        error = %e,
                        "Read error after partial batch"
                    );
                    break;
                }
            }
        }
        Ok(frames)
    }

    async fn transmit(&self, bus: BusHandle, frames: &[Frame]) -> Result<(), BusError> {
        let channel = self.channel(bus)?;
        for frame in frames {
            let id = to_can_id(frame.id())?;
            let written = if frame.is_fd() {
                let mut fd = CanFdFrame::new(id, frame.payload()).ok_or_else(|| {
                    BusError::InvalidFrame(format!("CAN-FD frame 0x{:X}", frame.id()))
                })?;
                fd.set_brs(frame.brs());
                channel.socket.write_frame(&fd)
            } else {
                let classic = CanFrame::new(id, frame.payload()).ok_or_else(|| {
                    BusError::InvalidFrame(format!("CAN frame 0x{:X}", frame.id()))
                })?;
                channel.socket.write_frame(&classic)
            };
            written.map_err(|e| BusError::TransmitFailed(format!("{}: {}", channel.interface, e)))?;
        }
        Ok(())
    }
}
