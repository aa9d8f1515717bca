//! Bus channel trait

use async_trait::async_trait;

use super::BusError;
use crate::frame::{BusHandle, BusInfo, Frame};

/// Host-provided access to CAN/CAN-FD channels
///
/// This trait abstracts the device driver (SocketCAN, vendor adapters, an
/// in-memory bus) behind the poll-based interface the relay and the UDS
/// session are written against. Implementations must never block for long:
/// `receive` returns whatever is pending right now.
#[async_trait]
pub trait BusChannel: Send + Sync {
    /// List the channels the host has opened
    fn list_buses(&self) -> Result<Vec<BusInfo>, BusError>;

    /// Poll a channel for received frames
    ///
    /// An empty batch means no data. An error means the read itself failed
    /// (device error, disconnect, unknown bus).
    async fn receive(&self, bus: BusHandle) -> Result<Vec<Frame>, BusError>;

    /// Send a batch of frames in order
    ///
    /// An error means none or not all of the frames were accepted.
    async fn transmit(&self, bus: BusHandle, frames: &[Frame]) -> Result<(), BusError>;
}
