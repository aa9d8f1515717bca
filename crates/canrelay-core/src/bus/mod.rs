//! Bus channel layer
//!
//! This module provides the host-facing channel abstraction:
//! - `BusChannel` trait consumed by the relay and the UDS session
//! - SocketCAN channels (Linux only, `socketcan` feature)
//! - Mock channels for testing
//!
//! # Example
//!
//! ```ignore
//! use canrelay_core::bus::{create_bus, BusChannel};
//! use canrelay_core::config::BackendConfig;
//!
//! let bus = create_bus(&BackendConfig::default(), &buses)?;
//! let frames = bus.receive(BusHandle::new(101)).await?;
//! ```

mod channel;
pub mod error;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use channel::BusChannel;
pub use error::BusError;
pub use mock::{FrameResponder, MockBus};

use std::sync::Arc;

use crate::config::{BackendConfig, BusConfig};

/// Create bus channels based on configuration
pub fn create_bus(
    backend: &BackendConfig,
    buses: &[BusConfig],
) -> Result<Arc<dyn BusChannel>, BusError> {
    match backend {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        BackendConfig::SocketCan => {
            let bus = socketcan::SocketCanBus::open(buses)?;
            Ok(Arc::new(bus))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        BackendConfig::SocketCan => Err(BusError::Unsupported(
            "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
        )),
        BackendConfig::Mock(cfg) => Ok(Arc::new(MockBus::from_config(cfg, buses))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;

    #[test]
    fn test_create_mock_bus() {
        let buses = vec![BusConfig::new(101), BusConfig::new(102)];
        let bus = create_bus(&BackendConfig::Mock(MockConfig::default()), &buses).unwrap();
        let listed = bus.list_buses().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].bus_id, 101);
    }
}
