//! canrelay-core - CAN/CAN-FD frame relay and UDS diagnostic core
//!
//! This crate forwards frames between bus channels and runs UDS requests
//! over an ISO 15765-2 transport session, both under a cooperative stop flag.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ScriptRunner                            │
//! │  on_main / on_notify                                        │
//! │                                                             │
//! │  ┌─────────────┐  ┌─────────────────┐  ┌────────────────┐   │
//! │  │ FrameRelay  │  │UdsDiagnostic-   │  │Cancellation-   │   │
//! │  │ (forward)   │  │Client (log/NRC) │  │Flag            │   │
//! │  └──────┬──────┘  └────────┬────────┘  └────────────────┘   │
//! │         │          ┌───────┴──────────┐                     │
//! │         │          │UdsTransport-     │                     │
//! │         │          │Session (ISO-TP)  │                     │
//! │         │          └───────┬──────────┘                     │
//! │         │                  │                                │
//! │       ┌─┴──────────────────┴─┐                              │
//! │       │ BusChannel           │                              │
//! │       │ (mock / SocketCAN)   │                              │
//! │       └──────────────────────┘                              │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bus;
pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod isotp;
pub mod log;
pub mod relay;
pub mod runner;
pub mod session;
pub mod sim;
pub mod uds;

pub use bus::{create_bus, BusChannel, BusError, FrameResponder, MockBus};
pub use cancel::CancellationFlag;
pub use client::{DiagnosticStats, UdsDiagnosticClient};
pub use config::{RunnerConfig, TransportVersion, UdsSessionConfig};
pub use error::{Error, Result};
pub use frame::{BusHandle, BusInfo, Frame};
pub use log::{LogSink, MemoryLogSink, TracingLogSink};
pub use relay::{FrameRelay, RelayStats, DEFAULT_POLL_INTERVAL};
pub use runner::{RunOutcome, ScriptRunner};
pub use session::{SessionError, SessionState, UdsTransportSession};
pub use sim::SimulatedEcu;
pub use uds::{NegativeResponseCode, UdsRequest, UdsResponse};
