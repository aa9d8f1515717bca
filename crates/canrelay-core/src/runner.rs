//! Host entry points
//!
//! The host drives a run through two calls: `on_main` runs until stopped, and
//! `on_notify` delivers events (most importantly `"stop"`) from another task
//! while `on_main` is still running.

use std::sync::Arc;

use tracing::{info, warn};

use crate::bus::{create_bus, BusChannel};
use crate::cancel::CancellationFlag;
use crate::client::UdsDiagnosticClient;
use crate::config::{RunMode, RunnerConfig};
use crate::error::Result;
use crate::frame::{BusHandle, BusInfo};
use crate::log::LogSink;
use crate::relay::FrameRelay;
use crate::session::UdsTransportSession;

/// Event type that stops a running `on_main`
pub const STOP_EVENT: &str = "stop";

/// Why `on_main` returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run was cancelled through `on_notify("stop")`
    Stopped,
    /// Fewer buses than the selected mode needs
    InsufficientBuses { required: usize, found: usize },
    /// A configured bus ID is not among the enumerated buses
    BusUnavailable(u32),
    BusEnumerationFailed(String),
    SessionUnavailable(String),
}

/// Runs the configured mode against a bus host
pub struct ScriptRunner {
    bus: Arc<dyn BusChannel>,
    sink: Arc<dyn LogSink>,
    config: RunnerConfig,
    cancel: CancellationFlag,
    session: Arc<UdsTransportSession>,
}

impl ScriptRunner {
    pub fn new(bus: Arc<dyn BusChannel>, sink: Arc<dyn LogSink>, config: RunnerConfig) -> Self {
        let session = Arc::new(UdsTransportSession::new(bus.clone()));
        Self {
            bus,
            sink,
            config,
            cancel: CancellationFlag::new(),
            session,
        }
    }

    /// Validate `config` and open its bus backend
    pub fn from_config(config: RunnerConfig, sink: Arc<dyn LogSink>) -> Result<Self> {
        config.validate()?;
        let bus = create_bus(&config.backend, &config.buses)?;
        Ok(Self::new(bus, sink, config))
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// The flag `on_notify("stop")` sets
    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub fn session(&self) -> &Arc<UdsTransportSession> {
        &self.session
    }

    /// Run the configured mode until stopped or a required resource is missing
    pub async fn on_main(&self) -> RunOutcome {
        self.cancel.reset();

        let buses = match self.bus.list_buses() {
            Ok(buses) => buses,
            Err(e) => {
                self.sink.write_log(&format!("Get buses error! {}", e));
                return RunOutcome::BusEnumerationFailed(e.to_string());
            }
        };
        let listing = serde_json::to_string(&buses).unwrap_or_default();
        self.sink.write_log(&format!("Get buses: {}", listing));

        let outcome = match self.config.mode {
            RunMode::Relay => self.run_relay(&buses).await,
            RunMode::Diagnostic => self.run_diagnostic(&buses).await,
        };
        info!(?outcome, "Run finished");
        outcome
    }

    /// Deliver a host event; `"stop"` cancels the running `on_main`
    pub fn on_notify(&self, event_type: &str, payload: &serde_json::Value) {
        self.sink
            .write_log(&format!("Notify {} {}", event_type, payload));
        if event_type == STOP_EVENT {
            self.sink.write_log("Stop...");
            self.cancel.cancel();
        }
    }

    fn insufficient(&self, required: usize, found: usize) -> RunOutcome {
        self.sink.write_log(&format!(
            "Need at least {} bus(es), found {}",
            required, found
        ));
        RunOutcome::InsufficientBuses { required, found }
    }

    fn unavailable(&self, bus_id: u32) -> RunOutcome {
        self.sink
            .write_log(&format!("Bus {} is not available", bus_id));
        RunOutcome::BusUnavailable(bus_id)
    }

    /// Resolve a configured bus against the enumeration, else the first bus not in `exclude`
    fn pick_bus(
        &self,
        buses: &[BusInfo],
        configured: Option<u32>,
        exclude: Option<u32>,
    ) -> std::result::Result<BusHandle, RunOutcome> {
        match configured {
            Some(bus_id) if buses.iter().any(|b| b.bus_id == bus_id) => {
                Ok(BusHandle::new(bus_id))
            }
            Some(bus_id) => Err(self.unavailable(bus_id)),
            None => buses
                .iter()
                .find(|b| Some(b.bus_id) != exclude)
                .map(BusInfo::handle)
                .ok_or_else(|| self.insufficient(2, buses.len())),
        }
    }

    async fn run_relay(&self, buses: &[BusInfo]) -> RunOutcome {
        if buses.len() < 2 {
            return self.insufficient(2, buses.len());
        }
        let relay_config = &self.config.relay;
        let source = match self.pick_bus(
            buses,
            relay_config.source_bus,
            relay_config.destination_bus,
        ) {
            Ok(handle) => handle,
            Err(outcome) => return outcome,
        };
        let destination = match self.pick_bus(
            buses,
            relay_config.destination_bus,
            Some(source.bus_id()),
        ) {
            Ok(handle) => handle,
            Err(outcome) => return outcome,
        };

        let relay = FrameRelay::new(self.bus.clone(), self.sink.clone())
            .with_poll_interval(relay_config.poll_interval());
        let stats = relay.run(source, destination, &self.cancel).await;
        info!(?stats, "Relay statistics");
        RunOutcome::Stopped
    }

    async fn run_diagnostic(&self, buses: &[BusInfo]) -> RunOutcome {
        if buses.is_empty() {
            return self.insufficient(1, 0);
        }
        let diagnostic = &self.config.diagnostic;
        let bus = match self.pick_bus(buses, diagnostic.bus, None) {
            Ok(handle) => handle,
            Err(outcome) => return outcome,
        };

        if let Err(e) = self.session.initialize(diagnostic.session.clone()) {
            warn!(error = %e, "UDS session unavailable");
            self.sink.write_log(&format!("UDS initialize error! {}", e));
            return RunOutcome::SessionUnavailable(e.to_string());
        }
        let _teardown = TeardownOnDrop(&self.session);

        let client = UdsDiagnosticClient::new(self.session.clone(), self.sink.clone());
        let stats = client
            .run(bus, &diagnostic.request, &self.cancel, diagnostic.period())
            .await;
        info!(?stats, "Diagnostic statistics");
        RunOutcome::Stopped
    }
}

/// Ends the UDS session even when `on_main` is dropped mid-run
struct TeardownOnDrop<'a>(&'a UdsTransportSession);

impl Drop for TeardownOnDrop<'_> {
    fn drop(&mut self) {
        self.0.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;
    use crate::config::BusConfig;
    use crate::log::MemoryLogSink;
    use crate::session::SessionState;

    fn runner(bus_ids: &[u32], mode: RunMode) -> (Arc<MemoryLogSink>, ScriptRunner) {
        let bus = Arc::new(MockBus::with_bus_ids(bus_ids));
        let sink = Arc::new(MemoryLogSink::new());
        let config = RunnerConfig {
            mode,
            buses: bus_ids.iter().copied().map(BusConfig::new).collect(),
            ..Default::default()
        };
        (sink.clone(), ScriptRunner::new(bus, sink, config))
    }

    #[tokio::test]
    async fn test_relay_needs_two_buses() {
        let (sink, runner) = runner(&[101], RunMode::Relay);
        let outcome = runner.on_main().await;

        assert_eq!(
            outcome,
            RunOutcome::InsufficientBuses {
                required: 2,
                found: 1
            }
        );
        assert!(sink.contains(r#"Get buses: [{"busID":101"#));
    }

    #[tokio::test]
    async fn test_diagnostic_needs_a_bus() {
        let (_sink, runner) = runner(&[], RunMode::Diagnostic);
        assert_eq!(
            runner.on_main().await,
            RunOutcome::InsufficientBuses {
                required: 1,
                found: 0
            }
        );
    }

    #[tokio::test]
    async fn test_enumeration_failure() {
        let bus = Arc::new(MockBus::with_bus_ids(&[101, 102]));
        bus.set_connected(false);
        let runner = ScriptRunner::new(bus, Arc::new(MemoryLogSink::new()), RunnerConfig::default());

        assert!(matches!(
            runner.on_main().await,
            RunOutcome::BusEnumerationFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_relay_configured_bus_missing() {
        let (sink, mut runner) = runner(&[101, 102], RunMode::Relay);
        runner.config.relay.source_bus = Some(103);

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(1), runner.on_main())
            .await
            .expect("relay must not start on a missing bus");
        assert_eq!(outcome, RunOutcome::BusUnavailable(103));
        assert!(sink.contains("Bus 103 is not available"));
        assert!(!sink.contains("Receive error!"));
    }

    #[tokio::test]
    async fn test_diagnostic_configured_bus_missing() {
        let (sink, mut runner) = runner(&[101], RunMode::Diagnostic);
        runner.config.diagnostic.bus = Some(7);

        assert_eq!(runner.on_main().await, RunOutcome::BusUnavailable(7));
        assert!(sink.contains("Bus 7 is not available"));
        assert_eq!(runner.session().state(), SessionState::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_default_destination_skips_source() {
        let bus = Arc::new(MockBus::with_bus_ids(&[101, 102]));
        let mut config = RunnerConfig::default();
        config.relay.source_bus = Some(102);
        let runner = ScriptRunner::new(bus.clone(), Arc::new(MemoryLogSink::new()), config);
        let cancel = runner.cancellation();

        let frame = crate::frame::Frame::new(0x123, [1, 2, 3]).unwrap();
        bus.inject(BusHandle::new(102), [frame]);
        let stop = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        };
        let (outcome, ()) = tokio::join!(runner.on_main(), stop);

        assert_eq!(outcome, RunOutcome::Stopped);
        assert_eq!(bus.transmitted(BusHandle::new(101)).len(), 1);
        assert!(bus.transmitted(BusHandle::new(102)).is_empty());
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let mut config = RunnerConfig::default();
        config.relay.poll_interval_ms = 0;
        let result = ScriptRunner::from_config(config, Arc::new(MemoryLogSink::new()));
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
    #[test]
    fn test_from_config_socketcan_unavailable() {
        let config = RunnerConfig {
            backend: crate::config::BackendConfig::SocketCan,
            ..Default::default()
        };
        let result = ScriptRunner::from_config(config, Arc::new(MemoryLogSink::new()));
        assert!(matches!(
            result,
            Err(crate::Error::Bus(crate::BusError::Unsupported(_)))
        ));
    }

    #[test]
    fn test_notify_stop() {
        let (sink, runner) = runner(&[101, 102], RunMode::Relay);
        runner.on_notify("status", &serde_json::json!({"ok": true}));
        assert!(!runner.cancellation().is_cancelled());

        runner.on_notify(STOP_EVENT, &serde_json::Value::Null);
        assert!(runner.cancellation().is_cancelled());
        assert_eq!(
            sink.lines(),
            vec![
                r#"Notify status {"ok":true}"#.to_string(),
                "Notify stop null".to_string(),
                "Stop...".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_diagnostic_run_tears_down_session() {
        let (sink, runner) = runner(&[101], RunMode::Diagnostic);
        let cancel = runner.cancellation();

        let stop = async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            cancel.cancel();
        };
        let (outcome, ()) = tokio::join!(runner.on_main(), stop);

        assert_eq!(outcome, RunOutcome::Stopped);
        assert_eq!(runner.session().state(), SessionState::Uninitialized);
        assert!(sink.contains("Request error! timeout"));
    }
}
