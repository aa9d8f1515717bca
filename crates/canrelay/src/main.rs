//! canrelay - CAN/CAN-FD frame relay and UDS diagnostic runner
//!
//! Usage:
//!   canrelay [OPTIONS] <COMMAND>
//!
//! Commands:
//!   relay   Forward frames from one bus to another until Ctrl-C
//!   uds     Send a UDS request periodically and log the responses
//!   buses   Print the buses the backend exposes
//!
//! Without a config file the mock backend is used. In that case a simulated
//! ECU answers UDS requests and a traffic generator feeds the relay source, so
//! every command can be tried without hardware.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use canrelay_core::config::{BackendConfig, MockConfig, RunMode};
use canrelay_core::isotp::FrameLayout;
use canrelay_core::{
    create_bus, BusChannel, BusHandle, Frame, MockBus, RunOutcome, RunnerConfig, ScriptRunner,
    SimulatedEcu, TracingLogSink, TransportVersion,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "canrelay")]
#[command(author, version, about = "CAN/CAN-FD frame relay and UDS diagnostic runner")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, env = "CANRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Bus backend, overrides the config file
    #[arg(short, long, value_enum)]
    backend: Option<Backend>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    /// In-memory buses with a simulated ECU
    Mock,
    /// SocketCAN interfaces (Linux, `socketcan` feature)
    Socketcan,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward frames from one bus to another
    Relay {
        /// Source bus ID
        #[arg(long)]
        source: Option<u32>,

        /// Destination bus ID
        #[arg(long)]
        destination: Option<u32>,

        /// Sleep between relay iterations
        #[arg(long)]
        poll_interval_ms: Option<u64>,
    },

    /// Send a UDS request periodically
    Uds(UdsArgs),

    /// List the buses exposed by the backend
    Buses,
}

#[derive(Args)]
struct UdsArgs {
    /// Bus ID to talk on
    #[arg(long)]
    bus: Option<u32>,

    /// Tester CAN ID (e.g. 0x700)
    #[arg(long, value_parser = parse_u16)]
    src: Option<u16>,

    /// ECU response CAN ID (e.g. 0x701)
    #[arg(long, value_parser = parse_u16)]
    dst: Option<u16>,

    /// Service ID (e.g. 0x19)
    #[arg(long, value_parser = parse_u8)]
    sid: Option<u8>,

    /// Request data as hex (e.g. 02FF)
    #[arg(long, value_parser = parse_hex)]
    data: Option<HexBytes>,

    /// Do not wait for a response
    #[arg(long)]
    suppress: bool,

    /// Response timeout
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Use CAN-FD frames
    #[arg(long)]
    canfd: bool,

    /// ISO 15765-2 edition: 2004 or 2016
    #[arg(long)]
    trans_ver: Option<TransportVersion>,

    /// Pause between requests
    #[arg(long)]
    period_ms: Option<u64>,
}

/// Raw bytes given as a hex string
#[derive(Debug, Clone, PartialEq, Eq)]
struct HexBytes(Vec<u8>);

fn parse_number(s: &str) -> Result<u64, String> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let value = parse_number(s)?;
    u16::try_from(value).map_err(|_| format!("{} does not fit 16 bits", s))
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let value = parse_number(s)?;
    u8::try_from(value).map_err(|_| format!("{} does not fit 8 bits", s))
}

fn parse_hex(s: &str) -> Result<HexBytes, String> {
    let cleaned: String = s
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    hex::decode(cleaned)
        .map(HexBytes)
        .map_err(|e| format!("invalid hex '{}': {}", s, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "canrelay=debug,canrelay_core=debug"
    } else {
        "canrelay=info,canrelay_core=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(fmt::layer())
        .init();

    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading config from: {}", path.display());
            RunnerConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?
        }
        None => {
            tracing::info!("No config file provided, using mock backend");
            RunnerConfig::default()
        }
    };
    apply_overrides(&mut config, &cli);
    config.validate().context("Invalid configuration")?;

    let bus = open_bus(&config)?;

    if matches!(cli.command, Commands::Buses) {
        let buses = bus.list_buses().context("Failed to enumerate buses")?;
        println!("{}", serde_json::to_string_pretty(&buses)?);
        return Ok(());
    }

    let runner = Arc::new(ScriptRunner::new(bus, Arc::new(TracingLogSink), config));

    let notifier = runner.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            notifier.on_notify("stop", &serde_json::json!({ "source": "ctrl-c" }));
        }
    });

    tracing::info!("Starting canrelay, press Ctrl+C to stop");
    match runner.on_main().await {
        RunOutcome::Stopped => {
            tracing::info!("canrelay stopped");
            Ok(())
        }
        RunOutcome::InsufficientBuses { required, found } => {
            anyhow::bail!("Need at least {} bus(es), found {}", required, found)
        }
        RunOutcome::BusUnavailable(bus_id) => anyhow::bail!("Bus {} is not available", bus_id),
        RunOutcome::BusEnumerationFailed(e) => anyhow::bail!("Bus enumeration failed: {}", e),
        RunOutcome::SessionUnavailable(e) => anyhow::bail!("UDS session unavailable: {}", e),
    }
}

fn apply_overrides(config: &mut RunnerConfig, cli: &Cli) {
    match cli.backend {
        Some(Backend::Mock) => config.backend = BackendConfig::Mock(MockConfig::default()),
        Some(Backend::Socketcan) => config.backend = BackendConfig::SocketCan,
        None => {}
    }

    match &cli.command {
        Commands::Relay {
            source,
            destination,
            poll_interval_ms,
        } => {
            config.mode = RunMode::Relay;
            let relay = &mut config.relay;
            relay.source_bus = source.or(relay.source_bus);
            relay.destination_bus = destination.or(relay.destination_bus);
            relay.poll_interval_ms = poll_interval_ms.unwrap_or(relay.poll_interval_ms);
        }
        Commands::Uds(args) => {
            config.mode = RunMode::Diagnostic;
            let diagnostic = &mut config.diagnostic;
            diagnostic.bus = args.bus.or(diagnostic.bus);
            diagnostic.period_ms = args.period_ms.unwrap_or(diagnostic.period_ms);

            let session = &mut diagnostic.session;
            session.response_timeout_ms = args.timeout_ms.unwrap_or(session.response_timeout_ms);
            session.use_canfd |= args.canfd;
            session.transport_version = args.trans_ver.unwrap_or(session.transport_version);

            let request = &mut diagnostic.request;
            request.source_address = args.src.unwrap_or(request.source_address);
            request.dest_address = args.dst.unwrap_or(request.dest_address);
            request.service_id = args.sid.unwrap_or(request.service_id);
            if let Some(HexBytes(data)) = &args.data {
                request.data = data.clone();
            }
            request.suppress_response |= args.suppress;
        }
        Commands::Buses => {}
    }
}

/// Open the configured backend; the mock backend gets demo collaborators
fn open_bus(config: &RunnerConfig) -> Result<Arc<dyn BusChannel>> {
    let BackendConfig::Mock(mock) = &config.backend else {
        return create_bus(&config.backend, &config.buses).context("Failed to open bus backend");
    };

    let bus = Arc::new(MockBus::from_config(mock, &config.buses));
    let first = config.buses.first().map(|b| BusHandle::new(b.bus_id));

    match config.mode {
        RunMode::Diagnostic => {
            if let Some(handle) = config.diagnostic.bus.map(BusHandle::new).or(first) {
                let request = &config.diagnostic.request;
                let ecu = SimulatedEcu::new(
                    u32::from(request.source_address),
                    u32::from(request.dest_address),
                )
                .with_layout(FrameLayout::from_config(&config.diagnostic.session))
                .with_default_responses();
                bus.attach(handle, Arc::new(ecu));
                tracing::info!(bus = %handle, "Simulated ECU attached");
            }
        }
        RunMode::Relay => {
            if let Some(handle) = config.relay.source().or(first) {
                spawn_demo_traffic(bus.clone(), handle);
            }
        }
    }

    Ok(bus)
}

/// Feed one frame every 100 ms into `handle` for the relay to forward
fn spawn_demo_traffic(bus: Arc<MockBus>, handle: BusHandle) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        let mut counter: u32 = 0;
        loop {
            interval.tick().await;
            match Frame::new(0x123, counter.to_be_bytes()) {
                Ok(frame) => bus.inject(handle, [frame]),
                Err(e) => tracing::warn!(error = %e, "Demo frame rejected"),
            }
            counter = counter.wrapping_add(1);
        }
    });
}
