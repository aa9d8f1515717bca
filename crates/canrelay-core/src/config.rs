//! Runner configuration
//!
//! This module contains configuration types for a relay or diagnostic run:
//! the bus backend, the channels to use, relay polling and the UDS session.
//! Field names follow the host's dictionary keys where they exist
//! (`response_timeout_ms`, `use_canfd`, `trans_ver`, `src_addr`, ...).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::frame::{BusHandle, BusInfo};
use crate::uds::UdsRequest;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Accept `true`/`false` as well as the host's `0`/`1`
pub(crate) fn de_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

// =============================================================================
// UDS Session Configuration
// =============================================================================

/// ISO 15765-2 edition used for segmentation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "TransportVersionRepr", rename_all = "snake_case")]
pub enum TransportVersion {
    /// ISO 15765-2:2004 (4-bit single frame length, 12-bit first frame length)
    #[default]
    Iso15765_2004,
    /// ISO 15765-2:2016 (adds CAN-FD single frame and 32-bit first frame lengths)
    Iso15765_2016,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TransportVersionRepr {
    Number(u8),
    Name(String),
}

impl TryFrom<TransportVersionRepr> for TransportVersion {
    type Error = String;

    fn try_from(repr: TransportVersionRepr) -> Result<Self, Self::Error> {
        match repr {
            TransportVersionRepr::Number(0) => Ok(Self::Iso15765_2004),
            TransportVersionRepr::Number(1) => Ok(Self::Iso15765_2016),
            TransportVersionRepr::Number(n) => Err(format!("unknown transport version {}", n)),
            TransportVersionRepr::Name(name) => name.parse(),
        }
    }
}

impl std::str::FromStr for TransportVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "iso15765_2004" | "2004" | "0" => Ok(Self::Iso15765_2004),
            "iso15765_2016" | "2016" | "1" => Ok(Self::Iso15765_2016),
            other => Err(format!("unknown transport version '{}'", other)),
        }
    }
}

/// UDS session parameters, fixed for the lifetime of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdsSessionConfig {
    /// Response timeout in milliseconds (> 0)
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// Use CAN-FD frames for the transport
    #[serde(default, deserialize_with = "de_flag")]
    pub use_canfd: bool,
    /// Segmentation rules
    #[serde(default, alias = "trans_ver")]
    pub transport_version: TransportVersion,
}

fn default_response_timeout() -> u64 {
    3000
}

impl Default for UdsSessionConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout(),
            use_canfd: false,
            transport_version: TransportVersion::default(),
        }
    }
}

impl UdsSessionConfig {
    pub fn new(
        response_timeout_ms: u64,
        use_canfd: bool,
        transport_version: TransportVersion,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            response_timeout_ms,
            use_canfd,
            transport_version,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.response_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "response_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

// =============================================================================
// Bus Configuration
// =============================================================================

/// Bus backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// In-memory bus for testing
    Mock(MockConfig),
    /// SocketCAN interfaces (Linux only)
    SocketCan,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

/// Mock bus configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated latency per bus call in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
}

/// A bus channel the backend should expose
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Host bus ID
    #[serde(alias = "busID")]
    pub bus_id: u32,
    /// Interface name (SocketCAN backend, e.g. "can0")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default)]
    pub device_type: u32,
    #[serde(default)]
    pub device_index: u32,
    #[serde(default)]
    pub channel_index: u32,
}

impl BusConfig {
    pub fn new(bus_id: u32) -> Self {
        Self {
            bus_id,
            interface: None,
            device_type: 0,
            device_index: 0,
            channel_index: 0,
        }
    }

    pub fn info(&self) -> BusInfo {
        BusInfo {
            bus_id: self.bus_id,
            device_type: self.device_type,
            device_index: self.device_index,
            channel_index: self.channel_index,
        }
    }
}

fn default_buses() -> Vec<BusConfig> {
    vec![BusConfig::new(101), BusConfig::new(102)]
}

// =============================================================================
// Run Configuration
// =============================================================================

/// What `on_main` runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Forward frames from one bus to another
    #[default]
    Relay,
    /// Send a UDS request periodically and log the responses
    Diagnostic,
}

/// Frame relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Sleep between relay iterations in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Source bus ID (defaults to the first enumerated bus)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_bus: Option<u32>,
    /// Destination bus ID (defaults to the second enumerated bus)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_bus: Option<u32>,
}

fn default_poll_interval() -> u64 {
    10
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            source_bus: None,
            destination_bus: None,
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn source(&self) -> Option<BusHandle> {
        self.source_bus.map(BusHandle::new)
    }

    pub fn destination(&self) -> Option<BusHandle> {
        self.destination_bus.map(BusHandle::new)
    }
}

/// Periodic diagnostic request configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticConfig {
    /// Pause between requests in milliseconds
    #[serde(default = "default_period")]
    pub period_ms: u64,
    /// Bus ID to talk on (defaults to the first enumerated bus)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus: Option<u32>,
    #[serde(default)]
    pub session: UdsSessionConfig,
    #[serde(default)]
    pub request: UdsRequest,
}

fn default_period() -> u64 {
    1000
}

impl Default for DiagnosticConfig {
    fn default() -> Self {
        Self {
            period_ms: default_period(),
            bus: None,
            session: UdsSessionConfig::default(),
            request: UdsRequest::default(),
        }
    }
}

impl DiagnosticConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// Complete configuration of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default = "default_buses")]
    pub buses: Vec<BusConfig>,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub diagnostic: DiagnosticConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            backend: BackendConfig::default(),
            buses: default_buses(),
            relay: RelayConfig::default(),
            diagnostic: DiagnosticConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "relay.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        let mut ids: Vec<u32> = self.buses.iter().map(|b| b.bus_id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.buses.len() {
            return Err(ConfigError::Invalid("duplicate bus_id in buses".to_string()));
        }
        if let (Some(source), Some(destination)) =
            (self.relay.source_bus, self.relay.destination_bus)
        {
            if source == destination {
                return Err(ConfigError::Invalid(format!(
                    "relay source and destination are both bus {}",
                    source
                )));
            }
        }
        self.diagnostic.session.validate()
    }
}
