//! Static scheduler configuration.
//!
//! Configuration comes from an optional TOML file, then command-line overrides. Everything is
//! validated once by [`WfqConfig::validate`] before any thread starts; a malformed configuration is
//! fatal.
//!
//! ```toml
//! bind = "127.0.0.1:4000"
//! service_rate = 20.0
//! buffer_size = 100
//!
//! [[flows]]
//! port = 5001
//! weight = 1.0
//!
//! [pacing]
//! spin_window_ms = 5
//! ```

use crate::error::ConfigError;
use crate::flow::{FlowId, FlowRegistry};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Slowest accepted output rate; one packet every ~11.6 days keeps the pacing interval representable.
pub const MIN_SERVICE_RATE: f64 = 1e-6;

/// Upper bound on the busy-poll tail of each pacing interval.
pub const MAX_SPIN_WINDOW_MS: u64 = 9;

/// One registered flow: UDP source port and relative weight.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowConfig {
    pub port: FlowId,
    pub weight: f64,
}

impl FromStr for FlowConfig {
    type Err = ConfigError;

    /// Parse `PORT=WEIGHT`, e.g. `5002=2`.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidFlowSpec(text.to_string());
        let (port, weight) = text.split_once('=').ok_or_else(invalid)?;
        let port = port.trim().parse::<FlowId>().map_err(|_| invalid())?;
        let weight = weight.trim().parse::<f64>().map_err(|_| invalid())?;
        Ok(Self { port, weight })
    }
}

/// Output pacing knobs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PacingConfig {
    /// Final part of each interval spent spinning instead of sleeping.
    pub spin_window_ms: u64,
    /// Back-off when the queue is empty.
    pub idle_poll_ms: u64,
    /// Ingress receive timeout, bounds shutdown latency.
    pub recv_poll_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            spin_window_ms: 5,
            idle_poll_ms: 1,
            recv_poll_ms: 50,
        }
    }
}

/// Top-level configuration used during startup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WfqConfig {
    /// UDP address the scheduler listens on and echoes from.
    pub bind: String,
    /// Output capacity in packets per second, shared by all flows.
    pub service_rate: f64,
    /// Maximum number of queued packets.
    pub buffer_size: usize,
    /// Registered flows; traffic from any other source port is discarded.
    pub flows: Vec<FlowConfig>,
    pub pacing: PacingConfig,
    /// Period of the statistics log line and metrics broadcast.
    pub stats_interval_ms: u64,
    /// Optional TCP address streaming JSON metrics snapshots.
    pub metrics_bind: Option<String>,
}

impl Default for WfqConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:4000".to_string(),
            service_rate: 20.0,
            buffer_size: 100,
            flows: vec![
                FlowConfig {
                    port: 5001,
                    weight: 1.0,
                },
                FlowConfig {
                    port: 5002,
                    weight: 2.0,
                },
                FlowConfig {
                    port: 5003,
                    weight: 4.0,
                },
            ],
            pacing: PacingConfig::default(),
            stats_interval_ms: 1_000,
            metrics_bind: None,
        }
    }
}

impl WfqConfig {
    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(source: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source, path)
    }

    /// Check every startup invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.service_rate.is_finite() && self.service_rate >= MIN_SERVICE_RATE) {
            return Err(ConfigError::InvalidServiceRate(self.service_rate));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if self.pacing.spin_window_ms > MAX_SPIN_WINDOW_MS {
            return Err(ConfigError::SpinWindowTooLarge(self.pacing.spin_window_ms));
        }
        if self.pacing.idle_poll_ms == 0 {
            return Err(ConfigError::ZeroPollInterval("idle_poll_ms"));
        }
        if self.pacing.recv_poll_ms == 0 {
            return Err(ConfigError::ZeroPollInterval("recv_poll_ms"));
        }
        self.registry()?;
        self.bind_addr()?;
        self.metrics_addr()?;
        Ok(())
    }

    pub fn registry(&self) -> Result<FlowRegistry, ConfigError> {
        FlowRegistry::new(self.flows.iter().map(|flow| (flow.port, flow.weight)))
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.bind)
    }

    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.metrics_bind.as_deref().map(parse_addr).transpose()
    }

    pub fn spin_window(&self) -> Duration {
        Duration::from_millis(self.pacing.spin_window_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.pacing.idle_poll_ms)
    }

    pub fn recv_poll(&self) -> Duration {
        Duration::from_millis(self.pacing.recv_poll_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(1))
    }
}

fn parse_addr(value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(value.to_string()))
}
