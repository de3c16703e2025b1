//! Application configuration structures.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::entity::{Entity, MetricSpec};
use crate::transport::Destination;

use super::source::SourceConfig;
use super::validation::{ConfigError, expand_env_vars, interval_seconds};

// =============================================================================
// Constants
// =============================================================================

/// Default graceful shutdown timeout (5 seconds).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default JSON-lines sink path (stdout).
pub const DEFAULT_TRANSPORT_PATH: &str = "-";

fn default_true() -> bool {
    true
}

fn default_shutdown_timeout() -> Duration {
    DEFAULT_SHUTDOWN_TIMEOUT
}

fn default_transport_path() -> String {
    DEFAULT_TRANSPORT_PATH.to_string()
}

fn default_routing_prefix() -> String {
    crate::dcc::DEFAULT_ROUTING_PREFIX.to_string()
}

fn default_aggregation_size() -> usize {
    crate::entity::DEFAULT_AGGREGATION_SIZE
}

// =============================================================================
// Agent Configuration
// =============================================================================

/// Agent identity and behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Name of the root edge system.
    pub edge_system: String,

    /// Include edge system and device names in payloads (default: true).
    #[serde(default = "default_true")]
    pub enclose_metadata: bool,

    /// Graceful shutdown timeout (default: "5s").
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Transport implementation selector.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TransportKind {
    /// Append JSON envelopes to a file or stdout.
    #[default]
    Jsonl,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,

    /// Sink path for `jsonl` (default: "-" for stdout).
    #[serde(default = "default_transport_path")]
    pub path: String,

    /// Fixed default destination; derived from the edge system when absent.
    #[serde(default)]
    pub destination: Option<Destination>,

    /// Prefix of derived destinations (default: "edgelink").
    #[serde(default = "default_routing_prefix")]
    pub routing_prefix: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            path: default_transport_path(),
            destination: None,
            routing_prefix: default_routing_prefix(),
        }
    }
}

// =============================================================================
// Entity Configuration
// =============================================================================

/// Device and the metrics attached to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,

    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
}

/// Metric definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    pub name: String,

    /// Physical unit (e.g., "degC", "kilometer").
    #[serde(default)]
    pub unit: Option<String>,

    /// Sampling interval in whole seconds (e.g., "10s", "1m"); "0s" samples on demand.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Samples per payload (default: 1).
    #[serde(default = "default_aggregation_size")]
    pub aggregation_size: usize,

    pub source: SourceConfig,
}

impl MetricConfig {
    /// Validate this metric definition.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` naming the metric.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid =
            |msg: String| ConfigError::ValidationError(format!("metric '{}': {}", self.name, msg));

        if self.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "metric name cannot be empty".to_string(),
            ));
        }
        if self.aggregation_size == 0 {
            return Err(invalid("aggregation_size must be positive".to_string()));
        }
        if let Some(unit) = &self.unit
            && unit.trim().is_empty()
        {
            return Err(invalid("unit cannot be empty".to_string()));
        }
        interval_seconds(self.interval).map_err(invalid)?;
        self.source.validate().map_err(invalid)?;
        Ok(())
    }

    /// Convert to a metric entity.
    pub fn to_entity(&self) -> Result<Entity, ConfigError> {
        self.validate()?;
        let seconds = interval_seconds(self.interval).map_err(ConfigError::ValidationError)?;

        let mut spec = MetricSpec::new(self.source.sampling_fn())
            .with_interval_seconds(seconds)
            .with_aggregation_size(self.aggregation_size);
        if let Some(unit) = &self.unit {
            spec = spec.with_unit(unit);
        }
        Ok(Entity::metric(&self.name, spec))
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub agent: AgentConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Metrics attached directly to the edge system.
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// `${VAR}` and `${VAR:-default}` references are expanded before parsing.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(&expand_env_vars(content))?;
        config.validate()?;
        Ok(config)
    }

    /// Every configured metric, edge-system metrics first.
    pub fn all_metrics(&self) -> impl Iterator<Item = &MetricConfig> {
        self.metrics
            .iter()
            .chain(self.devices.iter().flat_map(|d| d.metrics.iter()))
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.edge_system.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "agent edge_system cannot be empty".to_string(),
            ));
        }

        // Validate transport
        if self.transport.kind == TransportKind::Jsonl && self.transport.path.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "jsonl transport path cannot be empty".to_string(),
            ));
        }
        if self.transport.routing_prefix.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "transport routing_prefix cannot be empty".to_string(),
            ));
        }
        if let Some(dest) = &self.transport.destination
            && (dest.exchange.trim().is_empty() || dest.routing_key.trim().is_empty())
        {
            return Err(ConfigError::ValidationError(
                "transport destination needs an exchange and a routing_key".to_string(),
            ));
        }

        // Validate devices
        let mut device_names = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "device name cannot be empty".to_string(),
                ));
            }
            if !device_names.insert(&device.name) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate device name: '{}'",
                    device.name
                )));
            }
        }

        // Metric names are unique per registry, so across all parents
        let mut metric_names = HashSet::new();
        for metric in self.all_metrics() {
            metric.validate()?;
            if !metric_names.insert(&metric.name) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate metric name: '{}'",
                    metric.name
                )));
            }
        }

        Ok(())
    }
}
