//! Configuration module for the edgelink agent.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Agent settings (edge system name, metadata enclosure, shutdown timeout)
//! - Transport settings (sink kind and path, destination, routing prefix)
//! - Metric definitions attached to the edge system or to devices

mod app;
mod source;
mod validation;

pub use app::{
    AgentConfig, AppConfig, DeviceConfig, MetricConfig, TransportConfig, TransportKind,
};
pub use source::SourceConfig;
pub use validation::{ConfigError, expand_env_vars};

// Re-export constants
pub use app::{DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_TRANSPORT_PATH};
