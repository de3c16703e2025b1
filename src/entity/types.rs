//! Core entity types.
//!
//! - [`Entity`]: Named, immutable description of a monitored thing
//! - [`EntityType`]: Tag driving relationship validation
//! - [`MetricSpec`]: Sampling settings carried only by metrics
//! - [`Sample`]: One `(timestamp, value)` pair produced by a sampling function

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Number of samples buffered before a flush when none is configured.
pub const DEFAULT_AGGREGATION_SIZE: usize = 1;

/// Entity type classification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum EntityType {
    /// Gateway-class host running the agent.
    EdgeSystem,
    /// Physical or logical device attached to an edge system.
    Device,
    /// Sampled value stream.
    Metric,
}

impl EntityType {
    /// Whether entities of this type may have children.
    pub fn can_be_parent(self) -> bool {
        !matches!(self, Self::Metric)
    }
}

/// Error raised by a user sampling function.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("sampling function failed: {0}")]
pub struct SamplingError(String);

impl SamplingError {
    /// Create a sampling error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// Error message.
    pub fn message(&self) -> &str {
        &self.0
    }
}

type SamplingCallback = dyn Fn() -> Result<f64, SamplingError> + Send + Sync;

/// Zero-argument producer of a numeric value.
///
/// Invoked on a blocking thread by the scheduler, so it may perform slow I/O.
#[derive(Clone)]
pub struct SamplingFn(Arc<SamplingCallback>);

impl SamplingFn {
    /// Wrap a fallible sampling function.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> Result<f64, SamplingError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Wrap a sampling function that cannot fail.
    pub fn infallible<F>(f: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        Self(Arc::new(move || Ok(f())))
    }

    /// Invoke the function once.
    pub fn sample(&self) -> Result<f64, SamplingError> {
        (self.0)()
    }
}

impl fmt::Debug for SamplingFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplingFn").finish_non_exhaustive()
    }
}

/// Sampling settings of a metric.
#[derive(Debug, Clone)]
pub struct MetricSpec {
    /// Producer of values.
    pub sampling_function: SamplingFn,
    /// Seconds between samples; 0 means sample-on-demand only.
    pub interval_seconds: u64,
    /// Number of samples buffered before a flush.
    pub aggregation_size: usize,
    /// Physical unit descriptor (e.g. `"degC"`, `"kilometer"`).
    pub unit: Option<String>,
}

impl MetricSpec {
    /// Create an on-demand metric spec with an aggregation size of 1.
    pub fn new(sampling_function: SamplingFn) -> Self {
        Self {
            sampling_function,
            interval_seconds: 0,
            aggregation_size: DEFAULT_AGGREGATION_SIZE,
            unit: None,
        }
    }

    /// Set the sampling interval in seconds.
    pub fn with_interval_seconds(mut self, seconds: u64) -> Self {
        self.interval_seconds = seconds;
        self
    }

    /// Set the aggregation size.
    ///
    /// Clamped to a minimum of 1.
    pub fn with_aggregation_size(mut self, size: usize) -> Self {
        if size == 0 {
            tracing::warn!("Aggregation size must be positive. Using 1.");
            self.aggregation_size = 1;
        } else {
            self.aggregation_size = size;
        }
        self
    }

    /// Set the physical unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Whether this metric is sampled periodically.
    pub fn is_periodic(&self) -> bool {
        self.interval_seconds > 0
    }
}

/// Variant-specific part of an [`Entity`].
#[derive(Debug, Clone)]
pub enum EntitySpec {
    EdgeSystem,
    Device,
    Metric(MetricSpec),
}

/// Immutable description of a thing being monitored.
#[derive(Debug, Clone)]
pub struct Entity {
    name: String,
    spec: EntitySpec,
}

impl Entity {
    /// Describe an edge system.
    pub fn edge_system(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spec: EntitySpec::EdgeSystem,
        }
    }

    /// Describe a device.
    pub fn device(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spec: EntitySpec::Device,
        }
    }

    /// Describe a metric.
    pub fn metric(name: impl Into<String>, spec: MetricSpec) -> Self {
        Self {
            name: name.into(),
            spec: EntitySpec::Metric(spec),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entity_type(&self) -> EntityType {
        match self.spec {
            EntitySpec::EdgeSystem => EntityType::EdgeSystem,
            EntitySpec::Device => EntityType::Device,
            EntitySpec::Metric(_) => EntityType::Metric,
        }
    }

    pub fn spec(&self) -> &EntitySpec {
        &self.spec
    }

    /// Metric settings, if this entity is a metric.
    pub fn metric_spec(&self) -> Option<&MetricSpec> {
        match &self.spec {
            EntitySpec::Metric(spec) => Some(spec),
            _ => None,
        }
    }
}

/// One sampled value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Milliseconds since the Unix epoch (UTC).
    pub timestamp: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}
