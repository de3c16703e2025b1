//! Payload formatting.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entity::{EntityType, LineageEntry, RegisteredEntity, Sample};
use crate::units::{SiUnitParser, UnitParser};

/// Unit value used when a metric has no unit or its unit is unsupported.
pub const NULL_UNIT: &str = "null";

/// One sampled value in a payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub value: f64,
    /// Milliseconds since the Unix epoch (UTC).
    pub timestamp: i64,
}

/// Transport-agnostic payload for one flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_system_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    pub metric_name: String,
    pub unit: String,
    pub metric_data: Vec<DataPoint>,
}

impl Payload {
    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Builds payloads from buffered samples and hierarchy context.
#[derive(Clone)]
pub struct PayloadFormatter {
    units: Arc<dyn UnitParser>,
}

impl PayloadFormatter {
    /// Formatter resolving units with [`SiUnitParser`].
    pub fn new() -> Self {
        Self::with_unit_parser(Arc::new(SiUnitParser))
    }

    pub fn with_unit_parser(units: Arc<dyn UnitParser>) -> Self {
        Self { units }
    }

    /// Format buffered samples of `metric`.
    ///
    /// `lineage` is the root-to-leaf walk ending at `metric`. Returns `None`
    /// when there are no samples. An unsupported unit degrades to
    /// [`NULL_UNIT`].
    pub fn format(
        &self,
        metric: &RegisteredEntity,
        lineage: &[LineageEntry],
        samples: &[Sample],
        enclose_metadata: bool,
    ) -> Option<Payload> {
        if samples.is_empty() {
            return None;
        }

        let unit = metric
            .metric_spec()
            .and_then(|spec| spec.unit.as_deref())
            .map(|unit| self.resolve_unit(metric.name(), unit))
            .unwrap_or_else(|| NULL_UNIT.to_string());

        let (edge_system_name, device_name) = if enclose_metadata {
            ancestor_names(lineage)
        } else {
            (None, None)
        };

        Some(Payload {
            edge_system_name,
            device_name,
            metric_name: metric.name().to_string(),
            unit,
            metric_data: samples
                .iter()
                .map(|s| DataPoint {
                    value: s.value,
                    timestamp: s.timestamp,
                })
                .collect(),
        })
    }

    fn resolve_unit(&self, metric: &str, unit: &str) -> String {
        match self.units.parse(unit) {
            Ok(parsed) => parsed.normalized(),
            Err(e) => {
                tracing::warn!(metric = %metric, error = %e, "Unsupported unit, sending null");
                NULL_UNIT.to_string()
            }
        }
    }
}

impl Default for PayloadFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PayloadFormatter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadFormatter").finish_non_exhaustive()
    }
}

/// Root edge system name and immediate parent device name.
fn ancestor_names(lineage: &[LineageEntry]) -> (Option<String>, Option<String>) {
    // The last entry is the metric itself.
    let Some((_, ancestors)) = lineage.split_last() else {
        return (None, None);
    };

    let edge_system = ancestors
        .first()
        .filter(|e| e.entity_type == EntityType::EdgeSystem)
        .map(|e| e.name.clone());
    let device = ancestors
        .last()
        .filter(|e| e.entity_type == EntityType::Device)
        .map(|e| e.name.clone());
    (edge_system, device)
}
