//! Flush path: lineage lookup, formatting and send.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::entity::{EntityId, EntityRegistry, RegisteredEntity, Sample};
use crate::pipeline::PayloadFormatter;
use crate::transport::{Destination, DispatchPort, MessageProperties};

/// Result of one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The payload was accepted by the transport.
    Sent { samples: usize },
    /// Nothing to send.
    Empty,
    /// The flush was dropped; the reason has been logged.
    Dropped(String),
}

/// Sends formatted payloads through a [`DispatchPort`].
///
/// Destinations resolve per metric: a route set with [`Dispatcher::set_route`]
/// wins over the default destination.
pub struct Dispatcher {
    registry: Arc<EntityRegistry>,
    port: Arc<dyn DispatchPort>,
    formatter: PayloadFormatter,
    enclose_metadata: bool,
    default_destination: RwLock<Destination>,
    routes: RwLock<HashMap<EntityId, Destination>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<EntityRegistry>,
        port: Arc<dyn DispatchPort>,
        formatter: PayloadFormatter,
        enclose_metadata: bool,
        default_destination: Destination,
    ) -> Self {
        Self {
            registry,
            port,
            formatter,
            enclose_metadata,
            default_destination: RwLock::new(default_destination),
            routes: RwLock::new(HashMap::new()),
        }
    }

    pub fn enclose_metadata(&self) -> bool {
        self.enclose_metadata
    }

    pub async fn default_destination(&self) -> Destination {
        self.default_destination.read().await.clone()
    }

    pub async fn set_default_destination(&self, destination: Destination) {
        tracing::debug!(destination = %destination, "Default destination updated");
        *self.default_destination.write().await = destination;
    }

    /// Route one metric to `destination`.
    pub async fn set_route(&self, metric: EntityId, destination: Destination) {
        self.routes.write().await.insert(metric, destination);
    }

    pub async fn remove_route(&self, metric: EntityId) -> Option<Destination> {
        self.routes.write().await.remove(&metric)
    }

    /// Destination a flush of `metric` is sent to.
    pub async fn destination_for(&self, metric: EntityId) -> Destination {
        if let Some(route) = self.routes.read().await.get(&metric) {
            return route.clone();
        }
        self.default_destination().await
    }

    /// Format and send `samples` of `metric`.
    ///
    /// Never fails: transport and lookup errors are logged and reported as
    /// [`FlushOutcome::Dropped`].
    pub async fn flush(&self, metric: &RegisteredEntity, samples: &[Sample]) -> FlushOutcome {
        if samples.is_empty() {
            return FlushOutcome::Empty;
        }

        let lineage = match self.registry.lineage(metric).await {
            Ok(lineage) => lineage,
            Err(e) => {
                tracing::warn!(metric = %metric.name(), error = %e, "Flush dropped");
                return FlushOutcome::Dropped(e.to_string());
            }
        };

        let Some(payload) =
            self.formatter
                .format(metric, &lineage, samples, self.enclose_metadata)
        else {
            return FlushOutcome::Empty;
        };

        let body = match payload.to_json() {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(metric = %metric.name(), error = %e, "Failed to encode payload");
                return FlushOutcome::Dropped(e.to_string());
            }
        };

        let destination = self.destination_for(metric.id()).await;
        let properties = MessageProperties::json();
        match self.port.send(&destination, &body, Some(&properties)).await {
            Ok(()) => {
                tracing::debug!(
                    metric = %metric.name(),
                    destination = %destination,
                    samples = samples.len(),
                    "Payload sent"
                );
                FlushOutcome::Sent {
                    samples: samples.len(),
                }
            }
            Err(e) => {
                tracing::warn!(
                    metric = %metric.name(),
                    destination = %destination,
                    transport = %self.port.name(),
                    error = %e,
                    "Flush dropped"
                );
                FlushOutcome::Dropped(e.to_string())
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("transport", &self.port.name())
            .field("enclose_metadata", &self.enclose_metadata)
            .finish_non_exhaustive()
    }
}
