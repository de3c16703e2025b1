//! Data-Center Component
//!
//! [`DataCenterComponent`] ties an [`EntityRegistry`] to one transport. It
//! mirrors the registry mutations, owns the job scheduler that drives every
//! [`SampleScheduler`] and resolves where each metric's payloads go.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use edgelink::{DataCenterComponent, Entity, MemoryTransport, MetricSpec, SamplingFn};
//!
//! # async fn run() -> Result<(), edgelink::DccError> {
//! let dcc = DataCenterComponent::builder(Arc::new(MemoryTransport::new()))
//!     .enclose_metadata(true)
//!     .build()
//!     .await?;
//!
//! let gw = dcc.register(Entity::edge_system("Gw")).await?;
//! let temp = dcc
//!     .register(Entity::metric(
//!         "Temp",
//!         MetricSpec::new(SamplingFn::infallible(|| 21.5))
//!             .with_interval_seconds(10)
//!             .with_unit("degC"),
//!     ))
//!     .await?;
//! dcc.create_relationship(&gw, &temp).await?;
//! dcc.start_collecting(&temp).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::JobScheduler;
use uuid::Uuid;

use crate::entity::{
    CollectionControl, Entity, EntityId, EntityRegistry, EntityType, RegisteredEntity,
    RegistryError, SamplingError,
};
use crate::pipeline::{
    Dispatcher, PayloadFormatter, SampleScheduler, SchedulerError, StatsSnapshot,
};
use crate::transport::{
    Destination, DispatchPort, MessageCallback, Subscription, TransportError,
    validate_subscriptions,
};
use crate::units::UnitParser;

/// Default prefix of auto-generated destinations.
pub const DEFAULT_ROUTING_PREFIX: &str = "edgelink";
/// Default timeout for graceful shutdown (5 seconds).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced by [`DataCenterComponent`].
#[derive(Debug, Error)]
pub enum DccError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Sampling(#[from] SamplingError),

    /// The metric has no active collection.
    #[error("metric '{0}' is not collecting")]
    NotCollecting(String),
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`DataCenterComponent`].
pub struct DccBuilder {
    port: Arc<dyn DispatchPort>,
    registry: Option<Arc<EntityRegistry>>,
    enclose_metadata: bool,
    destination: Option<Destination>,
    routing_prefix: String,
    unit_parser: Option<Arc<dyn UnitParser>>,
}

impl DccBuilder {
    pub fn new(port: Arc<dyn DispatchPort>) -> Self {
        Self {
            port,
            registry: None,
            enclose_metadata: true,
            destination: None,
            routing_prefix: DEFAULT_ROUTING_PREFIX.to_string(),
            unit_parser: None,
        }
    }

    /// Share an existing registry instead of creating one.
    pub fn registry(mut self, registry: Arc<EntityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Include edge system and device names in payloads (default `true`).
    pub fn enclose_metadata(mut self, enclose: bool) -> Self {
        self.enclose_metadata = enclose;
        self
    }

    /// Fixed default destination. Without one, the destination is derived
    /// from the first registered edge system.
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn routing_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.routing_prefix = prefix.into();
        self
    }

    pub fn unit_parser(mut self, parser: Arc<dyn UnitParser>) -> Self {
        self.unit_parser = Some(parser);
        self
    }

    /// Connect the transport and start the job scheduler.
    ///
    /// # Errors
    /// Returns the transport error if connecting fails, or a scheduler error.
    pub async fn build(self) -> Result<DataCenterComponent, DccError> {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(EntityRegistry::new()));
        let formatter = match self.unit_parser {
            Some(parser) => PayloadFormatter::with_unit_parser(parser),
            None => PayloadFormatter::new(),
        };

        let fixed_destination = self.destination.is_some();
        let destination = self.destination.unwrap_or_else(|| {
            Destination::new(
                format!("{}.exchange", self.routing_prefix),
                format!("{}.request", self.routing_prefix),
            )
        });

        self.port.connect().await?;

        let jobs = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;
        jobs.start()
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&self.port),
            formatter,
            self.enclose_metadata,
            destination.clone(),
        ));

        tracing::info!(
            transport = %self.port.name(),
            destination = %destination,
            enclose_metadata = self.enclose_metadata,
            "Data-center component ready"
        );

        Ok(DataCenterComponent {
            registry,
            port: self.port,
            dispatcher,
            jobs,
            collectors: RwLock::new(HashMap::new()),
            starting: Mutex::new(()),
            local_uuids: RwLock::new(HashMap::new()),
            routing_prefix: self.routing_prefix,
            fixed_destination,
        })
    }
}

impl std::fmt::Debug for DccBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DccBuilder")
            .field("transport", &self.port.name())
            .field("enclose_metadata", &self.enclose_metadata)
            .field("destination", &self.destination)
            .field("routing_prefix", &self.routing_prefix)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Component
// ============================================================================

/// One transport bound to an entity registry.
pub struct DataCenterComponent {
    registry: Arc<EntityRegistry>,
    port: Arc<dyn DispatchPort>,
    dispatcher: Arc<Dispatcher>,
    jobs: JobScheduler,
    collectors: RwLock<HashMap<EntityId, Arc<SampleScheduler>>>,
    /// Serializes `start_collecting`.
    starting: Mutex<()>,
    local_uuids: RwLock<HashMap<EntityId, Uuid>>,
    routing_prefix: String,
    fixed_destination: bool,
}

impl DataCenterComponent {
    pub fn builder(port: Arc<dyn DispatchPort>) -> DccBuilder {
        DccBuilder::new(port)
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn DispatchPort> {
        &self.port
    }

    pub fn enclose_metadata(&self) -> bool {
        self.dispatcher.enclose_metadata()
    }

    /// Register an entity.
    ///
    /// Edge systems get a name-based local UUID; the first one also fixes the
    /// default destination unless one was configured.
    pub async fn register(&self, entity: Entity) -> Result<RegisteredEntity, DccError> {
        let registered = self.registry.register(entity).await?;

        if registered.entity_type() == EntityType::EdgeSystem {
            let local_uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, registered.name().as_bytes());
            let first = {
                let mut uuids = self.local_uuids.write().await;
                uuids.insert(registered.id(), local_uuid);
                uuids.len() == 1
            };
            if first && !self.fixed_destination {
                self.dispatcher
                    .set_default_destination(Destination::new(
                        format!("{}.exchange", self.routing_prefix),
                        format!("{}.{}.request", self.routing_prefix, local_uuid),
                    ))
                    .await;
            }
            tracing::info!(
                edge_system = %registered.name(),
                local_uuid = %local_uuid,
                "Edge system registered"
            );
        }
        Ok(registered)
    }

    pub async fn create_relationship(
        &self,
        parent: &RegisteredEntity,
        child: &RegisteredEntity,
    ) -> Result<(), DccError> {
        self.registry.create_relationship(parent, child).await?;
        Ok(())
    }

    /// Unregister `entity` and its subtree.
    ///
    /// Collections of removed metrics are stopped and their partial queues
    /// discarded before this returns.
    pub async fn unregister(&self, entity: &RegisteredEntity) -> Result<(), DccError> {
        let removed = self.registry.unregister(entity).await?;

        let mut collectors = self.collectors.write().await;
        let mut uuids = self.local_uuids.write().await;
        for handle in &removed {
            collectors.remove(&handle.id());
            uuids.remove(&handle.id());
            self.dispatcher.remove_route(handle.id()).await;
        }
        Ok(())
    }

    pub async fn get_entity_hierarchy(
        &self,
        entity: &RegisteredEntity,
    ) -> Result<Vec<String>, DccError> {
        Ok(self.registry.get_entity_hierarchy(entity).await?)
    }

    /// Start collecting `metric`.
    ///
    /// Periodic metrics get a job whose first tick fires after one interval.
    /// On-demand metrics only sample through [`sample_now`](Self::sample_now).
    /// Calling this for a metric that is already collecting is a no-op.
    pub async fn start_collecting(&self, metric: &RegisteredEntity) -> Result<(), DccError> {
        if !self.registry.contains(metric).await {
            return Err(RegistryError::NotFound(metric.name().to_string()).into());
        }

        let _starting = self.starting.lock().await;
        if self.is_collecting(metric).await {
            tracing::warn!(metric = %metric.name(), "Metric is already collecting");
            return Ok(());
        }

        let scheduler = SampleScheduler::new(metric.clone(), Arc::clone(&self.dispatcher))?;
        let control: Arc<dyn CollectionControl> = scheduler.clone();
        if let Some(previous) = self
            .registry
            .attach_collection(metric, Arc::clone(&control))
            .await?
        {
            previous.stop().await;
        }
        if let Err(e) = scheduler.start_collecting(&self.jobs).await {
            tracing::error!(metric = %metric.name(), error = %e, "Failed to start collection");
            self.registry.detach_collection(metric, &control).await;
            return Err(e.into());
        }

        // An unregister that raced the start has already stopped it.
        let mut collectors = self.collectors.write().await;
        if !scheduler.is_collecting() {
            return Err(SchedulerError::Stopped(metric.name().to_string()).into());
        }
        collectors.insert(metric.id(), scheduler);
        Ok(())
    }

    /// Stop collecting `metric`, discarding any partial queue.
    pub async fn stop_collecting(&self, metric: &RegisteredEntity) -> Result<(), DccError> {
        let scheduler = self
            .collectors
            .write()
            .await
            .remove(&metric.id())
            .filter(|s| s.metric() == metric)
            .ok_or_else(|| DccError::NotCollecting(metric.name().to_string()))?;

        let control: Arc<dyn CollectionControl> = scheduler.clone();
        self.registry.detach_collection(metric, &control).await;
        scheduler.stop_collecting().await;
        Ok(())
    }

    /// Take one sample of a collecting metric now.
    pub async fn sample_now(&self, metric: &RegisteredEntity) -> Result<(), DccError> {
        let scheduler = self.collector(metric).await?;
        scheduler.sample_now().await?;
        Ok(())
    }

    pub async fn is_collecting(&self, metric: &RegisteredEntity) -> bool {
        self.collector(metric)
            .await
            .is_ok_and(|s| s.is_collecting())
    }

    /// Counters of a collecting metric.
    pub async fn collection_stats(&self, metric: &RegisteredEntity) -> Option<StatsSnapshot> {
        self.collector(metric).await.ok().map(|s| s.stats())
    }

    /// Route the payloads of `metric` to `destination`.
    pub async fn set_destination(
        &self,
        metric: &RegisteredEntity,
        destination: Destination,
    ) -> Result<(), DccError> {
        if !self.registry.contains(metric).await {
            return Err(RegistryError::NotFound(metric.name().to_string()).into());
        }
        if metric.entity_type() != EntityType::Metric {
            return Err(RegistryError::InvalidEntity(format!(
                "'{}' is not a metric",
                metric.name()
            ))
            .into());
        }
        tracing::info!(metric = %metric.name(), destination = %destination, "Destination set");
        self.dispatcher.set_route(metric.id(), destination).await;
        Ok(())
    }

    pub async fn destination_for(&self, metric: &RegisteredEntity) -> Destination {
        self.dispatcher.destination_for(metric.id()).await
    }

    /// Name-based UUID of a registered edge system.
    pub async fn local_uuid(&self, edge_system: &RegisteredEntity) -> Option<Uuid> {
        if !self.registry.contains(edge_system).await {
            return None;
        }
        self.local_uuids.read().await.get(&edge_system.id()).copied()
    }

    /// Consume inbound messages.
    ///
    /// # Errors
    /// Rejects empty subscription lists and subscriptions without routing
    /// keys; otherwise returns the transport's error.
    pub async fn consume(
        &self,
        subscriptions: Vec<Subscription>,
        callback: MessageCallback,
    ) -> Result<(), DccError> {
        validate_subscriptions(&subscriptions)?;
        let count = subscriptions.len();
        self.port.receive(subscriptions, callback).await?;
        tracing::info!(transport = %self.port.name(), subscriptions = count, "Consumer started");
        Ok(())
    }

    pub async fn stop_consumers(&self) -> Result<(), DccError> {
        self.port.stop_receiving().await?;
        Ok(())
    }

    /// Stop every collection, shut the job scheduler down and disconnect.
    ///
    /// A scheduler shutdown that exceeds `timeout` is logged and the
    /// transport is disconnected anyway.
    pub async fn shutdown(self, timeout: Duration) -> Result<(), DccError> {
        let collectors: Vec<_> = self.collectors.write().await.drain().collect();
        let count = collectors.len();
        for (_, scheduler) in collectors {
            let control: Arc<dyn CollectionControl> = scheduler.clone();
            self.registry
                .detach_collection(scheduler.metric(), &control)
                .await;
            scheduler.stop_collecting().await;
        }

        let mut jobs = self.jobs;
        match tokio::time::timeout(timeout, jobs.shutdown()).await {
            Ok(Ok(())) => tracing::info!(collectors = count, "Job scheduler shutdown complete"),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Job scheduler shutdown failed");
            }
            Err(_) => tracing::warn!("Job scheduler shutdown timed out"),
        }

        if let Err(e) = self.port.stop_receiving().await {
            tracing::warn!(error = %e, "Failed to stop consumers");
        }
        self.port.disconnect().await?;
        tracing::info!(transport = %self.port.name(), "Data-center component shut down");
        Ok(())
    }

    // --- Private helpers ---

    async fn collector(&self, metric: &RegisteredEntity) -> Result<Arc<SampleScheduler>, DccError> {
        self.collectors
            .read()
            .await
            .get(&metric.id())
            .filter(|s| s.metric() == metric)
            .cloned()
            .ok_or_else(|| DccError::NotCollecting(metric.name().to_string()))
    }
}

impl std::fmt::Debug for DataCenterComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCenterComponent")
            .field("transport", &self.port.name())
            .field(
                "collectors",
                &self.collectors.try_read().map(|c| c.len()).unwrap_or(0),
            )
            .field("routing_prefix", &self.routing_prefix)
            .finish_non_exhaustive()
    }
}
