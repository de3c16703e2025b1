//! Entity Layer
//!
//! Describes the things being monitored and the live hierarchy they form.
//!
//! # Architecture
//!
//! - [`Entity`]: Immutable description of an edge system, device or metric
//! - [`EntityRegistry`]: Owns the registered hierarchy and validates relationships
//! - [`RegisteredEntity`]: Cheap handle to an entity inside one registry
//!
//! # Example
//!
//! ```rust,no_run
//! use edgelink::{Entity, EntityRegistry, MetricSpec, SamplingFn};
//!
//! # async fn run() -> Result<(), edgelink::RegistryError> {
//! let registry = EntityRegistry::new();
//! let gateway = registry.register(Entity::edge_system("Gw")).await?;
//! let temp = Entity::metric(
//!     "Temp",
//!     MetricSpec::new(SamplingFn::infallible(|| 21.5))
//!         .with_interval_seconds(10)
//!         .with_unit("degC"),
//! );
//! let temp = registry.register(temp).await?;
//! registry.create_relationship(&gateway, &temp).await?;
//! assert_eq!(registry.get_entity_hierarchy(&temp).await?, vec!["Gw", "Temp"]);
//! # Ok(())
//! # }
//! ```

mod error;
mod registry;
mod types;

pub use error::RegistryError;
pub use registry::{CollectionControl, EntityId, EntityRegistry, LineageEntry, RegisteredEntity};
pub use types::{
    DEFAULT_AGGREGATION_SIZE, Entity, EntitySpec, EntityType, MetricSpec, Sample, SamplingError,
    SamplingFn,
};
