//! Edgelink - Edge Telemetry Agent Library
//!
//! This crate provides the core of an edge monitoring agent: a hierarchy of
//! edge systems, devices and metrics, periodic sampling of every metric, and
//! dispatch of aggregated samples to a data center. It can be used as a
//! library, or run as a standalone binary with the `edgelink` executable.
//!
//! # Architecture
//!
//! - **Entity**: Edge systems, devices and metrics, and the registry validating their hierarchy
//! - **Pipeline**: Per-metric sampling jobs, payload formatting and the flush path
//! - **Transport**: The `DispatchPort` seam plus loopback and JSON-lines sinks
//! - **DCC**: Data-center component binding a registry to one transport
//! - **Units**: SI unit parsing for payload unit strings
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use edgelink::{DataCenterComponent, Entity, JsonLinesTransport, MetricSpec, SamplingFn};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dcc = DataCenterComponent::builder(Arc::new(JsonLinesTransport::new("-")))
//!         .build()
//!         .await?;
//!
//!     let gw = dcc.register(Entity::edge_system("Gw")).await?;
//!     let sensor = dcc.register(Entity::device("Sensor")).await?;
//!     let temp = dcc
//!         .register(Entity::metric(
//!             "Temp",
//!             MetricSpec::new(SamplingFn::infallible(|| 21.5))
//!                 .with_interval_seconds(1)
//!                 .with_aggregation_size(5)
//!                 .with_unit("degC"),
//!         ))
//!         .await?;
//!     dcc.create_relationship(&gw, &sensor).await?;
//!     dcc.create_relationship(&sensor, &temp).await?;
//!     dcc.start_collecting(&temp).await?;
//!
//!     tokio::time::sleep(Duration::from_secs(10)).await;
//!     dcc.shutdown(Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dcc;
pub mod entity;
pub mod pipeline;
pub mod transport;
pub mod units;

pub use dcc::{DataCenterComponent, DccBuilder, DccError};
pub use entity::{
    CollectionControl, Entity, EntityId, EntityRegistry, EntityType, LineageEntry, MetricSpec,
    RegisteredEntity, RegistryError, Sample, SamplingError, SamplingFn,
};
pub use pipeline::{
    CollectionStats, DataPoint, Dispatcher, FlushOutcome, Payload, PayloadFormatter,
    SampleScheduler, SchedulerError, StatsSnapshot,
};
pub use transport::{
    Destination, DispatchPort, InboundMessage, JsonLinesTransport, MemoryTransport,
    MessageCallback, MessageProperties, SentMessage, Subscription, TransportError,
};
pub use units::{ParsedUnit, SiUnitParser, UnitParser, UnsupportedUnitError};
