//! Pipeline Layer
//!
//! Turns sampled values into dispatched payloads. Each collecting metric owns
//! a [`SampleScheduler`] job; when its queue reaches the aggregation size the
//! same job formats the batch and hands it to the [`Dispatcher`].
//!
//! # Architecture
//!
//! - [`SampleScheduler`]: Per-metric periodic sampling job with skip-on-overlap ticks
//! - [`PayloadFormatter`]: Builds the transport-agnostic [`Payload`]
//! - [`Dispatcher`]: Resolves destinations and sends; failures are logged and dropped

mod dispatcher;
mod formatter;
mod scheduler;

pub use dispatcher::{Dispatcher, FlushOutcome};
pub use formatter::{DataPoint, NULL_UNIT, Payload, PayloadFormatter};
pub use scheduler::{CollectionStats, SampleScheduler, SchedulerError, StatsSnapshot};
