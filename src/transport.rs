//! Transport Layer
//!
//! The boundary to data-center-side transports. Concrete wire protocols live
//! outside this crate and plug in by implementing [`DispatchPort`].
//!
//! # Components
//!
//! - [`DispatchPort`]: Capability interface every transport implements
//! - [`TransportError`]: Failure taxonomy shared by all transports
//! - [`MemoryTransport`]: In-process loopback transport
//! - [`JsonLinesTransport`]: Appends sends as JSON lines to a file or stdout

mod jsonl;
mod memory;
mod port;

pub use jsonl::JsonLinesTransport;
pub use memory::{MemoryTransport, SentMessage};
pub use port::{
    Destination, DispatchPort, InboundMessage, MessageCallback, MessageProperties, Subscription,
    TransportError, validate_subscriptions,
};
