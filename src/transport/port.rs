//! Transport contract and shared types.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors a transport may report.
///
/// The flush path treats `Unavailable`, `Timeout` and `Protocol` uniformly:
/// the flush is logged and dropped. Reconnection and retry are the
/// transport's own concern.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Not currently connected.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The remote did not answer in time.
    #[error("transport timed out")]
    Timeout,

    /// The remote rejected the destination or message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A receive request carried no usable subscriptions.
    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),
}

/// Where a payload is published.
///
/// `exchange` / `routing_key` map onto topic / node for transports that use
/// that vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub exchange: String,
    pub routing_key: String,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}

/// Optional per-message properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    /// Properties for a JSON body.
    pub fn json() -> Self {
        Self {
            content_type: Some("application/json".to_string()),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Inbound subscription: an exchange plus the routing keys to consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub exchange: String,
    pub routing_keys: Vec<String>,
}

impl Subscription {
    pub fn new<I, S>(exchange: impl Into<String>, routing_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exchange: exchange.into(),
            routing_keys: routing_keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether a message published to `destination` matches this subscription.
    pub fn matches(&self, destination: &Destination) -> bool {
        self.exchange == destination.exchange
            && self
                .routing_keys
                .iter()
                .any(|key| key == "#" || *key == destination.routing_key)
    }
}

/// A message delivered to a consume callback.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub destination: Destination,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Consume callback.
///
/// Invoked on a transport-owned task. It must not assume exclusive access to
/// the entity registry.
pub type MessageCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Reject empty subscription lists and subscriptions without routing keys.
///
/// # Errors
/// Returns `TransportError::InvalidSubscription` describing the first problem.
pub fn validate_subscriptions(subscriptions: &[Subscription]) -> Result<(), TransportError> {
    if subscriptions.is_empty() {
        return Err(TransportError::InvalidSubscription(
            "at least one subscription is required".to_string(),
        ));
    }
    for subscription in subscriptions {
        if subscription.exchange.trim().is_empty() {
            return Err(TransportError::InvalidSubscription(
                "exchange must not be empty".to_string(),
            ));
        }
        if subscription.routing_keys.is_empty() {
            return Err(TransportError::InvalidSubscription(format!(
                "subscription to '{}' has no routing keys",
                subscription.exchange
            )));
        }
    }
    Ok(())
}

/// Capability interface implemented by every data-center transport.
///
/// Transport selection is a build- or configuration-time choice of
/// implementation.
#[async_trait::async_trait]
pub trait DispatchPort: Send + Sync + 'static {
    /// Short transport name for logs (e.g. `"memory"`, `"jsonl"`).
    fn name(&self) -> &str;

    /// Establish the connection.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Tear down the connection. Idempotent.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Publish one payload.
    ///
    /// Timeout policy is entirely the transport's.
    async fn send(
        &self,
        destination: &Destination,
        payload: &[u8],
        properties: Option<&MessageProperties>,
    ) -> Result<(), TransportError>;

    /// Start consuming the given subscriptions.
    async fn receive(
        &self,
        subscriptions: Vec<Subscription>,
        callback: MessageCallback,
    ) -> Result<(), TransportError>;

    /// Stop every consumer started by `receive`.
    async fn stop_receiving(&self) -> Result<(), TransportError>;
}
