//! In-process loopback transport.
//!
//! Records every send, delivers inbound messages to matching consumers on
//! spawned tasks, and can be told to fail upcoming sends. Used by tests and
//! by agents that only need a local sink.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};

use crate::transport::{
    Destination, DispatchPort, InboundMessage, MessageCallback, MessageProperties, Subscription,
    TransportError, validate_subscriptions,
};

/// A payload accepted by [`MemoryTransport::send`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub ts: DateTime<Utc>,
    pub destination: Destination,
    pub payload: Vec<u8>,
    pub properties: Option<MessageProperties>,
}

impl SentMessage {
    /// Decode the payload as JSON.
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

struct Consumer {
    subscriptions: Vec<Subscription>,
    callback: MessageCallback,
}

/// Loopback [`DispatchPort`] implementation.
pub struct MemoryTransport {
    connected: AtomicBool,
    sent: Mutex<Vec<SentMessage>>,
    failures: Mutex<VecDeque<TransportError>>,
    consumers: Mutex<Vec<Consumer>>,
    sent_count: watch::Sender<usize>,
}

impl MemoryTransport {
    /// Create a disconnected transport.
    pub fn new() -> Self {
        let (sent_count, _) = watch::channel(0);
        Self {
            connected: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            consumers: Mutex::new(Vec::new()),
            sent_count,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Snapshot of every accepted send, oldest first.
    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_len(&self) -> usize {
        self.sent.lock().await.len()
    }

    /// Make the next send fail with `error`. Queued failures apply in order.
    pub async fn fail_next_send(&self, error: TransportError) {
        self.failures.lock().await.push_back(error);
    }

    /// Wait until at least `count` sends were accepted.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_for_sends(&self, count: usize, timeout: Duration) -> bool {
        let mut rx = self.sent_count.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n >= count))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Deliver an inbound message to every consumer subscribed to `destination`.
    ///
    /// Callbacks run on spawned tasks. Returns the number of consumers reached.
    pub async fn deliver(
        &self,
        destination: Destination,
        body: impl Into<Vec<u8>>,
        properties: MessageProperties,
    ) -> usize {
        let message = InboundMessage {
            destination,
            body: body.into(),
            properties,
        };

        let consumers = self.consumers.lock().await;
        let mut reached = 0;
        for consumer in consumers.iter() {
            if consumer
                .subscriptions
                .iter()
                .any(|s| s.matches(&message.destination))
            {
                let callback = consumer.callback.clone();
                let message = message.clone();
                tokio::spawn(async move { callback(message) });
                reached += 1;
            }
        }
        tracing::debug!(destination = %message.destination, reached, "Inbound message delivered");
        reached
    }

    pub async fn consumer_count(&self) -> usize {
        self.consumers.lock().await.len()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("connected", &self.is_connected())
            .field("sent", &*self.sent_count.borrow())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl DispatchPort for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!("Memory transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.consumers.lock().await.clear();
        tracing::debug!("Memory transport disconnected");
        Ok(())
    }

    async fn send(
        &self,
        destination: &Destination,
        payload: &[u8],
        properties: Option<&MessageProperties>,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Unavailable(
                "memory transport is not connected".to_string(),
            ));
        }
        if let Some(error) = self.failures.lock().await.pop_front() {
            return Err(error);
        }

        let mut sent = self.sent.lock().await;
        sent.push(SentMessage {
            ts: Utc::now(),
            destination: destination.clone(),
            payload: payload.to_vec(),
            properties: properties.cloned(),
        });
        self.sent_count.send_replace(sent.len());
        Ok(())
    }

    async fn receive(
        &self,
        subscriptions: Vec<Subscription>,
        callback: MessageCallback,
    ) -> Result<(), TransportError> {
        validate_subscriptions(&subscriptions)?;
        if !self.is_connected() {
            return Err(TransportError::Unavailable(
                "memory transport is not connected".to_string(),
            ));
        }
        self.consumers.lock().await.push(Consumer {
            subscriptions,
            callback,
        });
        Ok(())
    }

    async fn stop_receiving(&self) -> Result<(), TransportError> {
        self.consumers.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_send_requires_connection() {
        let transport = MemoryTransport::new();
        let dest = Destination::new("ex", "key");

        let err = transport.send(&dest, b"{}", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)));

        transport.connect().await.unwrap();
        transport.send(&dest, b"{}", None).await.unwrap();
        assert_eq!(transport.sent_len().await, 1);
        assert!(transport.wait_for_sends(1, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_injected_failures_apply_in_order() {
        let transport = MemoryTransport::new();
        transport.connect().await.unwrap();
        transport.fail_next_send(TransportError::Timeout).await;
        transport
            .fail_next_send(TransportError::Protocol("rejected".to_string()))
            .await;
        let dest = Destination::new("ex", "key");

        assert_eq!(
            transport.send(&dest, b"1", None).await,
            Err(TransportError::Timeout)
        );
        assert!(matches!(
            transport.send(&dest, b"2", None).await,
            Err(TransportError::Protocol(_))
        ));
        transport.send(&dest, b"3", None).await.unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, b"3");
    }

    #[tokio::test]
    async fn test_receive_and_deliver() {
        let transport = MemoryTransport::new();
        transport.connect().await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let callback: MessageCallback = Arc::new(move |msg: InboundMessage| {
            assert_eq!(msg.body, b"ping");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        transport
            .receive(vec![Subscription::new("ex", ["cmd"])], callback)
            .await
            .unwrap();

        let reached = transport
            .deliver(
                Destination::new("ex", "cmd"),
                "ping",
                MessageProperties::default(),
            )
            .await;
        assert_eq!(reached, 1);
        let missed = transport
            .deliver(
                Destination::new("ex", "other"),
                "ping",
                MessageProperties::default(),
            )
            .await;
        assert_eq!(missed, 0);

        for _ in 0..50 {
            if hits.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        transport.stop_receiving().await.unwrap();
        assert_eq!(transport.consumer_count().await, 0);
    }

    #[tokio::test]
    async fn test_receive_rejects_empty_subscriptions() {
        let transport = MemoryTransport::new();
        transport.connect().await.unwrap();
        let callback: MessageCallback = Arc::new(|_: InboundMessage| {});
        let err = transport.receive(vec![], callback).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidSubscription(_)));
    }
}
