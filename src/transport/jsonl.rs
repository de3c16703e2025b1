//! JSON-lines sink transport.
//!
//! Appends one envelope per send to a file, or to stdout when the path is
//! `-`. Outbound only.

use std::path::PathBuf;

use chrono::Utc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::transport::{
    Destination, DispatchPort, MessageCallback, MessageProperties, Subscription, TransportError,
};

/// Path that selects stdout.
pub const STDOUT_PATH: &str = "-";

type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// [`DispatchPort`] that writes JSON envelopes line by line.
pub struct JsonLinesTransport {
    path: PathBuf,
    sink: Mutex<Option<Sink>>,
}

impl JsonLinesTransport {
    /// Create a transport writing to `path` (`-` for stdout).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sink: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn is_stdout(&self) -> bool {
        self.path.as_os_str() == STDOUT_PATH
    }
}

impl std::fmt::Debug for JsonLinesTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesTransport")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl DispatchPort for JsonLinesTransport {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        if sink.is_some() {
            return Ok(());
        }

        let writer: Sink = if self.is_stdout() {
            Box::new(tokio::io::stdout())
        } else {
            if let Some(parent) = self.path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    TransportError::Unavailable(format!(
                        "failed to create directory '{}': {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| {
                    TransportError::Unavailable(format!(
                        "failed to open '{}': {}",
                        self.path.display(),
                        e
                    ))
                })?;
            Box::new(file)
        };

        *sink = Some(writer);
        tracing::info!(path = %self.path.display(), "JSON-lines transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(mut writer) = self.sink.lock().await.take() {
            writer
                .flush()
                .await
                .map_err(|e| TransportError::Protocol(format!("flush failed: {e}")))?;
            tracing::info!(path = %self.path.display(), "JSON-lines transport disconnected");
        }
        Ok(())
    }

    async fn send(
        &self,
        destination: &Destination,
        payload: &[u8],
        properties: Option<&MessageProperties>,
    ) -> Result<(), TransportError> {
        let body = serde_json::from_slice::<serde_json::Value>(payload).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(payload).into_owned())
        });
        let envelope = serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "exchange": destination.exchange,
            "routing_key": destination.routing_key,
            "properties": properties,
            "payload": body,
        });
        let mut line = serde_json::to_vec(&envelope)
            .map_err(|e| TransportError::Protocol(format!("failed to encode envelope: {e}")))?;
        line.push(b'\n');

        let mut sink = self.sink.lock().await;
        let writer = sink.as_mut().ok_or_else(|| {
            TransportError::Unavailable("JSON-lines transport is not connected".to_string())
        })?;
        writer
            .write_all(&line)
            .await
            .map_err(|e| TransportError::Unavailable(format!("write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::Unavailable(format!("flush failed: {e}")))?;
        Ok(())
    }

    async fn receive(
        &self,
        _subscriptions: Vec<Subscription>,
        _callback: MessageCallback,
    ) -> Result<(), TransportError> {
        Err(TransportError::Protocol(
            "the JSON-lines transport does not consume messages".to_string(),
        ))
    }

    async fn stop_receiving(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_appends_envelopes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("payloads.jsonl");
        let transport = JsonLinesTransport::new(&path);
        let dest = Destination::new("edgelink.exchange", "gw.request");

        assert!(matches!(
            transport.send(&dest, b"{}", None).await,
            Err(TransportError::Unavailable(_))
        ));

        transport.connect().await.unwrap();
        transport
            .send(&dest, br#"{"metric_name":"Temp"}"#, Some(&MessageProperties::json()))
            .await
            .unwrap();
        transport.send(&dest, b"not json", None).await.unwrap();
        transport.disconnect().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["exchange"], "edgelink.exchange");
        assert_eq!(lines[0]["routing_key"], "gw.request");
        assert_eq!(lines[0]["payload"]["metric_name"], "Temp");
        assert_eq!(lines[0]["properties"]["content_type"], "application/json");
        assert_eq!(lines[1]["payload"], "not json");
    }

    #[tokio::test]
    async fn test_receive_not_supported() {
        let transport = JsonLinesTransport::new(STDOUT_PATH);
        let callback: MessageCallback = Arc::new(|_: crate::transport::InboundMessage| {});
        let err = transport
            .receive(vec![Subscription::new("ex", ["k"])], callback)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }
}
