//! End-to-end tests for the edge agent.
//!
//! These tests drive a `DataCenterComponent` over the loopback transport and
//! check what reaches the data center.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use edgelink::config::AppConfig;
use edgelink::{
    DataCenterComponent, Destination, DispatchPort, Entity, InboundMessage, JsonLinesTransport,
    MemoryTransport, MessageCallback, MessageProperties, MetricSpec, SamplingError, SamplingFn,
    Subscription, TransportError,
};
use serde_json::json;

/// Build a DCC over a connected loopback transport.
async fn loopback() -> (Arc<MemoryTransport>, DataCenterComponent) {
    let transport = Arc::new(MemoryTransport::new());
    let dcc = DataCenterComponent::builder(transport.clone())
        .build()
        .await
        .unwrap();
    (transport, dcc)
}

fn counter() -> SamplingFn {
    let next = Arc::new(AtomicUsize::new(1));
    SamplingFn::infallible(move || next.fetch_add(1, Ordering::SeqCst) as f64)
}

fn values(body: &serde_json::Value) -> Vec<f64> {
    body["metric_data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["value"].as_f64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_gateway_sensor_temp_payload() {
    let (transport, dcc) = loopback().await;
    let gw = dcc.register(Entity::edge_system("Gw")).await.unwrap();
    let sensor = dcc.register(Entity::device("Sensor")).await.unwrap();
    let temp = dcc
        .register(Entity::metric(
            "Temp",
            MetricSpec::new(SamplingFn::infallible(|| 10.0)).with_unit("degC"),
        ))
        .await
        .unwrap();
    dcc.create_relationship(&gw, &sensor).await.unwrap();
    dcc.create_relationship(&sensor, &temp).await.unwrap();

    assert_eq!(
        dcc.get_entity_hierarchy(&temp).await.unwrap(),
        vec!["Gw", "Sensor", "Temp"]
    );

    dcc.start_collecting(&temp).await.unwrap();
    dcc.sample_now(&temp).await.unwrap();

    let sent = transport.sent().await;
    assert_eq!(sent.len(), 1);
    let mut body = sent[0].json().unwrap();
    let ts = body["metric_data"][0]["timestamp"].as_i64().unwrap();
    assert!(ts > 0);
    body["metric_data"][0]["timestamp"] = json!(0);
    assert_eq!(
        body,
        json!({
            "edge_system_name": "Gw",
            "device_name": "Sensor",
            "metric_name": "Temp",
            "unit": "degC",
            "metric_data": [{"value": 10.0, "timestamp": 0}],
        })
    );

    let uuid = dcc.local_uuid(&gw).await.unwrap();
    assert_eq!(
        sent[0].destination,
        Destination::new("edgelink.exchange", format!("edgelink.{uuid}.request"))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_periodic_flush_every_aggregation_size() {
    let (transport, dcc) = loopback().await;
    let gw = dcc.register(Entity::edge_system("Gw")).await.unwrap();
    let temp = dcc
        .register(Entity::metric(
            "Temp",
            MetricSpec::new(counter())
                .with_interval_seconds(1)
                .with_aggregation_size(2),
        ))
        .await
        .unwrap();
    dcc.create_relationship(&gw, &temp).await.unwrap();
    dcc.start_collecting(&temp).await.unwrap();

    assert!(transport.wait_for_sends(2, Duration::from_secs(8)).await);
    dcc.stop_collecting(&temp).await.unwrap();

    let sent = transport.sent().await;
    assert_eq!(values(&sent[0].json().unwrap()), vec![1.0, 2.0]);
    assert_eq!(values(&sent[1].json().unwrap()), vec![3.0, 4.0]);
    for message in &sent {
        let body = message.json().unwrap();
        assert_eq!(body["edge_system_name"], "Gw");
        assert!(body.get("device_name").is_none());
        assert_eq!(body["unit"], "null");
    }

    dcc.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unregister_stops_ticks() {
    let (transport, dcc) = loopback().await;
    let samples = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&samples);
    let temp = dcc
        .register(Entity::metric(
            "Temp",
            MetricSpec::new(SamplingFn::infallible(move || {
                observed.fetch_add(1, Ordering::SeqCst) as f64
            }))
            .with_interval_seconds(1)
            .with_aggregation_size(1),
        ))
        .await
        .unwrap();
    dcc.start_collecting(&temp).await.unwrap();

    assert!(transport.wait_for_sends(1, Duration::from_secs(5)).await);
    dcc.unregister(&temp).await.unwrap();
    // A sampling call already running may still finish.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let sampled = samples.load(Ordering::SeqCst);
    let sent = transport.sent_len().await;

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(samples.load(Ordering::SeqCst), sampled);
    assert_eq!(transport.sent_len().await, sent);
    assert!(dcc.registry().is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_sampler_keeps_task_alive() {
    let (transport, dcc) = loopback().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let flaky = dcc
        .register(Entity::metric(
            "Flaky",
            MetricSpec::new(SamplingFn::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SamplingError::new("sensor offline"))
            }))
            .with_interval_seconds(1),
        ))
        .await
        .unwrap();
    dcc.start_collecting(&flaky).await.unwrap();

    tokio::time::sleep(Duration::from_millis(4500)).await;

    assert!(calls.load(Ordering::SeqCst) >= 2);
    assert!(dcc.is_collecting(&flaky).await);
    let stats = dcc.collection_stats(&flaky).await.unwrap();
    assert!(stats.sampling_failures >= 2);
    assert_eq!(stats.samples, 0);
    assert_eq!(transport.sent_len().await, 0);

    dcc.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_transport_failure_drops_flush() {
    let (transport, dcc) = loopback().await;
    let temp = dcc
        .register(Entity::metric("Temp", MetricSpec::new(counter())))
        .await
        .unwrap();
    dcc.start_collecting(&temp).await.unwrap();

    transport.fail_next_send(TransportError::Timeout).await;
    dcc.sample_now(&temp).await.unwrap();
    dcc.sample_now(&temp).await.unwrap();

    let sent = transport.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(values(&sent[0].json().unwrap()), vec![2.0]);

    let stats = dcc.collection_stats(&temp).await.unwrap();
    assert_eq!(stats.flushes_dropped, 1);
    assert_eq!(stats.flushes_sent, 1);
}

#[tokio::test]
async fn test_disconnected_transport_drops_flush() {
    let (transport, dcc) = loopback().await;
    let temp = dcc
        .register(Entity::metric("Temp", MetricSpec::new(counter())))
        .await
        .unwrap();
    dcc.start_collecting(&temp).await.unwrap();

    transport.disconnect().await.unwrap();
    dcc.sample_now(&temp).await.unwrap();
    assert_eq!(transport.sent_len().await, 0);

    transport.connect().await.unwrap();
    dcc.sample_now(&temp).await.unwrap();
    assert_eq!(transport.sent_len().await, 1);
}

#[tokio::test]
async fn test_consume_inbound_messages() {
    let (transport, dcc) = loopback().await;
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let callback: MessageCallback = Arc::new(move |message: InboundMessage| {
        assert_eq!(message.properties.content_type.as_deref(), Some("application/json"));
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let err = dcc
        .consume(
            vec![Subscription::new("edgelink.exchange", Vec::<String>::new())],
            callback.clone(),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no routing keys"));

    dcc.consume(vec![Subscription::new("edgelink.exchange", ["#"])], callback)
        .await
        .unwrap();
    transport
        .deliver(
            Destination::new("edgelink.exchange", "gw.command"),
            r#"{"action":"ping"}"#,
            MessageProperties::json(),
        )
        .await;

    for _ in 0..50 {
        if received.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(received.load(Ordering::SeqCst), 1);
    dcc.stop_consumers().await.unwrap();
}

#[tokio::test]
async fn test_jsonl_sink_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("payloads.jsonl");
    let yaml = format!(
        r#"
agent: {{ edge_system: Gw }}
transport:
  path: {}
  destination: {{ exchange: plant, routing_key: line-1 }}
devices:
  - name: Sensor
    metrics:
      - {{ name: Temp, unit: degC, interval: 0s, aggregation_size: 2, source: {{ type: constant, value: 21.5 }} }}
"#,
        out.display()
    );
    let config = AppConfig::from_yaml(&yaml).unwrap();

    let dcc = DataCenterComponent::builder(Arc::new(JsonLinesTransport::new(
        &config.transport.path,
    )))
    .destination(config.transport.destination.clone().unwrap())
    .build()
    .await
    .unwrap();
    let gw = dcc
        .register(Entity::edge_system(&config.agent.edge_system))
        .await
        .unwrap();
    let device = dcc
        .register(Entity::device(&config.devices[0].name))
        .await
        .unwrap();
    let temp = dcc
        .register(config.devices[0].metrics[0].to_entity().unwrap())
        .await
        .unwrap();
    dcc.create_relationship(&gw, &device).await.unwrap();
    dcc.create_relationship(&device, &temp).await.unwrap();
    dcc.start_collecting(&temp).await.unwrap();

    dcc.sample_now(&temp).await.unwrap();
    dcc.sample_now(&temp).await.unwrap();
    dcc.shutdown(Duration::from_secs(2)).await.unwrap();

    let content = std::fs::read_to_string(&out).unwrap();
    let lines: Vec<serde_json::Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["exchange"], "plant");
    assert_eq!(lines[0]["routing_key"], "line-1");
    assert_eq!(lines[0]["payload"]["device_name"], "Sensor");
    assert_eq!(lines[0]["payload"]["unit"], "degC");
    assert_eq!(values(&lines[0]["payload"]), vec![21.5, 21.5]);
}
