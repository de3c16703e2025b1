//! Edgelink Binary Entry Point
//!
//! Runs an edge agent described by a YAML configuration file.
//! Core functionality is provided by the `edgelink` library crate.

use std::sync::Arc;

use clap::Parser;
use edgelink::{
    DataCenterComponent, DispatchPort, Entity, JsonLinesTransport, RegisteredEntity,
    config::{AppConfig, MetricConfig, TransportKind},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Edgelink - Edge Telemetry Agent
#[derive(Parser, Debug)]
#[command(name = "edgelink", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/edgelink.yaml",
        env = "EDGELINK_CONFIG"
    )]
    config: String,

    /// Log filter (overrides RUST_LOG), e.g. "debug" or "info,edgelink=trace"
    #[arg(long, env = "EDGELINK_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    let filter = match &cli.log_level {
        Some(level) => tracing_subscriber::EnvFilter::try_new(level)?,
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,edgelink=debug".into()),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Edgelink - Edge Telemetry Agent");

    // Load configuration from file
    tracing::info!(path = %cli.config, "Loading configuration");
    let config = AppConfig::load(&cli.config)?;

    let port: Arc<dyn DispatchPort> = match config.transport.kind {
        TransportKind::Jsonl => Arc::new(JsonLinesTransport::new(&config.transport.path)),
    };
    tracing::info!(
        transport = %config.transport.kind,
        path = %config.transport.path,
        "Transport selected"
    );

    let mut builder = DataCenterComponent::builder(port)
        .enclose_metadata(config.agent.enclose_metadata)
        .routing_prefix(&config.transport.routing_prefix);
    if let Some(destination) = config.transport.destination.clone() {
        builder = builder.destination(destination);
    }
    let dcc = builder.build().await?;

    // Build the entity hierarchy
    let edge = dcc
        .register(Entity::edge_system(&config.agent.edge_system))
        .await?;
    let mut metrics = Vec::new();
    for metric in &config.metrics {
        metrics.push(install_metric(&dcc, &edge, metric).await?);
    }
    for device_config in &config.devices {
        let device = dcc.register(Entity::device(&device_config.name)).await?;
        dcc.create_relationship(&edge, &device).await?;
        for metric in &device_config.metrics {
            metrics.push(install_metric(&dcc, &device, metric).await?);
        }
    }

    // Start collection
    let mut started = 0;
    for metric in &metrics {
        match dcc.start_collecting(metric).await {
            Ok(()) => started += 1,
            Err(e) => tracing::error!(metric = %metric.name(), error = %e, "Failed to start collection"),
        }
    }
    tracing::info!(
        edge_system = %edge.name(),
        devices = config.devices.len(),
        metrics = metrics.len(),
        started,
        "Agent running"
    );
    tracing::info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;

    tracing::info!("Shutting down data-center component...");
    if let Err(e) = dcc.shutdown(config.agent.shutdown_timeout).await {
        tracing::error!(error = %e, "Failed to shutdown data-center component");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Register a configured metric under `parent`.
async fn install_metric(
    dcc: &DataCenterComponent,
    parent: &RegisteredEntity,
    config: &MetricConfig,
) -> Result<RegisteredEntity, Box<dyn std::error::Error>> {
    let metric = dcc.register(config.to_entity()?).await?;
    dcc.create_relationship(parent, &metric).await?;
    tracing::debug!(metric = %metric.name(), parent = %parent.name(), "Metric installed");
    Ok(metric)
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
