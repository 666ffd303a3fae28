use anyhow::{Context, Result};
use csv_filter::{
    start_api_server, AppState, Config, DimensionProcessor, FilterRequestConsumer, FilterService,
    FilterSettings, KafkaPublisher, S3Store,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting CSV filter service"
    );

    init_metrics(config.service.metrics_port)?;

    let store = Arc::new(
        S3Store::new(&config.s3)
            .await
            .context("Failed to initialize S3 store")?,
    );

    let publisher =
        Arc::new(KafkaPublisher::new(&config.kafka).context("Failed to create Kafka producer")?);

    let service = Arc::new(FilterService::new(
        store,
        Arc::new(DimensionProcessor::new()),
        publisher,
        FilterSettings::from_config(&config),
    ));

    let kafka_consumer = FilterRequestConsumer::new(&config.kafka, service.clone())
        .context("Failed to initialize Kafka consumer")?;

    let shutdown = CancellationToken::new();

    let consumer_shutdown = shutdown.clone();
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = kafka_consumer.run(consumer_shutdown).await {
            error!(error = %e, "Kafka consumer error");
        }
    });

    let api_state = AppState { service };
    let bind_addr = config.api.bind_addr.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &bind_addr, api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("CSV filter service started successfully");

    shutdown_signal().await;

    info!("Shutting down CSV filter service");

    // In-flight requests finish before the tasks return
    shutdown.cancel();

    if let Err(e) = consumer_handle.await {
        error!(error = %e, "Kafka consumer task failed");
    }
    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }

    info!("CSV filter service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
