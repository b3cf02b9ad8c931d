use anyhow::{Context, Result};
use classifier_service::{ClassifierKafkaConsumer, Config, Orchestrator, S3BlobStore};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        topic = %config.queue_name,
        input_container = %config.input_container,
        "Starting classifier service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let blob_store = Arc::new(
        S3BlobStore::new(&config.s3)
            .await
            .context("Failed to initialize blob store")?,
    );

    let orchestrator = Arc::new(
        Orchestrator::new(&config, blob_store).context("Failed to initialize orchestrator")?,
    );

    let kafka_consumer = ClassifierKafkaConsumer::new(&config, orchestrator)
        .context("Failed to initialize Kafka consumer")?;

    // Spawn Kafka consumer task
    let shutdown = CancellationToken::new();
    let consumer_shutdown = shutdown.clone();
    let mut consumer_handle =
        tokio::spawn(async move { kafka_consumer.run(consumer_shutdown).await });

    info!("Classifier service started successfully");

    // Wait for shutdown signal, or for the consumer to give up on its own
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutting down classifier service");

            // Let the message in flight finish
            shutdown.cancel();
            match consumer_handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Kafka consumer error"),
                Err(e) => error!(error = %e, "Kafka consumer task panicked"),
            }
        }
        joined = &mut consumer_handle => {
            // Exit so the group resumes from the last committed offset on restart
            match joined {
                Ok(Ok(())) => warn!("Kafka consumer stopped"),
                Ok(Err(e)) => return Err(e.context("Kafka consumer failed")),
                Err(e) => return Err(anyhow::Error::new(e).context("Kafka consumer task panicked")),
            }
        }
    }

    info!("Classifier service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
