use anyhow::{Context, Result};
use camtrack_pipeline::{QueueConsumer, QueueProducer};
use camtrack_tracker::api::{start_api_server, AppState};
use camtrack_tracker::config::{Config, ServiceConfig, StoreBackend};
use camtrack_tracker::{
    BroadcastHub, EventDecoder, LaneContext, LaneRouter, MemoryStore, PgTrackStore,
    TrackStore, TrackWriter, TrackingHandler,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service);

    info!(
        service = %config.service.name,
        "Starting camtrack tracker service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = init_store(&config).await?;

    let writer = Arc::new(TrackWriter::new(store.clone(), config.persistence.clone()));
    let hub = Arc::new(BroadcastHub::new(config.broadcast.channel_capacity));
    let router = Arc::new(LaneRouter::new(LaneContext {
        writer,
        hub: hub.clone(),
        tracker: config.tracker.clone(),
        lanes: config.lanes.clone(),
        persistence: config.persistence.clone(),
    }));
    let handler = Arc::new(TrackingHandler::new(
        EventDecoder::new(config.validation.clone()),
        router.clone(),
    ));

    // Dead letters go through their own producer
    let producer = Arc::new(
        QueueProducer::new(config.kafka.clone()).context("Failed to create DLQ producer")?,
    );
    let consumer = Arc::new(QueueConsumer::new(config.kafka.clone()).with_dlq_producer(producer.clone()));

    let api_state = AppState {
        router: router.clone(),
        hub,
        store,
        max_history_limit: config.api.max_history_limit,
    };

    // Spawn consumer task
    let consumer_task = consumer.clone();
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer_task.run(handler).await {
            error!(error = %e, "Kafka consumer error");
        }
    });

    // Spawn API server task
    let api_shutdown = CancellationToken::new();
    let api_stop = api_shutdown.clone();
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        let stop = async move { api_stop.cancelled().await };
        if let Err(e) = start_api_server(api_state, &api_config, stop).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Tracker service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down tracker service");

    // Drain in-flight messages and commit before the lanes go away
    consumer.shutdown();
    if let Err(e) = consumer_handle.await {
        error!(error = %e, "Consumer task panicked");
    }
    router.shutdown().await;

    api_shutdown.cancel();
    if let Err(e) = api_handle.await {
        error!(error = %e, "API task panicked");
    }

    if let Err(e) = producer.flush(Duration::from_secs(5)) {
        warn!(error = %e, "Failed to flush dead letter producer");
    }

    info!("Tracker service stopped");

    Ok(())
}

async fn init_store(config: &Config) -> Result<Arc<dyn TrackStore>> {
    match config.persistence.backend {
        StoreBackend::Postgres => {
            let store = PgTrackStore::new(&config.database)
                .await
                .context("Failed to initialize track store")?;

            if config.database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory track store; nothing survives a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(service: &ServiceConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&service.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if service.log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
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
