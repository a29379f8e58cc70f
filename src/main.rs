use anyhow::{bail, Context, Result};
use archive_manager::api::{self, AppState};
use archive_manager::config::Config;
use archive_manager::controller::CameraController;
use archive_manager::frame_source::FrameSource;
use archive_manager::index_store::IndexStore;
use archive_manager::retention::RetentionSweeper;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    let instance_id = Uuid::new_v4();
    info!(
        service = %config.service.name,
        version = VERSION,
        instance_id = %instance_id,
        "Starting archive manager"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Startup resource verification: all of these are fatal
    verify_storage_root(&config.archive.storage_root).await?;

    let store = Arc::new(
        IndexStore::connect(&config.database)
            .await
            .context("Failed to initialize index store")?,
    );
    store
        .verify_schema()
        .await
        .context("Index schema verification failed")?;

    let source =
        Arc::new(FrameSource::new(&config.kafka).context("Failed to initialize frame source")?);
    source
        .verify_camera_topic(config.kafka.metadata_timeout())
        .context("Camera state topic verification failed")?;

    let cancel = CancellationToken::new();

    // Spawn the shared Kafka consumer
    let source_handle = tokio::spawn({
        let source = source.clone();
        let cancel = cancel.clone();
        async move { source.run(cancel).await }
    });

    // Spawn the camera lifecycle controller
    let controller = CameraController::new(
        source.clone(),
        store.clone(),
        config.archive.clone(),
        config.kafka.clone(),
    );
    let controller_handle = tokio::spawn(controller.run(cancel.clone()));

    // Spawn the retention sweep
    let sweeper = RetentionSweeper::new(
        source.clone(),
        store.clone(),
        config.archive.storage_root.clone(),
        config.archive.fragment_length(),
        config.archive.retention_workers,
    );
    let retention_handle = tokio::spawn(sweeper.run(cancel.clone()));

    // Spawn the health/readiness API
    let api_state = AppState {
        store: store.clone(),
        service_name: config.service.name.clone(),
        version: VERSION,
        instance_id,
    };
    let api_config = config.api.clone();
    let api_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = api::serve(api_state, &api_config, cancel).await {
                error!(error = %e, "API server error");
            }
        }
    });

    info!("Archive manager started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down archive manager");
    cancel.cancel();

    let _ = tokio::join!(
        source_handle,
        controller_handle,
        retention_handle,
        api_handle
    );

    info!("Archive manager stopped");

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
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// The storage root must exist before startup; fragments land under it.
async fn verify_storage_root(path: &Path) -> Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => bail!("storage root is not a directory: {}", path.display()),
        Err(e) => bail!("storage root {} is not accessible: {e}", path.display()),
    }
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
