//! Tierflow Storage Worker - processes routed storage events per tier
//!
//! This binary:
//! - Ensures the tier streams and durable consumers it serves
//! - Runs one worker loop per configured tier until SIGINT/SIGTERM
//! - Serves health, readiness and status over HTTP

use anyhow::{Context, Result};
use std::sync::Arc;
use tierflow_pipeline::telemetry::{init_metrics, init_tracing};
use tierflow_pipeline::{JetStreamTransport, RoutingTable, StreamManager, Transport};
use tierflow_storage::{
    start_api_server, AppState, Config, PostgresRepository, PostgresS3Factory, Repository,
    WorkerManager,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.telemetry);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        tiers = ?config.worker.tiers,
        tenant_id = ?config.worker.tenant_id,
        "Starting tierflow storage worker"
    );

    init_metrics(config.telemetry.metrics_port)
        .context("Failed to install Prometheus metrics exporter")?;

    // Migrations run once per process, before any worker pool exists
    if config.database.run_migrations {
        let repository = PostgresRepository::new(&config.database)
            .await
            .context("Failed to connect to database")?;
        repository
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
        repository.close().await;
    }

    let routing = Arc::new(
        RoutingTable::from_config(&config.routing).context("Invalid routing configuration")?,
    );
    let transport = Arc::new(
        JetStreamTransport::connect(&config.nats)
            .await
            .context("Failed to connect to NATS")?,
    );

    let streams = StreamManager::new(transport.clone(), routing.clone());
    for tier in &config.worker.tiers {
        streams
            .ensure_stream(*tier)
            .await
            .with_context(|| format!("Failed to ensure {} stream", tier))?;
    }

    let factory = Arc::new(PostgresS3Factory::new(
        config.s3.clone(),
        config.database.clone(),
    ));
    let manager = Arc::new(WorkerManager::new(
        transport.clone(),
        routing,
        factory,
        config.tenant_scope(),
        config.worker_settings(),
    ));

    for tier in &config.worker.tiers {
        manager
            .setup_worker(*tier)
            .await
            .with_context(|| format!("Failed to set up {} worker", tier))?;
    }
    manager.start_all().await;

    let shutdown = CancellationToken::new();

    let api_handle = {
        let state = AppState {
            manager: manager.clone(),
        };
        let api_config = config.api.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = start_api_server(state, &api_config, shutdown).await {
                error!(error = %e, "API server error");
            }
        })
    };

    info!("Storage worker started successfully");

    shutdown_signal().await;
    info!("Shutting down storage worker");

    shutdown.cancel();
    manager.stop_all().await;

    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task terminated abnormally");
    }

    if let Err(e) = transport.close().await {
        warn!(error = %e, "Failed to close NATS connection cleanly");
    }

    let status = manager.get_status().await;
    info!(
        processed = status.totals.messages_processed,
        failed = status.totals.messages_failed,
        files = status.totals.files_processed,
        "Storage worker stopped"
    );

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
