//! Tierflow Router - moves storage events from the ingestion subject to the
//! size tiers
//!
//! This binary:
//! - Ensures the ingestion and tier streams plus their durable consumers
//! - Routes events until SIGINT/SIGTERM
//! - Periodically reaps stale consumers and logs its status

use anyhow::{Context, Result};
use std::sync::Arc;
use tierflow_pipeline::telemetry::{init_metrics, init_tracing};
use tierflow_pipeline::{JetStreamTransport, PipelineConfig, Router, RoutingTable, Transport};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = PipelineConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.telemetry);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        nats_url = %config.nats.url,
        "Starting tierflow router"
    );

    init_metrics(config.telemetry.metrics_port)
        .context("Failed to install Prometheus metrics exporter")?;

    let routing = Arc::new(
        RoutingTable::from_config(&config.routing).context("Invalid routing configuration")?,
    );
    let transport = Arc::new(
        JetStreamTransport::connect(&config.nats)
            .await
            .context("Failed to connect to NATS")?,
    );

    let router = Arc::new(Router::new(
        transport.clone(),
        routing,
        config.router.clone(),
    ));
    router.setup().await.context("Router setup failed")?;

    let validation = router.validate_setup().await;
    if !validation.all_healthy {
        warn!(streams = ?validation.streams, consumers = ?validation.consumers, "Router setup is not fully healthy");
    }

    let shutdown = CancellationToken::new();

    // Periodic stale consumer cleanup
    let cleanup_handle = {
        let router = router.clone();
        let shutdown = shutdown.clone();
        let interval = config.router.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = router.cleanup_stale_consumers().await {
                            warn!(error = %e, "Periodic consumer cleanup failed");
                        }
                    }
                }
            }
        })
    };

    // Periodic status log
    let status_handle = {
        let router = router.clone();
        let shutdown = shutdown.clone();
        let interval = config.router.status_log_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let status = router.status();
                        info!(
                            processed = status.messages_processed,
                            routed = status.messages_routed,
                            rejected = status.messages_rejected,
                            errors = status.errors,
                            consecutive_errors = status.consecutive_errors,
                            "Router status"
                        );
                    }
                }
            }
        })
    };

    let router_handle = {
        let router = router.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { router.run(shutdown).await })
    };

    shutdown_signal().await;
    info!("Shutting down...");
    shutdown.cancel();

    for (name, handle) in [
        ("router", router_handle),
        ("cleanup", cleanup_handle),
        ("status", status_handle),
    ] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Task terminated abnormally");
        }
    }

    if let Err(e) = transport.close().await {
        warn!(error = %e, "Failed to close NATS connection cleanly");
    }

    info!("Shutdown complete");
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
