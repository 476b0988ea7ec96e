use crate::config::ApiConfig;
use crate::worker::WorkerManager;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tierflow_pipeline::Tier;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<WorkerManager>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Create the status API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(status))
        .route("/status/:tier", get(tier_status))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Process liveness
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "storage-worker"
    }))
}

/// Ready when every worker passes its health check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let workers = state.manager.health().await;
    let ready = !workers.is_empty() && workers.values().all(|report| report.healthy);

    let (code, label) = if ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };
    (
        code,
        Json(serde_json::json!({
            "status": label,
            "workers": workers,
        })),
    )
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.get_status().await)
}

async fn tier_status(
    State(state): State<AppState>,
    Path(tier): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let tier: Tier = tier.parse().map_err(|e: tierflow_pipeline::ConfigError| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
                code: "INVALID_TIER".to_string(),
            }),
        )
    })?;

    match state.manager.worker(tier).await {
        Some(worker) => Ok(Json(worker.get_status())),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("No {} worker in this process", tier),
                code: "NOT_FOUND".to_string(),
            }),
        )),
    }
}

/// Serve the status API until `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting status API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::MockContentProcessor;
    use crate::repository::MockRepository;
    use crate::worker::{
        Dependencies, DependencyFactory, TenantScope, WorkerError, WorkerSettings,
    };
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tierflow_pipeline::{MemoryTransport, RoutingConfig, RoutingTable, StreamManager};
    use tower::ServiceExt;

    struct PingingFactory;

    #[async_trait::async_trait]
    impl DependencyFactory for PingingFactory {
        async fn create(&self, _tier: Tier) -> Result<Dependencies, WorkerError> {
            let mut repository = MockRepository::new();
            repository.expect_ping().returning(|| Ok(()));
            Ok(Dependencies {
                processor: Box::new(MockContentProcessor::new()),
                repository: Box::new(repository),
            })
        }
    }

    async fn app() -> (Router, Arc<WorkerManager>) {
        let transport = Arc::new(MemoryTransport::new());
        let routing = Arc::new(RoutingTable::from_config(&RoutingConfig::default()).unwrap());
        StreamManager::new(transport.clone(), routing.clone())
            .ensure_all()
            .await
            .unwrap();
        let manager = Arc::new(WorkerManager::new(
            transport,
            routing,
            Arc::new(PingingFactory),
            TenantScope::All,
            WorkerSettings {
                fetch_timeout: std::time::Duration::from_millis(10),
                ..Default::default()
            },
        ));
        manager.setup_worker(Tier::Small).await.unwrap();
        let router = create_router(
            AppState {
                manager: manager.clone(),
            },
            &ApiConfig::default(),
        );
        (router, manager)
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _) = app().await;
        let (status, body) = get(router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_ready_requires_worker_activity() {
        let (router, manager) = app().await;
        let (status, body) = get(router.clone(), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["workers"]["small"]["checks"]["recently_active"], false);

        let worker = manager.worker(Tier::Small).await.unwrap();
        assert_eq!(worker.process_batch().await.unwrap(), 0);

        let (status, body) = get(router, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
    }

    #[tokio::test]
    async fn test_status_endpoints() {
        let (router, _) = app().await;

        let (status, body) = get(router.clone(), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totals"]["workers"], 1);
        assert_eq!(body["workers"]["small"]["consumer"], "small-workers");
        assert_eq!(body["workers"]["small"]["metrics"]["success_rate"], 0.0);

        let (status, body) = get(router.clone(), "/status/small").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "starting");

        let (status, _) = get(router.clone(), "/status/large").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = get(router, "/status/huge").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_TIER");
    }
}
