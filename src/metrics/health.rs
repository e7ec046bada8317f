//! Health check endpoints and Prometheus metrics server
//!
//! Axum router serving liveness, readiness, detailed stats, the current queue
//! counts and the Prometheus text exposition.

use crate::metrics::collector::MetricsCollector;
use crate::service::app::ServiceHandle;
use crate::service::health::{HealthCheck, HealthStatus};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const SERVICE_NAME: &str = "scrim-room";

/// Health server configuration
#[derive(Debug, Clone)]
pub struct HealthServerConfig {
    pub port: u16,
    /// Typically "0.0.0.0" for all interfaces
    pub host: String,
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Shared state for the health server
#[derive(Clone)]
pub struct HealthServerState {
    pub metrics_collector: Arc<MetricsCollector>,
    pub service: Option<ServiceHandle>,
}

/// Health server that provides HTTP endpoints for monitoring
pub struct HealthServer {
    config: HealthServerConfig,
    state: HealthServerState,
    shutdown_tx: broadcast::Sender<()>,
}

impl HealthServer {
    pub fn new(config: HealthServerConfig, metrics_collector: Arc<MetricsCollector>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            state: HealthServerState {
                metrics_collector,
                service: None,
            },
            shutdown_tx,
        }
    }

    /// Attach the running service so health checks can inspect it
    pub fn with_service(mut self, service: ServiceHandle) -> Self {
        self.state.service = Some(service);
        self
    }

    pub async fn start(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .context("Invalid health server address")?;

        let app = self.create_router();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind health server on {}", addr))?;
        info!("Health server listening on http://{}", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Health server shutdown signal received");
            })
            .await?;

        info!("Health server stopped");
        Ok(())
    }

    fn create_router(&self) -> Router {
        Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/alive", get(alive_handler))
            .route("/metrics", get(metrics_handler))
            .route("/stats", get(stats_handler))
            .route("/queue", get(queue_handler))
            .with_state(self.state.clone())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to send shutdown signal to health server: {}", e);
        }
        Ok(())
    }
}

fn not_initialized() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "status": "unhealthy",
            "service": SERVICE_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "error": "Service not initialized"
        })),
    )
}

async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/ready", "/alive", "/metrics", "/stats", "/queue"]
    }))
}

async fn health_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    debug!("Health check requested");

    let Some(service) = &state.service else {
        return not_initialized();
    };
    let status = HealthCheck::liveness_check(service)
        .await
        .unwrap_or(HealthStatus::Unhealthy);
    let code = match status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (
        code,
        Json(json!({
            "status": status,
            "service": service.name(),
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

async fn ready_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    debug!("Readiness check requested");

    match &state.service {
        Some(service) => match HealthCheck::readiness_check(service).await {
            Ok(HealthStatus::Healthy) => (StatusCode::OK, "Ready"),
            Ok(HealthStatus::Degraded) => (StatusCode::OK, "Degraded but ready"),
            Ok(HealthStatus::Unhealthy) => (StatusCode::SERVICE_UNAVAILABLE, "Not ready"),
            Err(e) => {
                error!("Readiness check failed: {}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "Not ready")
            }
        },
        None => (StatusCode::SERVICE_UNAVAILABLE, "Service not initialized"),
    }
}

async fn alive_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    match &state.service {
        Some(service) => match HealthCheck::liveness_check(service).await {
            Ok(HealthStatus::Healthy) => (StatusCode::OK, "Alive"),
            _ => (StatusCode::SERVICE_UNAVAILABLE, "Not alive"),
        },
        None => (StatusCode::SERVICE_UNAVAILABLE, "Service not initialized"),
    }
}

async fn metrics_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    let metric_families = state.metrics_collector.registry().gather();
    let encoder = TextEncoder::new();

    match encoder.encode_to_string(&metric_families) {
        Ok(output) => {
            debug!("Serving {} metric families", metric_families.len());
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, encoder.format_type().to_string())],
                output,
            )
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain".to_string())],
                "Failed to encode metrics".to_string(),
            )
        }
    }
}

async fn stats_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    let Some(service) = &state.service else {
        return not_initialized();
    };

    match HealthCheck::check(service).await {
        Ok(health) => {
            health.record(&state.metrics_collector);
            (
                StatusCode::OK,
                Json(json!({
                    "service": {
                        "name": health.service,
                        "version": health.version,
                        "status": health.status,
                        "uptime_seconds": health.stats.uptime_seconds
                    },
                    "queue": {
                        "players": health.stats.players_queued,
                        "teams": health.stats.teams_queued,
                        "solos": health.stats.solos_queued
                    },
                    "matches": {
                        "active": health.stats.active_matches
                    },
                    "components": health.checks,
                    "timestamp": health.timestamp
                })),
            )
        }
        Err(e) => {
            error!("Failed to get stats: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "service": { "name": service.name(), "status": "error" },
                    "error": "Failed to get service stats",
                    "timestamp": chrono::Utc::now()
                })),
            )
        }
    }
}

/// Current queue counts; stale when the queue lock is busy
async fn queue_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    let Some(service) = &state.service else {
        return not_initialized();
    };
    let count = service.engine().queue_count().await;
    (StatusCode::OK, Json(json!(count)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::engine::{EngineDeps, EngineSettings, MatchmakingEngine};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn server_with_service() -> (HealthServer, ServiceHandle) {
        let collector = Arc::new(MetricsCollector::new().expect("Failed to create collector"));
        let deps = EngineDeps::in_memory(collector.clone()).unwrap();
        let engine = Arc::new(MatchmakingEngine::new(deps, EngineSettings::default()));
        let handle = ServiceHandle::new("scrim-room", engine, Duration::from_secs(5));
        let server =
            HealthServer::new(HealthServerConfig::default(), collector).with_service(handle.clone());
        (server, handle)
    }

    async fn get(app: Router, uri: &str) -> axum::response::Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_root_endpoint() {
        let collector = Arc::new(MetricsCollector::new().expect("Failed to create collector"));
        let server = HealthServer::new(HealthServerConfig::default(), collector);
        assert_eq!(get(server.create_router(), "/").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let collector = Arc::new(MetricsCollector::new().expect("Failed to create collector"));
        collector.record_formation_pass();
        collector.update_health_status(2);

        let server = HealthServer::new(HealthServerConfig::default(), collector);
        let response = get(server.create_router(), "/metrics").await;

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("text/plain"));
    }

    #[tokio::test]
    async fn test_endpoints_without_service() {
        let collector = Arc::new(MetricsCollector::new().expect("Failed to create collector"));
        let app = HealthServer::new(HealthServerConfig::default(), collector).create_router();

        for uri in ["/health", "/ready", "/alive", "/stats", "/queue"] {
            assert_eq!(
                get(app.clone(), uri).await.status(),
                StatusCode::SERVICE_UNAVAILABLE,
                "{}",
                uri
            );
        }
    }

    #[tokio::test]
    async fn test_running_service_is_ready() {
        let (server, handle) = server_with_service();
        handle.set_running(true).await;
        let app = server.create_router();

        assert_eq!(get(app.clone(), "/ready").await.status(), StatusCode::OK);
        assert_eq!(get(app.clone(), "/alive").await.status(), StatusCode::OK);
        assert_eq!(get(app, "/stats").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_queue_endpoint_reports_counts() {
        let (server, handle) = server_with_service();
        handle.engine().join_queue(42).await.unwrap();

        let response = get(server.create_router(), "/queue").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let count: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(count["players"], 1);
        assert_eq!(count["solos"], 1);
    }

    #[tokio::test]
    async fn test_404_handling() {
        let collector = Arc::new(MetricsCollector::new().expect("Failed to create collector"));
        let server = HealthServer::new(HealthServerConfig::default(), collector);
        assert_eq!(
            get(server.create_router(), "/nonexistent").await.status(),
            StatusCode::NOT_FOUND
        );
    }
}
