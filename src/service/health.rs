//! Health checks for the scrim-room service
//!
//! Liveness only asks whether the service is running. Readiness and the full
//! check also time a queue read, which is the one shared resource that can
//! stall every request.

use crate::metrics::MetricsCollector;
use crate::service::app::ServiceHandle;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, warn};

/// Health check status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// The worse of two statuses
    fn worst(self, other: HealthStatus) -> HealthStatus {
        match (self, other) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }

    pub fn as_gauge(self) -> u8 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 0,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub checks: Vec<ComponentCheck>,
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Why the component is not healthy
    pub message: Option<String>,
    pub duration_ms: u64,
}

/// Service statistics for health reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    pub players_queued: usize,
    pub teams_queued: usize,
    pub solos_queued: usize,
    pub active_matches: usize,
    pub uptime_seconds: u64,
}

impl HealthCheck {
    /// Full health check of the service
    pub async fn check(service: &ServiceHandle) -> Result<Self> {
        let running = Self::check_service_running(service).await;
        let queue = Self::check_queue(service).await;
        let storage = Self::check_storage(service);

        let status = running.status.worst(queue.status).worst(storage.status);
        let stats = Self::gather_service_stats(service).await;

        Ok(HealthCheck {
            status,
            service: service.name().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            checks: vec![running, queue, storage],
            stats,
        })
    }

    /// Liveness: the service is running
    pub async fn liveness_check(service: &ServiceHandle) -> Result<HealthStatus> {
        if service.is_running().await {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy)
        }
    }

    /// Readiness: running, and the queue answers in time
    pub async fn readiness_check(service: &ServiceHandle) -> Result<HealthStatus> {
        if !service.is_running().await {
            return Ok(HealthStatus::Unhealthy);
        }
        Ok(Self::check_queue(service).await.status)
    }

    async fn check_service_running(service: &ServiceHandle) -> ComponentCheck {
        let start = Instant::now();
        let (status, message) = if service.is_running().await {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some("Service is not running".to_string()),
            )
        };

        ComponentCheck {
            name: "service_running".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// A queue read that takes the whole lock wait served a stale snapshot
    async fn check_queue(service: &ServiceHandle) -> ComponentCheck {
        let start = Instant::now();
        let count = service.engine().queue().count().await;
        let elapsed = start.elapsed();

        let (status, message) = if elapsed >= service.lock_wait() {
            warn!("Queue read took {:?}; lock is contended", elapsed);
            (
                HealthStatus::Degraded,
                Some(format!("Queue lock contended ({:?})", elapsed)),
            )
        } else {
            debug!("Queue check: {} players queued", count.players);
            (HealthStatus::Healthy, None)
        };

        ComponentCheck {
            name: "queue".to_string(),
            status,
            message,
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    fn check_storage(service: &ServiceHandle) -> ComponentCheck {
        let start = Instant::now();
        let (status, message) = match service.engine().repos().matches.active() {
            Ok(_) => (HealthStatus::Healthy, None),
            Err(e) => (
                HealthStatus::Unhealthy,
                Some(format!("Match store unavailable: {}", e)),
            ),
        };

        ComponentCheck {
            name: "storage".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn gather_service_stats(service: &ServiceHandle) -> ServiceStats {
        let engine = service.engine();
        let count = engine.queue().count().await;
        let active_matches = engine
            .repos()
            .matches
            .active()
            .map(|matches| matches.len())
            .unwrap_or_else(|e| {
                debug!("Failed to count active matches for health check: {}", e);
                0
            });

        ServiceStats {
            players_queued: count.players,
            teams_queued: count.teams,
            solos_queued: count.solos,
            active_matches,
            uptime_seconds: service.uptime().as_secs(),
        }
    }

    /// Publish the outcome on the health gauges
    pub fn record(&self, metrics: &MetricsCollector) {
        metrics.update_health_status(self.status.as_gauge());
        for check in &self.checks {
            metrics.update_component_health(&check.name, check.status == HealthStatus::Healthy);
        }
        metrics
            .service()
            .uptime_seconds
            .set(self.stats.uptime_seconds as i64);
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}
