//! Main application state and service coordination
//!
//! `AppState` builds the production collaborators from configuration, owns
//! the engine, and runs the background passes that keep queues, vetoes and
//! matches moving.

use crate::amqp::connection::{AmqpConfig, AmqpConnection};
use crate::amqp::publisher::{
    AmqpEventPublisher, EventPublisher, LoggingEventPublisher, PublisherConfig,
};
use crate::config::{AppConfig, QueueBackendKind};
use crate::formation::FirstFitPlanner;
use crate::hosting::{A2sServerProbe, HttpHostingApi};
use crate::metrics::health::HealthServerConfig;
use crate::metrics::{HealthServer, MetricsCollector, MetricsService};
use crate::queue::{InMemoryStore, KeyValueStore, RedisStore};
use crate::rating::{ExtendedWengLinConfig, WengLinRatingCalculator};
use crate::service::engine::{EngineDeps, EngineSettings, MatchmakingEngine};
use crate::service::health::{HealthCheck, HealthStatus};
use crate::storage::Repositories;
use crate::utils::SystemClock;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("AMQP connection error: {message}")]
    AmqpConnection { message: String },

    #[error("Queue backend error: {message}")]
    QueueBackend { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Shared view of a running service, handed to the health server
#[derive(Clone)]
pub struct ServiceHandle {
    name: String,
    engine: Arc<MatchmakingEngine>,
    running: Arc<RwLock<bool>>,
    started_at: Instant,
    lock_wait: Duration,
}

impl ServiceHandle {
    pub fn new(name: impl Into<String>, engine: Arc<MatchmakingEngine>, lock_wait: Duration) -> Self {
        Self {
            name: name.into(),
            engine,
            running: Arc::new(RwLock::new(false)),
            started_at: Instant::now(),
            lock_wait,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> Arc<MatchmakingEngine> {
        self.engine.clone()
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn set_running(&self, running: bool) {
        *self.running.write().await = running;
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Queue reads slower than this mean the lock is contended
    pub fn lock_wait(&self) -> Duration {
        self.lock_wait
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Main application state containing all service components
pub struct AppState {
    config: AppConfig,
    engine: Arc<MatchmakingEngine>,
    handle: ServiceHandle,
    metrics_service: Arc<MetricsService>,
    /// Kept open for the publisher's channel
    amqp_connection: Option<Arc<AmqpConnection>>,
    background_tasks: Vec<JoinHandle<()>>,
}

impl AppState {
    /// Initialize the application with all dependencies
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        info!("Initializing {} matchmaking service", config.service.name);
        info!(
            "Configuration: queue_backend={:?}, hosting_url={}, amqp_enabled={}",
            config.queue.backend, config.hosting.base_url, config.amqp.enabled
        );

        let metrics_collector =
            Arc::new(
                MetricsCollector::new().map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to create metrics collector: {}", e),
                })?,
            );

        let queue_backend = Self::initialize_queue_backend(&config).await?;
        let (publisher, amqp_connection) = Self::initialize_publisher(&config).await?;
        let deps = Self::initialize_deps(
            &config,
            queue_backend,
            publisher,
            metrics_collector.clone(),
        )?;
        let settings =
            EngineSettings::from_config(&config).map_err(|e| ServiceError::Configuration {
                message: e.to_string(),
            })?;
        let engine = Arc::new(MatchmakingEngine::new(deps, settings));

        let handle = ServiceHandle::new(
            config.service.name.clone(),
            engine.clone(),
            Duration::from_millis(config.queue.lock_wait_ms),
        );
        let health_server = HealthServer::new(
            HealthServerConfig {
                port: config.service.health_port,
                host: "0.0.0.0".to_string(),
            },
            metrics_collector.clone(),
        )
        .with_service(handle.clone());
        let metrics_service = Arc::new(MetricsService::new(
            metrics_collector,
            Arc::new(health_server),
        ));

        Ok(Self {
            config,
            engine,
            handle,
            metrics_service,
            amqp_connection,
            background_tasks: Vec::new(),
        })
    }

    /// Start the health server and the background passes
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        info!("Starting {} matchmaking service", self.config.service.name);
        self.handle.set_running(true).await;

        self.start_metrics_service().await;
        self.start_background_tasks();

        info!("Matchmaking service started");
        Ok(())
    }

    /// Perform graceful shutdown
    pub async fn shutdown(&mut self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of {}", self.config.service.name);
        self.handle.set_running(false).await;

        self.stop_background_tasks().await;

        if let Err(e) = self.metrics_service.stop().await {
            warn!("Failed to stop metrics service: {}", e);
        } else {
            info!("Metrics service stopped");
        }

        if let Some(connection) = self.amqp_connection.take() {
            match Arc::try_unwrap(connection) {
                Ok(connection) => {
                    if let Err(e) = connection.close().await {
                        warn!("Failed to close AMQP connection: {}", e);
                    }
                }
                Err(_) => debug!("AMQP connection still shared; leaving it to drop"),
            }
        }

        let count = self.engine.queue_count().await;
        info!(
            "Final queue state: {} players ({} teams, {} solos)",
            count.players, count.teams, count.solos
        );
        info!("{} shutdown completed", self.config.service.name);
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        self.handle.is_running().await
    }

    pub fn engine(&self) -> Arc<MatchmakingEngine> {
        self.engine.clone()
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    pub fn metrics_service(&self) -> Arc<MetricsService> {
        self.metrics_service.clone()
    }

    async fn initialize_queue_backend(
        config: &AppConfig,
    ) -> Result<Arc<dyn KeyValueStore>, ServiceError> {
        match config.queue.backend {
            QueueBackendKind::Memory => {
                info!("Using in-memory queue backend (single process only)");
                Ok(Arc::new(InMemoryStore::new()))
            }
            QueueBackendKind::Redis => {
                info!("Connecting to Redis queue backend: {}", config.queue.redis_url);
                let store = RedisStore::connect(&config.queue.redis_url)
                    .await
                    .map_err(|e| ServiceError::QueueBackend {
                        message: format!("{:#}", e),
                    })?;
                Ok(Arc::new(store))
            }
        }
    }

    async fn initialize_publisher(
        config: &AppConfig,
    ) -> Result<(Arc<dyn EventPublisher>, Option<Arc<AmqpConnection>>), ServiceError> {
        if !config.amqp.enabled {
            info!("AMQP disabled; events are logged only");
            return Ok((Arc::new(LoggingEventPublisher), None));
        }

        info!("Connecting to AMQP broker: {}", config.amqp.url);
        let amqp_config =
            AmqpConfig::from_settings(&config.amqp).map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to parse AMQP URL: {}", e),
            })?;
        let connection = AmqpConnection::new(amqp_config)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to connect to AMQP: {}", e),
            })?;
        let channel = connection
            .connection()
            .open_channel(None)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to open AMQP channel: {}", e),
            })?;
        let publisher = AmqpEventPublisher::new(
            channel,
            PublisherConfig {
                max_retries: config.amqp.max_retry_attempts,
                retry_delay_ms: config.amqp.retry_delay_ms,
            },
        )
        .await
        .map_err(|e| ServiceError::Initialization {
            message: format!("Failed to initialize event publisher: {}", e),
        })?;

        Ok((Arc::new(publisher), Some(Arc::new(connection))))
    }

    fn initialize_deps(
        config: &AppConfig,
        queue_backend: Arc<dyn KeyValueStore>,
        publisher: Arc<dyn EventPublisher>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<EngineDeps, ServiceError> {
        let hosting =
            HttpHostingApi::from_settings(&config.hosting).map_err(|e| {
                ServiceError::Initialization {
                    message: format!("Failed to build hosting API client: {}", e),
                }
            })?;
        let calculator =
            WengLinRatingCalculator::new(ExtendedWengLinConfig::from(&config.rating)).map_err(
                |e| ServiceError::Initialization {
                    message: format!("Failed to initialize rating calculator: {}", e),
                },
            )?;

        Ok(EngineDeps {
            repos: Repositories::in_memory(),
            queue_backend,
            hosting: Arc::new(hosting),
            probe: Arc::new(A2sServerProbe::new(config.probe_timeout())),
            publisher,
            calculator: Arc::new(calculator),
            planner: Arc::new(FirstFitPlanner),
            clock: Arc::new(SystemClock),
            metrics,
        })
    }

    async fn start_metrics_service(&mut self) {
        let metrics_service = self.metrics_service.clone();
        let port = self.config.service.health_port;

        let metrics_handle = tokio::spawn(async move {
            if let Err(e) = metrics_service.start().await {
                error!("Metrics service failed: {}", e);
            } else {
                info!("Metrics service task completed");
            }
        });
        self.background_tasks.push(metrics_handle);

        // Give the server a moment to bind
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!("Health and metrics endpoints on port {}", port);
    }

    /// Spawn a task that runs `pass` every `period` while the service runs
    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, pass: F) -> JoinHandle<()>
    where
        F: Fn(Arc<MatchmakingEngine>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let engine = self.engine.clone();
        let handle = self.handle.clone();
        info!("Starting {} task ({:?} interval)", name, period);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            while handle.is_running().await {
                interval.tick().await;
                pass(engine.clone()).await;
            }
            info!("{} task stopped", name);
        })
    }

    fn start_background_tasks(&mut self) {
        let formation = self.spawn_periodic(
            "formation",
            self.config.formation_interval(),
            |engine| async move {
                match engine.form_matches().await {
                    Ok(report) if report.lock_unavailable => {
                        debug!("Formation pass skipped: queue lock busy")
                    }
                    Ok(report) if !report.formed.is_empty() => info!(
                        "Formation pass formed {} matches ({} started)",
                        report.formed.len(),
                        report.started()
                    ),
                    Ok(_) => {}
                    Err(e) => warn!("Formation pass failed: {}", e),
                }
            },
        );

        let results = self.spawn_periodic(
            "result reconciliation",
            self.config.result_poll_interval(),
            |engine| async move {
                match engine.reconcile_results().await {
                    Ok(report) if report.finished > 0 => info!(
                        "Reconciled {} of {} matches ({} cancelled, {} skipped)",
                        report.finished, report.checked, report.cancelled, report.skipped
                    ),
                    Ok(_) => {}
                    Err(e) => warn!("Result reconciliation failed: {}", e),
                }
            },
        );

        let connections = self.spawn_periodic(
            "connection timeout",
            self.config.connection_check_interval(),
            |engine| async move {
                match engine.check_connection_timeouts().await {
                    Ok(report) if report.validated + report.cancelled > 0 => info!(
                        "Connection check: {} validated, {} cancelled",
                        report.validated, report.cancelled
                    ),
                    Ok(_) => {}
                    Err(e) => warn!("Connection timeout check failed: {}", e),
                }
            },
        );

        let vetoes = self.spawn_periodic(
            "veto sweep",
            self.config.veto_sweep_interval(),
            |engine| async move {
                if let Err(e) = engine.sweep_veto_timeouts().await {
                    warn!("Veto sweep failed: {}", e);
                }
            },
        );

        let health = {
            let metrics = self.metrics_service.collector();
            let handle = self.handle.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(30));
                while handle.is_running().await {
                    interval.tick().await;

                    match HealthCheck::check(&handle).await {
                        Ok(health) => {
                            debug!(
                                "Health {} - queued players: {}, teams: {}, solos: {}",
                                health.status,
                                health.stats.players_queued,
                                health.stats.teams_queued,
                                health.stats.solos_queued
                            );
                            health.record(&metrics);
                        }
                        Err(e) => {
                            warn!("Health check failed: {}", e);
                            metrics.update_health_status(HealthStatus::Unhealthy.as_gauge());
                        }
                    }
                }
                info!("Health metrics task stopped");
            })
        };

        self.background_tasks
            .extend([formation, results, connections, vetoes, health]);
        info!(
            "{} background tasks started",
            self.background_tasks.len()
        );
    }

    async fn stop_background_tasks(&mut self) {
        let task_count = self.background_tasks.len();
        if task_count == 0 {
            return;
        }

        info!("Stopping {} background tasks...", task_count);
        for task in self.background_tasks.drain(..) {
            task.abort();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!("All {} background tasks stopped", task_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.service.health_port = 18_080;
        config
    }

    #[tokio::test]
    async fn test_builds_from_default_config() {
        let app = AppState::new(test_config()).await.unwrap();
        assert!(!app.is_running().await);
        assert_eq!(app.engine().queue_count().await.players, 0);
        assert_eq!(app.handle().name(), "scrim-room");
    }

    #[tokio::test]
    async fn test_rejects_bad_map_pool() {
        let mut config = test_config();
        config.veto.map_pool = vec!["de_nuke".to_string()];
        let err = AppState::new(config).await.err().unwrap();
        assert!(matches!(err, ServiceError::Configuration { .. }));
    }
}
