//! Metrics collection using Prometheus
//!
//! This module provides metrics collection for the scrim-room matchmaking
//! service. Every metric is prefixed with `scrim_room_`.

use crate::formation::PairingKind;
use crate::types::{ChallengeStatus, QueueCount};
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the matchmaking service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    service_metrics: ServiceMetrics,
    queue_metrics: QueueMetrics,
    formation_metrics: FormationMetrics,
    challenge_metrics: ChallengeMetrics,
    veto_metrics: VetoMetrics,
    match_metrics: MatchMetrics,
    performance_metrics: PerformanceMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Outbound events by kind and outcome
    pub events_published_total: IntCounterVec,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

/// Queue metrics
#[derive(Clone)]
pub struct QueueMetrics {
    /// Players, teams and solos currently queued
    pub waiting: IntGaugeVec,

    /// Join/leave attempts by outcome
    pub operations_total: IntCounterVec,

    /// Times the queue lock could not be acquired in time
    pub lock_contention_total: IntCounterVec,
}

/// Match formation metrics
#[derive(Clone)]
pub struct FormationMetrics {
    pub passes_total: IntCounter,

    /// Matches formed by pairing kind
    pub matches_formed_total: IntCounterVec,

    /// Passes aborted without touching the queue
    pub aborted_total: IntCounterVec,
}

/// Challenge metrics
#[derive(Clone)]
pub struct ChallengeMetrics {
    /// Transitions by target status
    pub transitions_total: IntCounterVec,
}

/// Map veto metrics
#[derive(Clone)]
pub struct VetoMetrics {
    /// Bans by how the caller was authorised
    pub bans_total: IntCounterVec,

    pub completed_total: IntCounter,

    pub timed_out_total: IntCounter,

    pub duration_seconds: Histogram,
}

/// Match lifecycle metrics
#[derive(Clone)]
pub struct MatchMetrics {
    /// Matches handed to the hosting provider
    pub started_total: IntCounterVec,

    /// Start failures by step
    pub start_failures_total: IntCounterVec,

    /// Finished matches by outcome
    pub finished_total: IntCounterVec,

    pub connection_timeouts_total: IntCounter,

    pub active: IntGauge,
}

/// Performance metrics
#[derive(Clone)]
pub struct PerformanceMetrics {
    /// Engine operation durations
    pub operation_duration: HistogramVec,

    /// Hosting API call durations
    pub hosting_call_duration: HistogramVec,

    /// Rating calculation time
    pub rating_calculation_duration: Histogram,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        Ok(Self {
            service_metrics: ServiceMetrics::new(&registry)?,
            queue_metrics: QueueMetrics::new(&registry)?,
            formation_metrics: FormationMetrics::new(&registry)?,
            challenge_metrics: ChallengeMetrics::new(&registry)?,
            veto_metrics: VetoMetrics::new(&registry)?,
            match_metrics: MatchMetrics::new(&registry)?,
            performance_metrics: PerformanceMetrics::new(&registry)?,
            registry,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    pub fn queue(&self) -> &QueueMetrics {
        &self.queue_metrics
    }

    pub fn formation(&self) -> &FormationMetrics {
        &self.formation_metrics
    }

    pub fn challenge(&self) -> &ChallengeMetrics {
        &self.challenge_metrics
    }

    pub fn veto(&self) -> &VetoMetrics {
        &self.veto_metrics
    }

    pub fn matches(&self) -> &MatchMetrics {
        &self.match_metrics
    }

    pub fn performance(&self) -> &PerformanceMetrics {
        &self.performance_metrics
    }

    /// Record a queue join or leave and its outcome
    pub fn record_queue_operation(&self, operation: &str, outcome: &str) {
        self.queue_metrics
            .operations_total
            .with_label_values(&[operation, outcome])
            .inc();
    }

    pub fn record_lock_contention(&self, operation: &str) {
        self.queue_metrics
            .lock_contention_total
            .with_label_values(&[operation])
            .inc();
    }

    pub fn update_queue_counts(&self, count: QueueCount) {
        let waiting = &self.queue_metrics.waiting;
        waiting
            .with_label_values(&["players"])
            .set(count.players as i64);
        waiting.with_label_values(&["teams"]).set(count.teams as i64);
        waiting.with_label_values(&["solos"]).set(count.solos as i64);
    }

    pub fn record_formation_pass(&self) {
        self.formation_metrics.passes_total.inc();
    }

    pub fn record_match_formed(&self, kind: PairingKind) {
        self.formation_metrics
            .matches_formed_total
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn record_formation_aborted(&self, reason: &str) {
        self.formation_metrics
            .aborted_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn record_challenge_transition(&self, status: ChallengeStatus) {
        self.challenge_metrics
            .transitions_total
            .with_label_values(&[status.as_str()])
            .inc();
    }

    /// `relaxed` is true when the turn deadline let the other leader ban
    pub fn record_ban(&self, relaxed: bool) {
        let authorization = if relaxed { "timeout" } else { "turn" };
        self.veto_metrics
            .bans_total
            .with_label_values(&[authorization])
            .inc();
    }

    pub fn record_veto_completed(&self, duration: Duration) {
        self.veto_metrics.completed_total.inc();
        self.veto_metrics
            .duration_seconds
            .observe(duration.as_secs_f64());
    }

    pub fn record_veto_timed_out(&self) {
        self.veto_metrics.timed_out_total.inc();
    }

    /// `source` is "veto" when a veto picked the map, "direct" otherwise
    pub fn record_match_started(&self, source: &str) {
        self.match_metrics
            .started_total
            .with_label_values(&[source])
            .inc();
        self.match_metrics.active.inc();
    }

    pub fn record_match_start_failure(&self, step: &str) {
        self.match_metrics
            .start_failures_total
            .with_label_values(&[step])
            .inc();
    }

    pub fn record_match_finished(&self, outcome: &str) {
        self.match_metrics
            .finished_total
            .with_label_values(&[outcome])
            .inc();
        self.match_metrics.active.dec();
    }

    pub fn record_connection_timeout(&self) {
        self.match_metrics.connection_timeouts_total.inc();
    }

    pub fn record_hosting_call(&self, call: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "error" };
        self.performance_metrics
            .hosting_call_duration
            .with_label_values(&[call, status])
            .observe(duration.as_secs_f64());
    }

    pub fn record_operation(&self, operation: &str, duration: Duration) {
        self.performance_metrics
            .operation_duration
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    /// Record rating calculation duration
    pub fn record_rating_calculation(&self, duration: Duration) {
        self.performance_metrics
            .rating_calculation_duration
            .observe(duration.as_secs_f64());
    }

    pub fn record_event_published(&self, kind: &str, success: bool) {
        let status = if success { "success" } else { "error" };
        self.service_metrics
            .events_published_total
            .with_label_values(&[kind, status])
            .inc();
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds =
            IntGauge::new("scrim_room_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let events_published_total = IntCounterVec::new(
            Opts::new(
                "scrim_room_events_published_total",
                "Outbound events published",
            ),
            &["kind", "status"],
        )?;
        registry.register(Box::new(events_published_total.clone()))?;

        let health_status = IntGauge::new(
            "scrim_room_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("scrim_room_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            events_published_total,
            health_status,
            component_health,
        })
    }
}

impl QueueMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let waiting = IntGaugeVec::new(
            Opts::new("scrim_room_queue_waiting", "Entries currently queued"),
            &["kind"],
        )?;
        registry.register(Box::new(waiting.clone()))?;

        let operations_total = IntCounterVec::new(
            Opts::new(
                "scrim_room_queue_operations_total",
                "Queue joins and leaves by outcome",
            ),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        let lock_contention_total = IntCounterVec::new(
            Opts::new(
                "scrim_room_queue_lock_contention_total",
                "Queue lock acquisitions that timed out",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(lock_contention_total.clone()))?;

        Ok(Self {
            waiting,
            operations_total,
            lock_contention_total,
        })
    }
}

impl FormationMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let passes_total = IntCounter::new(
            "scrim_room_formation_passes_total",
            "Match formation passes run",
        )?;
        registry.register(Box::new(passes_total.clone()))?;

        let matches_formed_total = IntCounterVec::new(
            Opts::new(
                "scrim_room_matches_formed_total",
                "Matches formed from the queue",
            ),
            &["pairing"],
        )?;
        registry.register(Box::new(matches_formed_total.clone()))?;

        let aborted_total = IntCounterVec::new(
            Opts::new(
                "scrim_room_formation_aborted_total",
                "Formation passes aborted",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(aborted_total.clone()))?;

        Ok(Self {
            passes_total,
            matches_formed_total,
            aborted_total,
        })
    }
}

impl ChallengeMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let transitions_total = IntCounterVec::new(
            Opts::new(
                "scrim_room_challenge_transitions_total",
                "Challenge status transitions",
            ),
            &["status"],
        )?;
        registry.register(Box::new(transitions_total.clone()))?;

        Ok(Self { transitions_total })
    }
}

impl VetoMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let bans_total = IntCounterVec::new(
            Opts::new("scrim_room_veto_bans_total", "Map bans recorded"),
            &["authorization"],
        )?;
        registry.register(Box::new(bans_total.clone()))?;

        let completed_total = IntCounter::new(
            "scrim_room_veto_completed_total",
            "Map vetoes that reached a final map",
        )?;
        registry.register(Box::new(completed_total.clone()))?;

        let timed_out_total = IntCounter::new(
            "scrim_room_veto_timed_out_total",
            "Map vetoes cancelled by the overall timeout",
        )?;
        registry.register(Box::new(timed_out_total.clone()))?;

        let duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "scrim_room_veto_duration_seconds",
                "Time from veto start to final map",
            )
            .buckets(vec![15.0, 30.0, 60.0, 120.0, 240.0, 360.0, 600.0]),
        )?;
        registry.register(Box::new(duration_seconds.clone()))?;

        Ok(Self {
            bans_total,
            completed_total,
            timed_out_total,
            duration_seconds,
        })
    }
}

impl MatchMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let started_total = IntCounterVec::new(
            Opts::new("scrim_room_matches_started_total", "Matches started"),
            &["source"],
        )?;
        registry.register(Box::new(started_total.clone()))?;

        let start_failures_total = IntCounterVec::new(
            Opts::new(
                "scrim_room_match_start_failures_total",
                "Match starts that failed",
            ),
            &["step"],
        )?;
        registry.register(Box::new(start_failures_total.clone()))?;

        let finished_total = IntCounterVec::new(
            Opts::new("scrim_room_matches_finished_total", "Matches finished"),
            &["outcome"],
        )?;
        registry.register(Box::new(finished_total.clone()))?;

        let connection_timeouts_total = IntCounter::new(
            "scrim_room_connection_timeouts_total",
            "Matches cancelled because players did not connect",
        )?;
        registry.register(Box::new(connection_timeouts_total.clone()))?;

        let active = IntGauge::new("scrim_room_active_matches", "Matches currently running")?;
        registry.register(Box::new(active.clone()))?;

        Ok(Self {
            started_total,
            start_failures_total,
            finished_total,
            connection_timeouts_total,
            active,
        })
    }
}

impl PerformanceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "scrim_room_operation_duration_seconds",
                "Engine operation duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        let hosting_call_duration = HistogramVec::new(
            HistogramOpts::new(
                "scrim_room_hosting_call_duration_seconds",
                "Hosting API call duration",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["call", "status"],
        )?;
        registry.register(Box::new(hosting_call_duration.clone()))?;

        let rating_calculation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "scrim_room_rating_calculation_duration_seconds",
                "Rating calculation time",
            )
            .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1]),
        )?;
        registry.register(Box::new(rating_calculation_duration.clone()))?;

        Ok(Self {
            operation_duration,
            hosting_call_duration,
            rating_calculation_duration,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics collector")
    }
}
