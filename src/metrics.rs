//! Prometheus metrics for the scheduler.
//!
//! This module provides:
//! - Prometheus metrics using the `prometheus` crate
//! - Pre-defined metric instruments for the acquisition cycle
//! - An HTTP server for the `/metrics` endpoint
//!
//! # Usage
//!
//! Initialize metrics once at startup:
//! ```ignore
//! let metrics = dispatch::metrics::init()?;
//! ```
//!
//! Then start the metrics server:
//! ```ignore
//! dispatch::metrics::run_metrics_server(addr, metrics.clone(), shutdown_rx).await;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{
    core::Collector, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec,
    Opts, Registry, TextEncoder,
};
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::breaker::BreakerState;

/// Default histogram buckets for store round-trip latencies (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Scheduler metrics handle containing all metric instruments.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Cycle metrics
    cycles: Counter,
    acquire_attempts: Counter,
    acquired: CounterVec,
    acquire_duration: HistogramVec,
    fallback_events: Counter,

    // Circuit breaker metrics
    breaker_blocked: CounterVec,
    breaker_state: GaugeVec,

    // Repopulation metrics
    repopulation_runs: Counter,
    repopulation_added: Counter,
    repopulation_deferred: Counter,

    // Completion metrics
    completions: CounterVec,
    release_noops: Counter,
    recovery_retries: Counter,
    recovery_drops: Counter,
    permit_release_contention: Counter,
    deadman_fired: Counter,

    // Registry gauges
    active_agents: Gauge,
    registered_agents: Gauge,
    oldest_overdue_seconds: Gauge,
}

impl Metrics {
    /// Get the prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one acquisition cycle starting.
    pub fn record_cycle(&self) {
        self.cycles.inc();
    }

    /// Record an acquisition attempt (counted even when capacity is zero).
    pub fn record_acquire_attempt(&self) {
        self.acquire_attempts.inc();
    }

    /// Record agents acquired under a given mode (`batch`, `individual`,
    /// `fallback`).
    pub fn record_acquired(&self, mode: &str, count: usize) {
        self.acquired.with_label_values(&[mode]).inc_by(count as f64);
    }

    /// Record the wall time of one acquisition pass.
    pub fn record_acquire_duration(&self, mode: &str, elapsed: Duration) {
        self.acquire_duration
            .with_label_values(&[mode])
            .observe(elapsed.as_secs_f64());
    }

    /// Record a batch-to-individual fallback. At most once per cycle.
    pub fn record_fallback_event(&self) {
        self.fallback_events.inc();
    }

    /// Record a call short-circuited by an open breaker.
    pub fn record_breaker_blocked(&self, breaker: &str) {
        self.breaker_blocked.with_label_values(&[breaker]).inc();
    }

    /// Publish a breaker's state (0 closed, 1 open, 2 half-open).
    pub fn set_breaker_state(&self, breaker: &str, state: BreakerState) {
        let value = match state {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        };
        self.breaker_state.with_label_values(&[breaker]).set(value);
    }

    /// Record one repopulation pass and how many agents it re-seeded.
    pub fn record_repopulation(&self, added: usize) {
        self.repopulation_runs.inc();
        self.repopulation_added.inc_by(added as f64);
    }

    /// Record a cycle that skipped acquisition because repopulation
    /// re-seeded agents.
    pub fn record_repopulation_deferred_acquisition(&self) {
        self.repopulation_deferred.inc();
    }

    /// Record a processed completion by outcome (`success`, `failed`,
    /// `aborted`).
    pub fn record_completion(&self, outcome: &str) {
        self.completions.with_label_values(&[outcome]).inc();
    }

    /// Record a release skipped because the working score changed hands.
    pub fn record_release_noop(&self) {
        self.release_noops.inc();
    }

    /// Record a deferred-release retry attempt.
    pub fn record_recovery_retry(&self) {
        self.recovery_retries.inc();
    }

    /// Record a deferred release dropped after exhausting its attempts.
    pub fn record_recovery_drop(&self) {
        self.recovery_drops.inc();
    }

    /// Record a permit release that lost the flag race.
    pub fn record_permit_release_contention(&self) {
        self.permit_release_contention.inc();
    }

    /// Record a dead-man timer firing.
    pub fn record_deadman_fired(&self) {
        self.deadman_fired.inc();
    }

    /// Update the in-flight agent count.
    pub fn set_active(&self, count: usize) {
        self.active_agents.set(count as f64);
    }

    /// Update the registered agent count.
    pub fn set_registered(&self, count: usize) {
        self.registered_agents.set(count as f64);
    }

    /// Update the oldest-overdue health gauge.
    pub fn set_oldest_overdue(&self, seconds: f64) {
        self.oldest_overdue_seconds.set(seconds);
    }
}

/// Helper to register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        // Log but don't fail - metric may already be registered
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Initialize the metrics system with a Prometheus registry.
///
/// Returns a `Metrics` handle that can be cloned and passed to components.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    // Cycle metrics
    let cycles = register(
        &registry,
        Counter::new("dispatch_cycles_total", "Total number of acquisition cycles run")?,
    );

    let acquire_attempts = register(
        &registry,
        Counter::new(
            "dispatch_acquire_attempts_total",
            "Total number of acquisition attempts, including zero-capacity cycles",
        )?,
    );

    let acquired = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "dispatch_acquired_total",
                "Total number of agents acquired, by acquisition mode",
            ),
            &["mode"],
        )?,
    );

    let acquire_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "dispatch_acquire_duration_seconds",
                "Wall time of one acquisition pass against the store",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["mode"],
        )?,
    );

    let fallback_events = register(
        &registry,
        Counter::new(
            "dispatch_fallback_events_total",
            "Cycles that fell back from batch to individual acquisition",
        )?,
    );

    // Circuit breaker metrics
    let breaker_blocked = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "dispatch_breaker_blocked_total",
                "Calls short-circuited by an open circuit breaker",
            ),
            &["breaker"],
        )?,
    );

    let breaker_state = register(
        &registry,
        GaugeVec::new(
            Opts::new(
                "dispatch_breaker_state",
                "Circuit breaker state (0 closed, 1 open, 2 half-open)",
            ),
            &["breaker"],
        )?,
    );

    // Repopulation metrics
    let repopulation_runs = register(
        &registry,
        Counter::new("dispatch_repopulation_runs_total", "Total repopulation passes")?,
    );

    let repopulation_added = register(
        &registry,
        Counter::new(
            "dispatch_repopulation_added_total",
            "Agents re-seeded into the waiting set by repopulation",
        )?,
    );

    let repopulation_deferred = register(
        &registry,
        Counter::new(
            "dispatch_repopulation_deferred_acquisition_total",
            "Cycles that skipped acquisition because repopulation re-seeded agents",
        )?,
    );

    // Completion metrics
    let completions = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "dispatch_completions_total",
                "Processed run completions (success, failed, aborted)",
            ),
            &["outcome"],
        )?,
    );

    let release_noops = register(
        &registry,
        Counter::new(
            "dispatch_release_noops_total",
            "Releases skipped because the working score had changed hands",
        )?,
    );

    let recovery_retries = register(
        &registry,
        Counter::new(
            "dispatch_recovery_retries_total",
            "Retry attempts for store releases that previously failed",
        )?,
    );

    let recovery_drops = register(
        &registry,
        Counter::new(
            "dispatch_recovery_drops_total",
            "Deferred releases dropped after exhausting their retry budget",
        )?,
    );

    let permit_release_contention = register(
        &registry,
        Counter::new(
            "dispatch_permit_release_contention_total",
            "Permit releases that lost the exactly-once flag race",
        )?,
    );

    let deadman_fired = register(
        &registry,
        Counter::new(
            "dispatch_deadman_fired_total",
            "Dead-man timers that fired and aborted their worker",
        )?,
    );

    // Registry gauges
    let active_agents = register(
        &registry,
        Gauge::new("dispatch_active_agents", "Agents currently executing on this instance")?,
    );

    let registered_agents = register(
        &registry,
        Gauge::new("dispatch_registered_agents", "Agents in the local registry")?,
    );

    let oldest_overdue_seconds = register(
        &registry,
        Gauge::new(
            "dispatch_oldest_overdue_seconds",
            "Largest now-minus-score among locally runnable waiting entries",
        )?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        cycles,
        acquire_attempts,
        acquired,
        acquire_duration,
        fallback_events,
        breaker_blocked,
        breaker_state,
        repopulation_runs,
        repopulation_added,
        repopulation_deferred,
        completions,
        release_noops,
        recovery_retries,
        recovery_drops,
        permit_release_contention,
        deadman_fired,
        active_agents,
        registered_agents,
        oldest_overdue_seconds,
    })
}

/// Axum handler for the `/metrics` endpoint.
async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

/// Run the Prometheus metrics HTTP server.
///
/// Listens on the given address and serves metrics at `/metrics`.
/// Shuts down gracefully when shutdown signal is received.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "metrics server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            debug!("metrics server shutting down");
        })
        .await?;

    Ok(())
}
