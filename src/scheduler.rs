//! Periodic driver that ticks the acquisition engine and handles graceful
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::engine::AcquisitionEngine;

/// Cycles between periodic health log lines.
const HEALTH_LOG_EVERY: u64 = 60;

pub struct Scheduler {
    engine: Arc<AcquisitionEngine>,
    cycle_interval: Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<AcquisitionEngine>, cycle_interval: Duration) -> Self {
        Self { engine, cycle_interval }
    }

    /// Tick the engine until `shutdown` flips to true (or its sender is
    /// dropped), then stop acquiring, hand in-flight agents back to the
    /// fleet, and return.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycle_id: u64 = 0;

        info!(interval_ms = self.cycle_interval.as_millis() as u64, "scheduler: started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    cycle_id += 1;
                    self.engine.saturate_pool(cycle_id, None).await;
                    if cycle_id % HEALTH_LOG_EVERY == 0 {
                        self.log_health(cycle_id).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown().await;
    }

    async fn log_health(&self, cycle_id: u64) {
        let stats = self.engine.stats();
        match self.engine.health_snapshot().await {
            Ok(health) => info!(
                cycle = cycle_id,
                oldest_overdue_seconds = health.oldest_overdue_seconds,
                degraded = health.degraded,
                registered = health.registered,
                active = health.active,
                acquired_total = stats.acquired,
                success_rate = stats.success_rate,
                "scheduler: health"
            ),
            Err(err) => warn!(cycle = cycle_id, error = %err, "scheduler: health check failed"),
        }
    }

    async fn shutdown(&self) {
        info!("scheduler: shutting down");
        self.engine.begin_shutdown();
        let released = self.engine.force_requeue_inflight().await;
        let stats = self.engine.stats();
        info!(
            released,
            cycles = stats.cycles,
            acquired = stats.acquired,
            succeeded = stats.succeeded,
            failed = stats.failed,
            uptime_secs = stats.uptime_secs,
            "scheduler: stopped"
        );
    }
}
