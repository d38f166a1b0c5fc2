//! The acquisition cycle.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::Instrument;
use tracing::{debug, info, info_span, warn};

use crate::engine::AcquisitionEngine;

impl AcquisitionEngine {
    /// Run one acquisition cycle and return how many agents were acquired.
    ///
    /// Phases, in order: repopulate when due, drain completions, drain
    /// deferred-release retries, then acquire up to the free capacity
    /// (bounded further by `capacity_limit` when supplied) and submit a
    /// worker per acquired agent. Never returns an error; store and
    /// breaker trouble degrade the cycle to zero acquired.
    ///
    /// Repopulation and acquisition are mutually exclusive: a cycle whose
    /// repopulation actually re-seeded missing agents skips acquisition so
    /// the fresh entries are claimed by score order on the next cycle
    /// rather than in this cycle's registry iteration order.
    pub async fn saturate_pool(self: &Arc<Self>, cycle_id: u64, capacity_limit: Option<usize>) -> usize {
        let span = info_span!("engine.cycle", cycle = cycle_id);
        async {
            self.stats.cycles.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.record_cycle();
                metrics.record_acquire_attempt();
            }
            let started = Instant::now();
            let now = self.now_score().await;
            let now_ms = (now * 1000.0) as i64;
            debug!(
                cycle = cycle_id,
                registered = self.registry.len(),
                active = self.run_states.len(),
                "cycle: start"
            );

            let repopulated = self.repopulate_if_due(now_ms, now).await;

            self.drain_completions(now).await;
            self.drain_recoveries().await;

            if let Some(added) = repopulated {
                if added > 0 {
                    info!(cycle = cycle_id, added, "cycle: repopulated, acquisition deferred");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_repopulation_deferred_acquisition();
                    }
                    self.finish_cycle(0);
                    return 0;
                }
            }

            if self.is_shutting_down() {
                debug!(cycle = cycle_id, "cycle: shutting down, no acquisition");
                self.finish_cycle(0);
                return 0;
            }

            let mut capacity = self.permits.available_permits();
            if let Some(limit) = capacity_limit {
                capacity = capacity.min(limit);
            }
            if capacity == 0 {
                debug!(
                    cycle = cycle_id,
                    active = self.run_states.len(),
                    "cycle: no capacity"
                );
                self.finish_cycle(0);
                return 0;
            }

            if !self.acquisition_breaker.allow() {
                warn!(cycle = cycle_id, "cycle: acquisition breaker open, skipping");
                if let Some(metrics) = &self.metrics {
                    metrics.record_breaker_blocked(self.acquisition_breaker.name());
                }
                self.finish_cycle(0);
                return 0;
            }

            let candidates = self.eligible_candidates(now);
            if candidates.is_empty() {
                debug!(cycle = cycle_id, "cycle: no eligible candidates");
                self.finish_cycle(0);
                return 0;
            }

            let (acquired, mode) = if self.config.batch_enabled {
                self.acquire_batch_mode(now, capacity, &candidates).await
            } else {
                self.acquire_individual_mode(now, capacity, &candidates, "individual").await
            };

            for (agent_id, deadline) in &acquired {
                self.submit_run(agent_id, *deadline, now_ms);
            }

            let count = acquired.len();
            self.stats.acquired.fetch_add(count as u64, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.record_acquired(mode, count);
                metrics.record_acquire_duration(mode, started.elapsed());
                metrics.set_active(self.run_states.len());
            }
            if count == 0 {
                self.log_stall_diagnostics(now).await;
            }
            debug!(cycle = cycle_id, acquired = count, mode, "cycle: done");
            self.finish_cycle(count);
            count
        }
        .instrument(span)
        .await
    }

    fn finish_cycle(&self, _acquired: usize) {
        if let Some(metrics) = &self.metrics {
            let status = self.breaker_status();
            metrics.set_breaker_state(self.store_breaker.name(), status.store);
            metrics.set_breaker_state(self.acquisition_breaker.name(), status.acquisition);
            metrics.set_active(self.run_states.len());
        }
    }
}
