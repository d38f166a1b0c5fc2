//! Completion and recovery drains plus the reschedule math for finished
//! runs. All store writes for finished runs happen here, on the cycle,
//! never on worker tasks.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::agent::AgentRegistration;
use crate::classify::FailureKind;
use crate::engine::run_state::{CompletionOutcome, CompletionRecord, RecoveryRecord, RunState};
use crate::engine::AcquisitionEngine;

impl AcquisitionEngine {
    /// Terminal bookkeeping for one run. Called exactly once per guard,
    /// from whichever thread drops it, so it stays synchronous and cheap;
    /// the store write is deferred to the next cycle via the completion
    /// queue.
    pub(crate) fn finalize_run(
        &self,
        state: &RunState,
        registration: Arc<AgentRegistration>,
        outcome: CompletionOutcome,
        elapsed: Duration,
    ) {
        state.cancel_deadman();
        self.run_states
            .remove_if(&state.agent_id, |_, current| current.generation == state.generation);
        if state.try_release_permit() {
            self.permits.add_permits(1);
        } else if let Some(metrics) = &self.metrics {
            metrics.record_permit_release_contention();
        }
        self.completions.push(CompletionRecord {
            agent_id: state.agent_id.clone(),
            generation: state.generation,
            registration,
            outcome,
            elapsed,
            acquired_deadline: state.acquired_deadline,
        });
        if let Some(metrics) = &self.metrics {
            metrics.set_active(self.run_states.len());
        }
    }

    pub(crate) async fn drain_completions(&self, now: f64) {
        while let Some(record) = self.completions.pop() {
            self.process_completion(record, now).await;
        }
    }

    async fn process_completion(&self, record: CompletionRecord, now: f64) {
        let agent_id = record.agent_id.as_str();
        let new_score = match &record.outcome {
            CompletionOutcome::Success => {
                self.failure_streaks.remove(agent_id);
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                let score = self.success_score(agent_id, record.acquired_deadline, now);
                debug!(
                    agent = agent_id,
                    generation = record.generation,
                    elapsed_ms = record.elapsed.as_millis() as u64,
                    score,
                    "completion: success"
                );
                score
            }
            CompletionOutcome::Failed { kind, message } => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let streak = self.bump_failure_streak(agent_id);
                let backoff_ms = self.failure_backoff_ms(agent_id, *kind, streak);
                warn!(
                    agent = agent_id,
                    kind = %kind,
                    streak,
                    backoff_ms,
                    error = %message,
                    "completion: run failed"
                );
                now + backoff_ms as f64 / 1000.0
            }
            CompletionOutcome::Aborted => {
                // Cancelled by the dead-man timer or shutdown. Not a
                // provider failure, so the streak is left alone.
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let backoff_ms = self.error_interval_ms(agent_id);
                warn!(
                    agent = agent_id,
                    generation = record.generation,
                    backoff_ms,
                    "completion: run aborted"
                );
                now + backoff_ms as f64 / 1000.0
            }
        };

        match self
            .store
            .conditional_release(agent_id, record.acquired_deadline, new_score)
            .await
        {
            Ok(true) => {
                self.store_breaker.record_success();
            }
            Ok(false) => {
                self.store_breaker.record_success();
                debug!(
                    agent = agent_id,
                    expected = record.acquired_deadline,
                    "completion: working score changed hands, release skipped"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_release_noop();
                }
            }
            Err(err) => {
                self.record_store_failure(&err);
                warn!(agent = agent_id, error = %err, "completion: release failed, queued for retry");
                self.recoveries.push(RecoveryRecord {
                    agent_id: agent_id.to_string(),
                    expected_working: record.acquired_deadline,
                    new_waiting: new_score,
                    attempts: 1,
                });
            }
        }

        match &record.outcome {
            CompletionOutcome::Success => {
                record.registration.hooks.completed(agent_id, record.elapsed).await;
            }
            CompletionOutcome::Failed { kind, .. } => {
                record.registration.hooks.failed(agent_id, *kind, record.elapsed).await;
            }
            CompletionOutcome::Aborted => {
                record
                    .registration
                    .hooks
                    .failed(agent_id, FailureKind::Unknown, record.elapsed)
                    .await;
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_completion(record.outcome.as_str());
        }
    }

    /// Retry deferred releases, dropping records that have exhausted
    /// their attempts. The store entry then stays in working until the
    /// external zombie cleanup reclaims it.
    pub(crate) async fn drain_recoveries(&self) {
        let pending: Vec<RecoveryRecord> = std::iter::from_fn(|| self.recoveries.pop()).collect();
        for mut record in pending {
            if let Some(metrics) = &self.metrics {
                metrics.record_recovery_retry();
            }
            match self
                .store
                .conditional_release(&record.agent_id, record.expected_working, record.new_waiting)
                .await
            {
                Ok(released) => {
                    self.store_breaker.record_success();
                    if released {
                        debug!(agent = %record.agent_id, attempts = record.attempts, "recovery: released");
                    } else {
                        debug!(agent = %record.agent_id, "recovery: ownership changed, dropping");
                        if let Some(metrics) = &self.metrics {
                            metrics.record_release_noop();
                        }
                    }
                }
                Err(err) => {
                    self.record_store_failure(&err);
                    record.attempts += 1;
                    if record.attempts >= self.config.max_recovery_attempts {
                        warn!(
                            agent = %record.agent_id,
                            attempts = record.attempts,
                            error = %err,
                            "recovery: giving up, leaving entry for external cleanup"
                        );
                        if let Some(metrics) = &self.metrics {
                            metrics.record_recovery_drop();
                        }
                    } else {
                        self.recoveries.push(record);
                    }
                }
            }
        }
    }

    fn bump_failure_streak(&self, agent_id: &str) -> u32 {
        let mut entry = self.failure_streaks.entry(agent_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Next waiting score after a success: the original acquire time
    /// (deadline minus timeout) plus the period, floored at now. Keeping
    /// the cadence anchored to acquire time stops long runs from drifting
    /// the schedule forward.
    fn success_score(&self, agent_id: &str, acquired_deadline: f64, now: f64) -> f64 {
        let interval = self.intervals.interval_for(agent_id);
        let original_acquire = acquired_deadline - interval.timeout.as_secs_f64();
        (original_acquire + interval.period.as_secs_f64()).max(now)
    }

    /// Backoff in milliseconds for a classified failure. Throttling grows
    /// exponentially with the streak up to a cap; transient faults retry
    /// immediately until the streak exceeds the immediate-retry budget;
    /// everything else waits out the error interval. Positive backoffs
    /// get symmetric jitter and are rounded up to whole seconds so score
    /// truncation never undershoots.
    fn failure_backoff_ms(&self, agent_id: &str, kind: FailureKind, streak: u32) -> i64 {
        let raw = match kind {
            FailureKind::Throttled => {
                let factor =
                    self.backoff.throttle_multiplier.powi(streak.saturating_sub(1) as i32);
                ((self.backoff.throttle_base_ms as f64 * factor).round() as i64)
                    .min(self.backoff.throttle_max_ms)
            }
            FailureKind::Transient => {
                if streak <= self.backoff.max_immediate_retries {
                    0
                } else {
                    self.error_interval_ms(agent_id)
                }
            }
            FailureKind::Unknown => self.error_interval_ms(agent_id),
        };
        if raw <= 0 {
            return 0;
        }
        let jittered = apply_jitter(raw, self.backoff.jitter_ratio);
        (jittered + 999) / 1000 * 1000
    }

    pub(crate) fn error_interval_ms(&self, agent_id: &str) -> i64 {
        self.intervals
            .interval_for(agent_id)
            .error_period
            .map(|d| d.as_millis() as i64)
            .unwrap_or(self.backoff.error_interval_ms)
    }
}

fn apply_jitter(base_ms: i64, ratio: f64) -> i64 {
    if ratio <= 0.0 {
        return base_ms;
    }
    let ratio = ratio.min(1.0);
    let factor = 1.0 + rand::rng().random_range(-ratio..=ratio);
    ((base_ms as f64 * factor).round() as i64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::agent::{AgentInterval, IntervalPolicy, IntervalTable, UniformIntervals, UniversalShard};
    use crate::classify::FailureClassifier;
    use crate::settings::{BackoffConfig, EngineConfig};
    use crate::store::MemoryAgentStore;

    fn engine_with(
        backoff: BackoffConfig,
        intervals: Arc<dyn IntervalPolicy>,
    ) -> Arc<AcquisitionEngine> {
        let config = EngineConfig { backoff, ..EngineConfig::default() };
        AcquisitionEngine::new(
            Arc::new(MemoryAgentStore::new()),
            intervals,
            Arc::new(UniversalShard),
            FailureClassifier::default(),
            config,
            None,
        )
        .expect("engine")
    }

    fn flat_backoff() -> BackoffConfig {
        BackoffConfig {
            error_interval_ms: 60_000,
            throttle_base_ms: 10_000,
            throttle_multiplier: 2.0,
            throttle_max_ms: 35_500,
            max_immediate_retries: 2,
            jitter_ratio: 0.0,
        }
    }

    fn uniform(period_secs: u64, timeout_secs: u64) -> Arc<UniformIntervals> {
        Arc::new(UniformIntervals::new(AgentInterval::new(
            Duration::from_secs(period_secs),
            Duration::from_secs(timeout_secs),
        )))
    }

    #[test]
    fn jitter_stays_within_ratio() {
        for _ in 0..200 {
            let jittered = apply_jitter(10_000, 0.1);
            assert!((9_000..=11_000).contains(&jittered), "out of range: {jittered}");
        }
    }

    #[test]
    fn zero_ratio_is_identity() {
        assert_eq!(apply_jitter(10_000, 0.0), 10_000);
    }

    #[test]
    fn throttled_backoff_doubles_per_streak_up_to_the_cap() {
        let engine = engine_with(flat_backoff(), uniform(60, 10));

        assert_eq!(engine.failure_backoff_ms("a", FailureKind::Throttled, 1), 10_000);
        assert_eq!(engine.failure_backoff_ms("a", FailureKind::Throttled, 2), 20_000);
        // Capped at 35_500, then rounded up to a whole second.
        assert_eq!(engine.failure_backoff_ms("a", FailureKind::Throttled, 3), 36_000);
        assert_eq!(engine.failure_backoff_ms("a", FailureKind::Throttled, 9), 36_000);
    }

    #[test]
    fn transient_failures_spend_the_immediate_retry_budget_first() {
        let engine = engine_with(flat_backoff(), uniform(60, 10));

        assert_eq!(engine.failure_backoff_ms("a", FailureKind::Transient, 1), 0);
        assert_eq!(engine.failure_backoff_ms("a", FailureKind::Transient, 2), 0);
        assert_eq!(engine.failure_backoff_ms("a", FailureKind::Transient, 3), 60_000);
    }

    #[test]
    fn unknown_failures_honor_the_agent_error_period() {
        let mut table = IntervalTable::new(AgentInterval::new(
            Duration::from_secs(60),
            Duration::from_secs(10),
        ));
        table.insert(
            "special",
            AgentInterval::new(Duration::from_secs(60), Duration::from_secs(10))
                .with_error_period(Duration::from_secs(5)),
        );
        let engine = engine_with(flat_backoff(), Arc::new(table));

        assert_eq!(engine.failure_backoff_ms("plain", FailureKind::Unknown, 1), 60_000);
        assert_eq!(engine.failure_backoff_ms("special", FailureKind::Unknown, 1), 5_000);
    }

    #[test]
    fn jittered_backoff_rounds_up_to_whole_seconds() {
        let backoff = BackoffConfig { jitter_ratio: 0.1, ..flat_backoff() };
        let engine = engine_with(backoff, uniform(60, 10));

        for _ in 0..100 {
            let ms = engine.failure_backoff_ms("a", FailureKind::Unknown, 1);
            assert_eq!(ms % 1000, 0, "not whole seconds: {ms}");
            assert!((54_000..=66_000).contains(&ms), "out of jitter range: {ms}");
        }
    }

    #[test]
    fn success_score_is_anchored_to_the_acquire_time() {
        let engine = engine_with(flat_backoff(), uniform(100, 10));

        // Acquired at 1000 with a 10s execution window; next run keeps the
        // 100s cadence from the acquire time.
        assert_eq!(engine.success_score("a", 1010.0, 1050.0), 1100.0);
    }

    #[test]
    fn success_score_never_lands_in_the_past() {
        let engine = engine_with(flat_backoff(), uniform(100, 10));

        assert_eq!(engine.success_score("a", 1010.0, 1200.0), 1200.0);
    }

    #[test]
    fn failure_streak_counts_consecutive_failures() {
        let engine = engine_with(flat_backoff(), uniform(60, 10));

        assert_eq!(engine.bump_failure_streak("a"), 1);
        assert_eq!(engine.bump_failure_streak("a"), 2);
        assert_eq!(engine.bump_failure_streak("b"), 1);
    }
}
