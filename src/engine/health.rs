//! Health, stall, and consistency diagnostics. Observability only; none
//! of these gate acquisition.

use std::sync::atomic::Ordering;

use serde::Serialize;
use tracing::{debug, warn};

use crate::engine::{AcquisitionEngine, EngineError};

/// Ids per score-lookup round-trip when walking the registry.
const SCORE_CHUNK: usize = 100;

/// Scheduling-health summary for one instance.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Largest now-minus-score among waiting entries this instance could
    /// run right now. Working-set overrun is deliberately excluded: a
    /// stuck agent is a zombie-cleanup concern and counting it here only
    /// produces false scheduling alarms.
    pub oldest_overdue_seconds: f64,
    pub degraded: bool,
    pub registered: usize,
    pub active: usize,
}

/// Result of sampling the waiting set for members that are also in
/// working. Conflicts are impossible unless the store is broken.
#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub sampled: usize,
    pub conflicts: Vec<String>,
}

impl AcquisitionEngine {
    /// Summarize scheduling health from the waiting scores of locally
    /// runnable agents.
    pub async fn health_snapshot(&self) -> Result<HealthSnapshot, EngineError> {
        let now = self.now_score().await;
        let ids: Vec<String> = self
            .registry
            .iter()
            .filter(|e| self.is_enabled(e.key()) && self.shard.owns(e.key()))
            .map(|e| e.key().clone())
            .collect();

        let mut oldest = 0.0f64;
        for chunk in ids.chunks(SCORE_CHUNK) {
            let scores = self.store.scores(chunk).await?;
            for entry in scores {
                if let Some(waiting) = entry.waiting {
                    if waiting <= now {
                        oldest = oldest.max(now - waiting);
                    }
                }
            }
        }

        let degraded = self
            .min_enabled_period_secs()
            .is_some_and(|min_period| oldest >= min_period);
        if let Some(metrics) = &self.metrics {
            metrics.set_oldest_overdue(oldest);
        }
        Ok(HealthSnapshot {
            oldest_overdue_seconds: oldest,
            degraded,
            registered: self.registry.len(),
            active: self.run_states.len(),
        })
    }

    fn min_enabled_period_secs(&self) -> Option<f64> {
        self.registry
            .iter()
            .filter(|e| self.is_enabled(e.key()))
            .map(|e| self.intervals.interval_for(e.key()).period.as_secs_f64())
            .min_by(f64::total_cmp)
    }

    /// Sample the head of the waiting set and flag any member that is
    /// also present in working.
    pub async fn check_consistency(&self, sample: usize) -> Result<ConsistencyReport, EngineError> {
        let head = self.store.waiting_head(sample).await?;
        let ids: Vec<String> = head.into_iter().map(|(id, _)| id).collect();
        let scores = self.store.scores(&ids).await?;
        let conflicts: Vec<String> = scores
            .into_iter()
            .filter(|s| s.waiting.is_some() && s.working.is_some())
            .map(|s| s.agent_id)
            .collect();
        if !conflicts.is_empty() {
            warn!(
                sampled = ids.len(),
                conflicts = conflicts.len(),
                "consistency: ids present in both sets"
            );
        }
        Ok(ConsistencyReport { sampled: ids.len(), conflicts })
    }

    /// Rate-limited look at why a cycle acquired nothing, separating an
    /// empty backlog from one this instance cannot run. Diagnostic only;
    /// acquisition keeps attempting its full scan regardless of what the
    /// sample here shows.
    pub(crate) async fn log_stall_diagnostics(&self, now: f64) {
        let now_ms = (now * 1000.0) as i64;
        let last = self.last_stall_log_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(last) < self.config.stall_log_period_ms {
            return;
        }
        if self
            .last_stall_log_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let head = match self.store.waiting_head(self.config.stall_sample).await {
            Ok(head) => head,
            Err(err) => {
                debug!(error = %err, "stall: head scan failed");
                return;
            }
        };
        if head.is_empty() {
            debug!("stall: waiting set empty, nothing to acquire");
            return;
        }

        let local_now = |id: &str| {
            self.registry.contains_key(id) && self.is_enabled(id) && self.shard.owns(id)
        };
        let eligible = head.iter().filter(|(id, score)| *score <= now && local_now(id)).count();
        if eligible > 0 {
            warn!(
                sample = head.len(),
                eligible,
                "stall: due local agents present but none acquired this cycle"
            );
            return;
        }
        match head.iter().find(|(id, _)| local_now(id)) {
            Some((agent_id, score)) => {
                debug!(
                    agent = %agent_id,
                    due_in_seconds = score - now,
                    "stall: next local agent not due yet"
                );
            }
            None => {
                debug!(sample = head.len(), "stall: waiting backlog belongs to other instances");
            }
        }
    }
}
