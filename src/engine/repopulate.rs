//! Smart-sync repopulation: re-seed the waiting set from the local
//! registry without disturbing scores already in the store.

use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use crate::engine::AcquisitionEngine;

/// Ids per score-lookup round-trip. Bounds script argument size.
const REPOPULATE_CHUNK: usize = 100;

impl AcquisitionEngine {
    /// Run repopulation when the refresh period has elapsed (or on the
    /// first cycle ever). Returns `None` when not due or the store breaker
    /// is open, otherwise `Some(added)` with the number of agents
    /// re-seeded into the waiting set.
    pub(crate) async fn repopulate_if_due(&self, now_ms: i64, now: f64) -> Option<usize> {
        let last = self.last_repopulation_ms.load(Ordering::Acquire);
        let due = last == 0 || now_ms.saturating_sub(last) >= self.config.repopulate_interval_ms;
        if !due {
            return None;
        }
        if !self.store_breaker.allow() {
            debug!("repopulate: store breaker open, skipping");
            if let Some(metrics) = &self.metrics {
                metrics.record_breaker_blocked(self.store_breaker.name());
            }
            return None;
        }
        if self
            .last_repopulation_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        Some(self.repopulate(now).await)
    }

    /// One repopulation pass over the whole registry, chunked.
    ///
    /// For each chunk the current scores are fetched for both sets; ids
    /// present in neither are added to waiting at `now` plus a random
    /// jitter inside the configured window. Ids already present keep
    /// their score untouched, however overdue, since that backlog
    /// ordering is exactly what acquisition drains oldest-first.
    pub(crate) async fn repopulate(&self, now: f64) -> usize {
        let ids: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        let mut added_total = 0;

        for chunk in ids.chunks(REPOPULATE_CHUNK) {
            match self.store.scores(chunk).await {
                Ok(scores) => {
                    self.store_breaker.record_success();
                    let missing: Vec<(String, f64)> = scores
                        .into_iter()
                        .filter(|s| s.waiting.is_none() && s.working.is_none())
                        .map(|s| (s.agent_id, now + self.jitter_secs()))
                        .collect();
                    if missing.is_empty() {
                        continue;
                    }
                    match self.store.add_waiting_if_absent_batch(&missing).await {
                        Ok(added) => {
                            self.store_breaker.record_success();
                            added_total += added.len();
                        }
                        Err(err) => {
                            self.record_store_failure(&err);
                            warn!(error = %err, "repopulate: batch add failed");
                        }
                    }
                }
                Err(err) => {
                    self.record_store_failure(&err);
                    warn!(error = %err, "repopulate: score lookup failed, falling back");
                    // Insert-if-absent for the whole chunk preserves any
                    // score that exists, so the fallback is still safe.
                    let entries: Vec<(String, f64)> = chunk
                        .iter()
                        .map(|id| (id.clone(), now + self.jitter_secs()))
                        .collect();
                    match self.store.add_waiting_if_absent_batch(&entries).await {
                        Ok(added) => {
                            self.store_breaker.record_success();
                            added_total += added.len();
                        }
                        Err(err) => {
                            self.record_store_failure(&err);
                            warn!(error = %err, "repopulate: fallback add failed");
                        }
                    }
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_repopulation(added_total);
        }
        if added_total > 0 {
            info!(added = added_total, registered = ids.len(), "repopulate: re-seeded agents");
        } else {
            debug!(registered = ids.len(), "repopulate: store already in sync");
        }
        added_total
    }
}
