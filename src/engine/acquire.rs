//! Batch acquisition with chunked scan attempts and the per-identifier
//! fallback path.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::engine::AcquisitionEngine;
use crate::store::StoreError;

/// Upper bound on scan attempts per cycle regardless of configuration.
const MAX_SCAN_ATTEMPTS: usize = 100;

impl AcquisitionEngine {
    /// Registered agents this instance may acquire right now, paired with
    /// the working-set deadline each would be claimed at. Pattern and
    /// shard checks run here on every cycle, so re-sharding and pattern
    /// flips take effect without re-registration.
    pub(crate) fn eligible_candidates(&self, now: f64) -> Vec<(String, f64)> {
        self.registry
            .iter()
            .filter(|entry| self.is_enabled(entry.key()) && self.shard.owns(entry.key()))
            .map(|entry| {
                let timeout = self.intervals.interval_for(entry.key()).timeout;
                (entry.key().clone(), now + timeout.as_secs_f64())
            })
            .collect()
    }

    /// Claim up to `capacity` candidates through the batch script.
    ///
    /// Permits for the whole batch are reserved up front and the unused
    /// remainder returned afterwards. The waiting set is scanned in chunks
    /// of `batch_size`, advancing past already-examined members, for up to
    /// `ceil(ceil(slots / batch_size) * chunk_attempt_multiplier)`
    /// attempts; heavy local filtering can make any single window come
    /// back empty without the backlog being empty.
    ///
    /// Any batch error downgrades the rest of the cycle to the individual
    /// path, with one fallback event recorded per cycle.
    pub(crate) async fn acquire_batch_mode(
        &self,
        now: f64,
        capacity: usize,
        candidates: &[(String, f64)],
    ) -> (Vec<(String, f64)>, &'static str) {
        let slots = capacity.min(candidates.len());
        let Ok(reservation) = self.permits.try_acquire_many(slots as u32) else {
            return (Vec::new(), "batch");
        };
        reservation.forget();

        let deadlines: HashMap<&str, f64> =
            candidates.iter().map(|(id, d)| (id.as_str(), *d)).collect();
        let batch_size = self.config.batch_size.max(1);
        let base_attempts = slots.div_ceil(batch_size);
        let max_attempts = ((base_attempts as f64 * self.config.chunk_attempt_multiplier).ceil()
            as usize)
            .clamp(base_attempts.max(1), MAX_SCAN_ATTEMPTS);

        let mut acquired: Vec<(String, f64)> = Vec::new();
        let mut scan_offset = 0;
        for attempt in 0..max_attempts {
            let remaining = slots - acquired.len();
            if remaining == 0 {
                break;
            }
            match self
                .store
                .acquire_batch(now, remaining, scan_offset, batch_size, candidates)
                .await
            {
                Ok(ids) => {
                    self.store_breaker.record_success();
                    self.acquisition_breaker.record_success();
                    for id in ids {
                        match deadlines.get(id.as_str()) {
                            Some(&deadline) => acquired.push((id, deadline)),
                            None => warn!(agent = %id, "acquire: claimed id was not a candidate"),
                        }
                    }
                    scan_offset += batch_size;
                }
                Err(err) => {
                    self.record_store_failure(&err);
                    warn!(
                        attempt,
                        error = %err,
                        "acquire: batch failed, switching to individual fallback"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_fallback_event();
                    }
                    let unused = slots - acquired.len();
                    if unused > 0 {
                        self.permits.add_permits(unused);
                    }
                    let taken: HashSet<&str> =
                        acquired.iter().map(|(id, _)| id.as_str()).collect();
                    let rest: Vec<(String, f64)> = candidates
                        .iter()
                        .filter(|(id, _)| !taken.contains(id.as_str()))
                        .cloned()
                        .collect();
                    let (recovered, _) =
                        self.acquire_individual_mode(now, unused, &rest, "fallback").await;
                    acquired.extend(recovered);
                    return (acquired, "fallback");
                }
            }
        }

        let unused = slots - acquired.len();
        if unused > 0 {
            self.permits.add_permits(unused);
        }
        debug!(acquired = acquired.len(), slots, "acquire: batch finished");
        (acquired, "batch")
    }

    /// Claim candidates one at a time with the per-identifier conditional
    /// script. Each claim holds its own permit, so a partial failure never
    /// strands more than the one permit being returned on the spot.
    pub(crate) async fn acquire_individual_mode(
        &self,
        now: f64,
        capacity: usize,
        candidates: &[(String, f64)],
        mode: &'static str,
    ) -> (Vec<(String, f64)>, &'static str) {
        let mut acquired = Vec::new();
        for (agent_id, deadline) in candidates {
            if acquired.len() >= capacity {
                break;
            }
            let Ok(reservation) = self.permits.try_acquire() else {
                break;
            };
            reservation.forget();
            match self.store.acquire_one(agent_id, now, *deadline).await {
                Ok(Some(_waiting_score)) => {
                    self.store_breaker.record_success();
                    self.acquisition_breaker.record_success();
                    acquired.push((agent_id.clone(), *deadline));
                }
                Ok(None) => {
                    // Not due, claimed by a peer, or missing. Not an error.
                    self.permits.add_permits(1);
                }
                Err(err) => {
                    self.permits.add_permits(1);
                    self.record_store_failure(&err);
                    if matches!(err, StoreError::Unavailable(_)) {
                        warn!(error = %err, "acquire: store unreachable, abandoning cycle");
                        break;
                    }
                    warn!(agent = %agent_id, error = %err, "acquire: individual claim failed");
                }
            }
        }
        (acquired, mode)
    }

    /// Trip the right breakers for a store error: connectivity failures
    /// count against both, script-level failures only against the
    /// acquisition path.
    pub(crate) fn record_store_failure(&self, err: &StoreError) {
        match err {
            StoreError::Unavailable(_) => {
                self.store_breaker.record_failure();
                self.acquisition_breaker.record_failure();
            }
            StoreError::Operation { .. } => {
                self.acquisition_breaker.record_failure();
            }
        }
    }
}
