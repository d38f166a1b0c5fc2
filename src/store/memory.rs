//! In-process [`AgentStore`] backed by two sorted sets under one mutex.
//!
//! Serves single-node deployments and every test in the crate. Scores are
//! held as whole milliseconds so ordering is total and deterministic; the
//! trait surface converts to and from epoch-second floats at the boundary.
//!
//! Fault hooks let tests fail specific operations a set number of times,
//! which is how the batch-fallback and recovery-retry paths get exercised.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{AgentScores, AgentStore, StoreError};

fn to_ms(score: f64) -> i64 {
    (score * 1000.0).round() as i64
}

fn to_sec(ms: i64) -> f64 {
    ms as f64 / 1000.0
}

/// Sorted set keyed by agent id with an ascending (score, id) index.
#[derive(Default)]
struct SortedSet {
    by_id: HashMap<String, i64>,
    index: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, agent_id: &str, score_ms: i64) {
        if let Some(old) = self.by_id.insert(agent_id.to_string(), score_ms) {
            self.index.remove(&(old, agent_id.to_string()));
        }
        self.index.insert((score_ms, agent_id.to_string()));
    }

    fn remove(&mut self, agent_id: &str) -> Option<i64> {
        let score = self.by_id.remove(agent_id)?;
        self.index.remove(&(score, agent_id.to_string()));
        Some(score)
    }

    fn score(&self, agent_id: &str) -> Option<i64> {
        self.by_id.get(agent_id).copied()
    }

    fn contains(&self, agent_id: &str) -> bool {
        self.by_id.contains_key(agent_id)
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }
}

#[derive(Default)]
struct State {
    waiting: SortedSet,
    working: SortedSet,
}

#[derive(Default)]
pub struct MemoryAgentStore {
    state: Mutex<State>,
    clock_skew_ms: AtomicI64,
    fail_all: AtomicBool,
    fail_next_batch: AtomicU32,
    fail_next_scores: AtomicU32,
    fail_next_releases: AtomicU32,
    fail_next_adds: AtomicU32,
    batch_calls: AtomicU32,
    single_calls: AtomicU32,
}

impl MemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_fault(&self, counter: &AtomicU32, op: &'static str) -> Result<(), StoreError> {
        if self.fail_all.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        let took = counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(StoreError::Operation { op, reason: "injected failure".into() });
        }
        Ok(())
    }

    /// Fail every call until cleared. Models a full store outage.
    pub fn fail_all_calls(&self, enabled: bool) {
        self.fail_all.store(enabled, Ordering::Release);
    }

    /// Fail the next `n` batch-acquire calls.
    pub fn fail_next_batch_acquires(&self, n: u32) {
        self.fail_next_batch.store(n, Ordering::Release);
    }

    /// Fail the next `n` score lookups.
    pub fn fail_next_score_lookups(&self, n: u32) {
        self.fail_next_scores.store(n, Ordering::Release);
    }

    /// Fail the next `n` conditional releases.
    pub fn fail_next_releases(&self, n: u32) {
        self.fail_next_releases.store(n, Ordering::Release);
    }

    /// Fail the next `n` add-if-absent calls.
    pub fn fail_next_adds(&self, n: u32) {
        self.fail_next_adds.store(n, Ordering::Release);
    }

    /// Shift the store clock relative to the local one.
    pub fn set_clock_skew_ms(&self, skew: i64) {
        self.clock_skew_ms.store(skew, Ordering::Release);
    }

    /// How many batch-acquire calls have been made.
    pub fn batch_attempts(&self) -> u32 {
        self.batch_calls.load(Ordering::Acquire)
    }

    /// How many single-acquire calls have been made.
    pub fn single_attempts(&self) -> u32 {
        self.single_calls.load(Ordering::Acquire)
    }

    pub fn waiting_len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn working_len(&self) -> usize {
        self.lock().working.len()
    }

    pub fn waiting_score(&self, agent_id: &str) -> Option<f64> {
        self.lock().waiting.score(agent_id).map(to_sec)
    }

    pub fn working_score(&self, agent_id: &str) -> Option<f64> {
        self.lock().working.score(agent_id).map(to_sec)
    }

    /// Overwrite an agent's waiting score, inserting if needed. Test hook.
    pub fn seed_waiting(&self, agent_id: &str, score: f64) {
        self.lock().waiting.insert(agent_id, to_ms(score));
    }

    /// Drop both sets. Test hook.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.waiting = SortedSet::default();
        state.working = SortedSet::default();
    }
}

#[async_trait]
impl AgentStore for MemoryAgentStore {
    async fn acquire_batch(
        &self,
        now: f64,
        limit: usize,
        scan_offset: usize,
        scan_limit: usize,
        candidates: &[(String, f64)],
    ) -> Result<Vec<String>, StoreError> {
        self.batch_calls.fetch_add(1, Ordering::AcqRel);
        self.check_fault(&self.fail_next_batch, "acquire_batch")?;

        let deadlines: HashMap<&str, f64> =
            candidates.iter().map(|(id, d)| (id.as_str(), *d)).collect();
        let now_ms = to_ms(now);

        let mut state = self.lock();
        let scanned: Vec<(i64, String)> = state
            .waiting
            .index
            .iter()
            .skip(scan_offset)
            .take(scan_limit)
            .cloned()
            .collect();

        let mut claimed = Vec::new();
        for (score_ms, agent_id) in scanned {
            if score_ms > now_ms {
                // Index is ascending, nothing past this point is due.
                break;
            }
            if claimed.len() >= limit {
                break;
            }
            if let Some(&deadline) = deadlines.get(agent_id.as_str()) {
                state.waiting.remove(&agent_id);
                state.working.insert(&agent_id, to_ms(deadline));
                claimed.push(agent_id);
            }
        }
        Ok(claimed)
    }

    async fn acquire_one(
        &self,
        agent_id: &str,
        now: f64,
        deadline: f64,
    ) -> Result<Option<f64>, StoreError> {
        self.single_calls.fetch_add(1, Ordering::AcqRel);
        if self.fail_all.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        let mut state = self.lock();
        match state.waiting.score(agent_id) {
            Some(score_ms) if score_ms <= to_ms(now) => {
                state.waiting.remove(agent_id);
                state.working.insert(agent_id, to_ms(deadline));
                Ok(Some(to_sec(score_ms)))
            }
            _ => Ok(None),
        }
    }

    async fn scores(&self, agent_ids: &[String]) -> Result<Vec<AgentScores>, StoreError> {
        self.check_fault(&self.fail_next_scores, "scores")?;
        let state = self.lock();
        Ok(agent_ids
            .iter()
            .map(|id| AgentScores {
                agent_id: id.clone(),
                waiting: state.waiting.score(id).map(to_sec),
                working: state.working.score(id).map(to_sec),
            })
            .collect())
    }

    async fn conditional_release(
        &self,
        agent_id: &str,
        expected_working: f64,
        new_waiting: f64,
    ) -> Result<bool, StoreError> {
        self.check_fault(&self.fail_next_releases, "conditional_release")?;
        let mut state = self.lock();
        match state.working.score(agent_id) {
            Some(score_ms) if score_ms == to_ms(expected_working) => {
                state.working.remove(agent_id);
                state.waiting.insert(agent_id, to_ms(new_waiting));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn add_waiting_if_absent(&self, agent_id: &str, score: f64) -> Result<bool, StoreError> {
        self.check_fault(&self.fail_next_adds, "add_waiting_if_absent")?;
        let mut state = self.lock();
        if state.waiting.contains(agent_id) || state.working.contains(agent_id) {
            return Ok(false);
        }
        state.waiting.insert(agent_id, to_ms(score));
        Ok(true)
    }

    async fn add_waiting_if_absent_batch(
        &self,
        entries: &[(String, f64)],
    ) -> Result<Vec<String>, StoreError> {
        self.check_fault(&self.fail_next_adds, "add_waiting_if_absent_batch")?;
        let mut state = self.lock();
        let mut added = Vec::new();
        for (agent_id, score) in entries {
            if state.waiting.contains(agent_id) || state.working.contains(agent_id) {
                continue;
            }
            state.waiting.insert(agent_id, to_ms(*score));
            added.push(agent_id.clone());
        }
        Ok(added)
    }

    async fn waiting_head(&self, limit: usize) -> Result<Vec<(String, f64)>, StoreError> {
        if self.fail_all.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        let state = self.lock();
        Ok(state
            .waiting
            .index
            .iter()
            .take(limit)
            .map(|(score_ms, id)| (id.clone(), to_sec(*score_ms)))
            .collect())
    }

    async fn server_time_ms(&self) -> Result<i64, StoreError> {
        if self.fail_all.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        Ok(crate::clock::local_now_ms() + self.clock_skew_ms.load(Ordering::Acquire))
    }
}
