//! Per-run bookkeeping: live-run state, the completion guard that makes
//! permit release exactly-once, and the record types drained by the cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::AbortHandle;

use crate::agent::AgentRegistration;
use crate::classify::FailureKind;
use crate::engine::AcquisitionEngine;

/// State of one in-flight run, registered under the agent id for as long as
/// the run owns its concurrency permit.
pub(crate) struct RunState {
    pub(crate) agent_id: String,
    /// Monotonic run number. Stale guards and timers compare against it so
    /// a superseded run can never finalize state belonging to a newer one.
    pub(crate) generation: u64,
    /// Working-set score written at acquisition. Release is conditional on
    /// the store still holding exactly this score.
    pub(crate) acquired_deadline: f64,
    permit_held: AtomicBool,
    worker: Mutex<Option<AbortHandle>>,
    deadman: Mutex<Option<AbortHandle>>,
}

impl RunState {
    pub(crate) fn new(agent_id: String, generation: u64, acquired_deadline: f64) -> Self {
        Self {
            agent_id,
            generation,
            acquired_deadline,
            permit_held: AtomicBool::new(true),
            worker: Mutex::new(None),
            deadman: Mutex::new(None),
        }
    }

    /// Claim the one-time right to return this run's permit to the pool.
    pub(crate) fn try_release_permit(&self) -> bool {
        self.permit_held
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_worker(&self, handle: AbortHandle) {
        *self.lock_handle(&self.worker) = Some(handle);
    }

    pub(crate) fn set_deadman(&self, handle: AbortHandle) {
        *self.lock_handle(&self.deadman) = Some(handle);
    }

    pub(crate) fn abort_worker(&self) {
        if let Some(handle) = self.lock_handle(&self.worker).take() {
            handle.abort();
        }
    }

    pub(crate) fn cancel_deadman(&self) {
        if let Some(handle) = self.lock_handle(&self.deadman).take() {
            handle.abort();
        }
    }

    fn lock_handle<'a>(
        &self,
        slot: &'a Mutex<Option<AbortHandle>>,
    ) -> std::sync::MutexGuard<'a, Option<AbortHandle>> {
        slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    Success,
    Failed { kind: FailureKind, message: String },
    /// The worker task was torn down before reporting, by the dead-man
    /// timer, shutdown, or a panic.
    Aborted,
}

impl CompletionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionOutcome::Success => "success",
            CompletionOutcome::Failed { .. } => "failed",
            CompletionOutcome::Aborted => "aborted",
        }
    }
}

/// Finished-run record enqueued by the guard and drained on the cycle.
pub(crate) struct CompletionRecord {
    pub(crate) agent_id: String,
    pub(crate) generation: u64,
    pub(crate) registration: Arc<AgentRegistration>,
    pub(crate) outcome: CompletionOutcome,
    pub(crate) elapsed: Duration,
    pub(crate) acquired_deadline: f64,
}

/// Release that failed against the store and is waiting to be retried.
pub(crate) struct RecoveryRecord {
    pub(crate) agent_id: String,
    pub(crate) expected_working: f64,
    pub(crate) new_waiting: f64,
    pub(crate) attempts: u32,
}

/// Owns the finalization of exactly one run.
///
/// Created before the worker task is spawned and moved into it, so the
/// guard is dropped on every exit path: normal return, executor panic, and
/// abort before the task was ever polled. Dropping without a recorded
/// outcome finalizes the run as [`CompletionOutcome::Aborted`].
pub(crate) struct CompletionGuard {
    engine: Arc<AcquisitionEngine>,
    state: Arc<RunState>,
    registration: Arc<AgentRegistration>,
    started_at: Instant,
    outcome: Option<CompletionOutcome>,
}

impl CompletionGuard {
    pub(crate) fn new(
        engine: Arc<AcquisitionEngine>,
        state: Arc<RunState>,
        registration: Arc<AgentRegistration>,
    ) -> Self {
        Self { engine, state, registration, started_at: Instant::now(), outcome: None }
    }

    pub(crate) fn finish(mut self, outcome: CompletionOutcome) {
        self.outcome = Some(outcome);
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or(CompletionOutcome::Aborted);
        self.engine.finalize_run(
            &self.state,
            Arc::clone(&self.registration),
            outcome,
            self.started_at.elapsed(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permit_release_is_exactly_once() {
        let state = RunState::new("a".to_string(), 1, 100.0);
        assert!(state.try_release_permit());
        assert!(!state.try_release_permit());
        assert!(!state.try_release_permit());
    }
}
