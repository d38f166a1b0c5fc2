//! Worker submission: one task per acquired agent plus the dead-man timer
//! supervising it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::agent::AgentRegistration;
use crate::engine::run_state::{CompletionGuard, CompletionOutcome, RecoveryRecord, RunState};
use crate::engine::AcquisitionEngine;

impl AcquisitionEngine {
    /// Register run-state for an acquired agent and launch its worker and
    /// dead-man timer.
    ///
    /// Returns false when the agent vanished from the registry between
    /// acquisition and submission; its working entry is queued straight
    /// back to waiting and the permit returned.
    pub(crate) fn submit_run(
        self: &Arc<Self>,
        agent_id: &str,
        deadline: f64,
        cycle_start_ms: i64,
    ) -> bool {
        let Some(registration) = self.registry.get(agent_id).map(|e| Arc::clone(e.value()))
        else {
            warn!(agent = agent_id, "submit: registration vanished, requeueing");
            self.permits.add_permits(1);
            self.recoveries.push(RecoveryRecord {
                agent_id: agent_id.to_string(),
                expected_working: deadline,
                new_waiting: cycle_start_ms as f64 / 1000.0,
                attempts: 1,
            });
            return false;
        };

        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel);
        let state = Arc::new(RunState::new(agent_id.to_string(), generation, deadline));
        self.run_states.insert(agent_id.to_string(), Arc::clone(&state));

        // Created before spawn so that a task aborted before its first
        // poll still drops the guard and finalizes the run.
        let guard =
            CompletionGuard::new(Arc::clone(self), Arc::clone(&state), Arc::clone(&registration));

        let worker =
            tokio::spawn(run_worker(Arc::clone(self), Arc::clone(&state), registration, guard));
        state.set_worker(worker.abort_handle());

        let delay = self.deadman_delay(agent_id, deadline, cycle_start_ms);
        let deadman_state = Arc::clone(&state);
        let engine = Arc::clone(self);
        let deadman = tokio::spawn(async move {
            sleep(delay).await;
            warn!(
                agent = %deadman_state.agent_id,
                generation = deadman_state.generation,
                "deadman: deadline plus zombie threshold exceeded, aborting worker"
            );
            if let Some(metrics) = &engine.metrics {
                metrics.record_deadman_fired();
            }
            deadman_state.abort_worker();
        });
        state.set_deadman(deadman.abort_handle());

        debug!(agent = agent_id, generation, deadline, "submit: worker launched");
        true
    }

    /// Delay until the dead-man timer fires. Measured from the cycle's
    /// cached start time, not a fresh clock read, so a cycle that itself
    /// took a while does not shorten the window granted at acquisition.
    fn deadman_delay(&self, agent_id: &str, deadline: f64, cycle_start_ms: i64) -> Duration {
        let fire_at_ms = (deadline * 1000.0) as i64 + self.zombie_threshold_ms(agent_id);
        Duration::from_millis(fire_at_ms.saturating_sub(cycle_start_ms).max(0) as u64)
    }
}

async fn run_worker(
    engine: Arc<AcquisitionEngine>,
    state: Arc<RunState>,
    registration: Arc<AgentRegistration>,
    guard: CompletionGuard,
) {
    registration.hooks.started(&state.agent_id).await;
    match registration.executor.execute(&state.agent_id).await {
        Ok(()) => guard.finish(CompletionOutcome::Success),
        Err(err) => {
            let kind = engine.classifier.classify(&err);
            guard.finish(CompletionOutcome::Failed { kind, message: format!("{err:#}") });
        }
    }
}
