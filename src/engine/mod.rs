//! The acquisition engine.
//!
//! Owns the local agent registry and drives the acquisition cycle against
//! the shared store: repopulation, completion and recovery drains, capacity
//! accounting, batch or individual acquisition, worker submission and the
//! dead-man timers supervising them.
//!
//! Split across focused submodules:
//! - [`cycle`]: the `saturate_pool` entry point and its phase ordering
//! - [`acquire`]: batch acquisition with chunked scans and the
//!   per-identifier fallback
//! - [`repopulate`]: smart-sync of the registry into the waiting set
//! - [`completion`]: completion and recovery drains, reschedule math
//! - [`worker`]: worker tasks and dead-man timers
//! - [`health`]: overdue and stall diagnostics, consistency self-check
//! - [`run_state`]: per-run ownership state and the completion guard

mod acquire;
mod completion;
mod cycle;
mod health;
mod repopulate;
mod run_state;
mod worker;

pub use health::{ConsistencyReport, HealthSnapshot};

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::agent::{AgentRegistration, IntervalPolicy, ShardPredicate};
use crate::breaker::{BreakerSettings, BreakerState, CircuitBreaker};
use crate::classify::FailureClassifier;
use crate::clock;
use crate::metrics::Metrics;
use crate::settings::{BackoffConfig, EngineConfig, SchedulerConfig};
use crate::store::AgentStore;

use run_state::{CompletionRecord, RecoveryRecord, RunState};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid {name} pattern {pattern:?}: {source}")]
    InvalidPattern {
        name: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// Cumulative counters since construction.
#[derive(Default)]
struct EngineStats {
    cycles: AtomicU64,
    acquired: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time view of [`EngineStats`].
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatsSnapshot {
    pub cycles: u64,
    pub acquired: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

/// State of both circuit breakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerStatus {
    pub store: BreakerState,
    pub acquisition: BreakerState,
}

pub struct AcquisitionEngine {
    config: SchedulerConfig,
    backoff: BackoffConfig,
    store: Arc<dyn AgentStore>,
    intervals: Arc<dyn IntervalPolicy>,
    shard: Arc<dyn ShardPredicate>,
    classifier: FailureClassifier,
    enabled_pattern: Option<Regex>,
    disabled_pattern: Option<Regex>,
    exceptional_pattern: Option<Regex>,
    registry: DashMap<String, Arc<AgentRegistration>>,
    run_states: DashMap<String, Arc<RunState>>,
    permits: Arc<Semaphore>,
    completions: SegQueue<CompletionRecord>,
    recoveries: SegQueue<RecoveryRecord>,
    next_generation: AtomicU64,
    failure_streaks: DashMap<String, u32>,
    last_repopulation_ms: AtomicI64,
    last_stall_log_ms: AtomicI64,
    store_breaker: CircuitBreaker,
    acquisition_breaker: CircuitBreaker,
    stats: EngineStats,
    started_at: DateTime<Utc>,
    shutting_down: AtomicBool,
    metrics: Option<Metrics>,
}

impl AcquisitionEngine {
    /// Build an engine over `store`.
    ///
    /// The enabled and disabled patterns must compile or construction
    /// fails. The exceptional-agents pattern is advisory: a bad one is
    /// logged and dropped, leaving every agent on the default zombie
    /// threshold.
    pub fn new(
        store: Arc<dyn AgentStore>,
        intervals: Arc<dyn IntervalPolicy>,
        shard: Arc<dyn ShardPredicate>,
        classifier: FailureClassifier,
        config: EngineConfig,
        metrics: Option<Metrics>,
    ) -> Result<Arc<Self>, EngineError> {
        let EngineConfig { scheduler, backoff, breaker } = config;

        let enabled_pattern = compile_required("enabled", scheduler.enabled_pattern.as_deref())?;
        let disabled_pattern = compile_required("disabled", scheduler.disabled_pattern.as_deref())?;
        let exceptional_pattern =
            compile_advisory("exceptional_agents", scheduler.exceptional_agents_pattern.as_deref());

        let base = BreakerSettings::from_config(&breaker);
        let store_breaker = CircuitBreaker::new("store", base.derive_store());
        let acquisition_breaker = CircuitBreaker::new("acquisition", base);

        let permits = Arc::new(Semaphore::new(scheduler.max_concurrent));

        info!(
            max_concurrent = scheduler.max_concurrent,
            batch_enabled = scheduler.batch_enabled,
            batch_size = scheduler.batch_size,
            "engine: constructed"
        );

        Ok(Arc::new(Self {
            config: scheduler,
            backoff,
            store,
            intervals,
            shard,
            classifier,
            enabled_pattern,
            disabled_pattern,
            exceptional_pattern,
            registry: DashMap::new(),
            run_states: DashMap::new(),
            permits,
            completions: SegQueue::new(),
            recoveries: SegQueue::new(),
            next_generation: AtomicU64::new(1),
            failure_streaks: DashMap::new(),
            last_repopulation_ms: AtomicI64::new(0),
            last_stall_log_ms: AtomicI64::new(0),
            store_breaker,
            acquisition_breaker,
            stats: EngineStats::default(),
            started_at: Utc::now(),
            shutting_down: AtomicBool::new(false),
            metrics,
        }))
    }

    /// Admit an agent to the local registry and seed its waiting entry.
    ///
    /// Returns false when the shard predicate rejects the id. Registering
    /// an id again replaces its execution contract. The waiting-set add is
    /// best-effort; a store failure here is healed by repopulation.
    pub async fn register(&self, agent_id: &str, registration: AgentRegistration) -> bool {
        if !self.shard.owns(agent_id) {
            debug!(agent = agent_id, "register: rejected by shard predicate");
            return false;
        }
        self.registry.insert(agent_id.to_string(), Arc::new(registration));

        let score = self.now_score().await + self.jitter_secs();
        match self.store.add_waiting_if_absent(agent_id, score).await {
            Ok(added) => {
                debug!(agent = agent_id, score, added, "register: seeded waiting entry");
            }
            Err(err) => {
                warn!(
                    agent = agent_id,
                    error = %err,
                    "register: waiting-set seed failed, repopulation will retry"
                );
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_registered(self.registry.len());
        }
        true
    }

    /// Drop an agent from the local registry.
    ///
    /// Store entries are left in place for external cleanup, and an
    /// in-flight run keeps its captured contract until it finishes.
    pub fn unregister(&self, agent_id: &str) -> bool {
        let removed = self.registry.remove(agent_id).is_some();
        self.failure_streaks.remove(agent_id);
        if removed {
            debug!(agent = agent_id, "unregister: removed from registry");
            if let Some(metrics) = &self.metrics {
                metrics.set_registered(self.registry.len());
            }
        }
        removed
    }

    pub fn registered_count(&self) -> usize {
        self.registry.len()
    }

    pub fn active_count(&self) -> usize {
        self.run_states.len()
    }

    pub fn breaker_status(&self) -> BreakerStatus {
        BreakerStatus {
            store: self.store_breaker.state(),
            acquisition: self.acquisition_breaker.state(),
        }
    }

    /// Force both breakers back to closed.
    pub fn reset_breakers(&self) {
        self.store_breaker.reset();
        self.acquisition_breaker.reset();
        info!("engine: circuit breakers manually reset");
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        let succeeded = self.stats.succeeded.load(Ordering::Relaxed);
        let failed = self.stats.failed.load(Ordering::Relaxed);
        let terminal = succeeded + failed;
        EngineStatsSnapshot {
            cycles: self.stats.cycles.load(Ordering::Relaxed),
            acquired: self.stats.acquired.load(Ordering::Relaxed),
            succeeded,
            failed,
            success_rate: if terminal == 0 { 0.0 } else { succeeded as f64 / terminal as f64 },
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stop acquiring. In-flight runs keep running until they finish or
    /// are force-requeued.
    pub fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            info!("engine: shutdown started, no further acquisitions");
        }
    }

    /// Hand an in-flight agent back to the fleet: release its working
    /// entry to waiting at now (ownership-checked) and abort its worker.
    /// Returns whether the store release happened.
    pub async fn force_requeue(&self, agent_id: &str) -> bool {
        let Some(state) = self.run_states.get(agent_id).map(|entry| Arc::clone(entry.value()))
        else {
            return false;
        };
        let now = self.now_score().await;
        let released = match self
            .store
            .conditional_release(agent_id, state.acquired_deadline, now)
            .await
        {
            Ok(released) => released,
            Err(err) => {
                warn!(agent = agent_id, error = %err, "force_requeue: release failed");
                false
            }
        };
        state.abort_worker();
        info!(agent = agent_id, released, "force_requeue: worker aborted");
        released
    }

    /// Force-requeue every in-flight agent. Returns how many store
    /// releases succeeded.
    pub async fn force_requeue_inflight(&self) -> usize {
        let ids: Vec<String> = self.run_states.iter().map(|e| e.key().clone()).collect();
        let mut released = 0;
        for agent_id in ids {
            if self.force_requeue(&agent_id).await {
                released += 1;
            }
        }
        released
    }

    pub(crate) async fn now_score(&self) -> f64 {
        clock::score_now(&*self.store, self.config.time_cache_ms).await
    }

    /// Whether the id passes the enabled and disabled patterns.
    pub(crate) fn is_enabled(&self, agent_id: &str) -> bool {
        if let Some(enabled) = &self.enabled_pattern {
            if !enabled.is_match(agent_id) {
                return false;
            }
        }
        if let Some(disabled) = &self.disabled_pattern {
            if disabled.is_match(agent_id) {
                return false;
            }
        }
        true
    }

    /// Zombie threshold for the id, honouring the exceptional pattern.
    pub(crate) fn zombie_threshold_ms(&self, agent_id: &str) -> i64 {
        match &self.exceptional_pattern {
            Some(pattern) if pattern.is_match(agent_id) => {
                self.config.exceptional_zombie_threshold_ms
            }
            _ => self.config.zombie_threshold_ms,
        }
    }

    /// Random offset inside the configured jitter window, in seconds.
    /// Spreads first-run times so a fleet restart does not line every
    /// agent up on the same instant.
    pub(crate) fn jitter_secs(&self) -> f64 {
        if self.config.jitter_window_ms == 0 {
            return 0.0;
        }
        rand::rng().random_range(0..=self.config.jitter_window_ms) as f64 / 1000.0
    }
}

fn compile_required(
    name: &'static str,
    pattern: Option<&str>,
) -> Result<Option<Regex>, EngineError> {
    match pattern {
        None => Ok(None),
        Some(p) => Regex::new(p).map(Some).map_err(|source| EngineError::InvalidPattern {
            name,
            pattern: p.to_string(),
            source,
        }),
    }
}

fn compile_advisory(name: &'static str, pattern: Option<&str>) -> Option<Regex> {
    let p = pattern?;
    match Regex::new(p) {
        Ok(regex) => Some(regex),
        Err(err) => {
            warn!(
                pattern = p,
                error = %err,
                "engine: {name} pattern invalid, falling back to default threshold"
            );
            None
        }
    }
}
