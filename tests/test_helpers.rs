#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use dispatch::agent::{
    AgentExecutor, AgentInterval, AgentRegistration, ExecutionHooks, IntervalPolicy,
    UniformIntervals, UniversalShard,
};
use dispatch::classify::{FailureClassifier, FailureKind};
use dispatch::engine::AcquisitionEngine;
use dispatch::settings::{BackoffConfig, BreakerConfig, EngineConfig, SchedulerConfig};
use dispatch::store::MemoryAgentStore;

// Helper: enforce a tight timeout for async tests likely to hang
#[macro_export]
macro_rules! with_timeout {
    ($ms:expr, $body:block) => {{
        tokio::time::timeout(std::time::Duration::from_millis($ms), async move { $body })
            .await
            .expect("test timed out")
    }};
}

/// Engine tuning with timings sized for tests. Jitter is off so newly
/// registered agents are due immediately, repopulation only runs on the
/// first cycle, and failure backoffs are deterministic.
pub fn fast_config(max_concurrent: usize) -> EngineConfig {
    EngineConfig {
        scheduler: SchedulerConfig {
            max_concurrent,
            batch_size: 10,
            cycle_interval_ms: 20,
            repopulate_interval_ms: 3_600_000,
            jitter_window_ms: 0,
            zombie_threshold_ms: 60_000,
            exceptional_zombie_threshold_ms: 120_000,
            stall_log_period_ms: 60_000,
            ..SchedulerConfig::default()
        },
        backoff: BackoffConfig {
            error_interval_ms: 60_000,
            throttle_base_ms: 10_000,
            throttle_multiplier: 2.0,
            throttle_max_ms: 60_000,
            max_immediate_retries: 2,
            jitter_ratio: 0.0,
        },
        breaker: BreakerConfig::default(),
    }
}

pub fn build_engine(
    store: Arc<MemoryAgentStore>,
    intervals: Arc<dyn IntervalPolicy>,
    config: EngineConfig,
) -> Arc<AcquisitionEngine> {
    AcquisitionEngine::new(
        store,
        intervals,
        Arc::new(UniversalShard),
        FailureClassifier::default(),
        config,
        None,
    )
    .expect("engine")
}

/// Uniform cadence: `period_secs` between successful runs, `timeout_secs`
/// per run.
pub fn intervals(period_secs: u64, timeout_secs: u64) -> Arc<dyn IntervalPolicy> {
    Arc::new(UniformIntervals::new(AgentInterval::new(
        Duration::from_secs(period_secs),
        Duration::from_secs(timeout_secs),
    )))
}

pub fn now_secs() -> f64 {
    dispatch::clock::local_now_ms() as f64 / 1000.0
}

/// Poll `cond` until it holds, panicking after a couple of seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Executor that returns Ok immediately and counts its runs.
pub struct CountingExecutor {
    runs: Arc<AtomicU32>,
}

#[async_trait]
impl AgentExecutor for CountingExecutor {
    async fn execute(&self, _agent_id: &str) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

pub fn counting_agent() -> (Arc<AtomicU32>, AgentRegistration) {
    let runs = Arc::new(AtomicU32::new(0));
    let registration =
        AgentRegistration::new(Arc::new(CountingExecutor { runs: Arc::clone(&runs) }));
    (runs, registration)
}

/// Executor that always fails with a fixed message.
pub struct FailingExecutor {
    message: &'static str,
    runs: Arc<AtomicU32>,
}

#[async_trait]
impl AgentExecutor for FailingExecutor {
    async fn execute(&self, _agent_id: &str) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::AcqRel);
        Err(anyhow::anyhow!(self.message))
    }
}

pub fn failing_agent(message: &'static str) -> (Arc<AtomicU32>, AgentRegistration) {
    let runs = Arc::new(AtomicU32::new(0));
    let registration =
        AgentRegistration::new(Arc::new(FailingExecutor { message, runs: Arc::clone(&runs) }));
    (runs, registration)
}

/// Executor that fails its first `failures` runs, then succeeds.
pub struct FlakyExecutor {
    failures: u32,
    message: &'static str,
    runs: Arc<AtomicU32>,
}

#[async_trait]
impl AgentExecutor for FlakyExecutor {
    async fn execute(&self, _agent_id: &str) -> anyhow::Result<()> {
        let run = self.runs.fetch_add(1, Ordering::AcqRel);
        if run < self.failures {
            Err(anyhow::anyhow!(self.message))
        } else {
            Ok(())
        }
    }
}

pub fn flaky_agent(failures: u32, message: &'static str) -> (Arc<AtomicU32>, AgentRegistration) {
    let runs = Arc::new(AtomicU32::new(0));
    let registration = AgentRegistration::new(Arc::new(FlakyExecutor {
        failures,
        message,
        runs: Arc::clone(&runs),
    }));
    (runs, registration)
}

/// Executor that follows a per-run script: `true` succeeds, `false` fails
/// with the fixed message. Runs past the end of the script succeed.
pub struct ScriptedExecutor {
    script: Mutex<Vec<bool>>,
    message: &'static str,
    runs: Arc<AtomicU32>,
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(&self, _agent_id: &str) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::AcqRel);
        let step = {
            let mut script = self.script.lock().expect("script lock");
            if script.is_empty() { true } else { script.remove(0) }
        };
        if step {
            Ok(())
        } else {
            Err(anyhow::anyhow!(self.message))
        }
    }
}

pub fn scripted_agent(
    script: Vec<bool>,
    message: &'static str,
) -> (Arc<AtomicU32>, AgentRegistration) {
    let runs = Arc::new(AtomicU32::new(0));
    let registration = AgentRegistration::new(Arc::new(ScriptedExecutor {
        script: Mutex::new(script),
        message,
        runs: Arc::clone(&runs),
    }));
    (runs, registration)
}

/// Executor that parks until its worker is aborted.
pub struct BlockingExecutor {
    started: Arc<AtomicU32>,
}

#[async_trait]
impl AgentExecutor for BlockingExecutor {
    async fn execute(&self, _agent_id: &str) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::AcqRel);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

pub fn blocking_agent() -> (Arc<AtomicU32>, AgentRegistration) {
    let started = Arc::new(AtomicU32::new(0));
    let registration =
        AgentRegistration::new(Arc::new(BlockingExecutor { started: Arc::clone(&started) }));
    (started, registration)
}

/// Executor whose worker panics mid-run.
pub struct PanickingExecutor {
    runs: Arc<AtomicU32>,
}

#[async_trait]
impl AgentExecutor for PanickingExecutor {
    async fn execute(&self, agent_id: &str) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::AcqRel);
        panic!("executor blew up for {agent_id}");
    }
}

pub fn panicking_agent() -> (Arc<AtomicU32>, AgentRegistration) {
    let runs = Arc::new(AtomicU32::new(0));
    let registration =
        AgentRegistration::new(Arc::new(PanickingExecutor { runs: Arc::clone(&runs) }));
    (runs, registration)
}

/// Hooks that record lifecycle events in arrival order.
#[derive(Default)]
pub struct RecordingHooks {
    events: Mutex<Vec<String>>,
}

impl RecordingHooks {
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("events lock").clone()
    }

    fn push(&self, event: String) {
        self.events.lock().expect("events lock").push(event);
    }
}

#[async_trait]
impl ExecutionHooks for RecordingHooks {
    async fn started(&self, agent_id: &str) {
        self.push(format!("started:{agent_id}"));
    }

    async fn completed(&self, agent_id: &str, _elapsed: Duration) {
        self.push(format!("completed:{agent_id}"));
    }

    async fn failed(&self, agent_id: &str, kind: FailureKind, _elapsed: Duration) {
        self.push(format!("failed:{agent_id}:{kind}"));
    }
}
