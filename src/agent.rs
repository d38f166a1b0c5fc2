//! Agent-facing surface: executors, lifecycle hooks, cadence policy and
//! shard ownership.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::classify::FailureKind;

/// Work body invoked each time an agent is acquired.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, agent_id: &str) -> anyhow::Result<()>;
}

/// Lifecycle notifications around a single run. All hooks are best-effort
/// observers; the scheduler does not react to what they do.
#[async_trait]
pub trait ExecutionHooks: Send + Sync {
    async fn started(&self, _agent_id: &str) {}
    async fn completed(&self, _agent_id: &str, _elapsed: Duration) {}
    async fn failed(&self, _agent_id: &str, _kind: FailureKind, _elapsed: Duration) {}
}

/// Hook implementation that observes nothing.
pub struct NoopHooks;

#[async_trait]
impl ExecutionHooks for NoopHooks {}

/// Scheduling cadence for one agent.
///
/// `period` is the gap between successful runs, `timeout` bounds a single
/// run, and `error_period` optionally overrides the engine-wide retry
/// interval after non-throttled failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentInterval {
    pub period: Duration,
    pub timeout: Duration,
    pub error_period: Option<Duration>,
}

impl AgentInterval {
    pub fn new(period: Duration, timeout: Duration) -> Self {
        Self { period, timeout, error_period: None }
    }

    pub fn with_error_period(mut self, error_period: Duration) -> Self {
        self.error_period = Some(error_period);
        self
    }
}

/// Resolves the cadence for an agent id. Implementations typically consult
/// per-tenant configuration; the engine calls this on every acquisition and
/// completion, so lookups should be cheap.
pub trait IntervalPolicy: Send + Sync {
    fn interval_for(&self, agent_id: &str) -> AgentInterval;
}

/// Fixed cadence for every agent.
pub struct UniformIntervals {
    interval: AgentInterval,
}

impl UniformIntervals {
    pub fn new(interval: AgentInterval) -> Self {
        Self { interval }
    }
}

impl IntervalPolicy for UniformIntervals {
    fn interval_for(&self, _agent_id: &str) -> AgentInterval {
        self.interval
    }
}

/// Per-agent cadence table with a fallback for ids not present.
pub struct IntervalTable {
    entries: HashMap<String, AgentInterval>,
    fallback: AgentInterval,
}

impl IntervalTable {
    pub fn new(fallback: AgentInterval) -> Self {
        Self { entries: HashMap::new(), fallback }
    }

    pub fn insert(&mut self, agent_id: impl Into<String>, interval: AgentInterval) {
        self.entries.insert(agent_id.into(), interval);
    }
}

impl IntervalPolicy for IntervalTable {
    fn interval_for(&self, agent_id: &str) -> AgentInterval {
        self.entries.get(agent_id).copied().unwrap_or(self.fallback)
    }
}

/// Decides whether this process is responsible for an agent id.
///
/// Re-evaluated on every cycle for every candidate, so membership changes
/// take effect without re-registration.
pub trait ShardPredicate: Send + Sync {
    fn owns(&self, agent_id: &str) -> bool;
}

/// Shard predicate that claims everything. Single-process deployments.
pub struct UniversalShard;

impl ShardPredicate for UniversalShard {
    fn owns(&self, _agent_id: &str) -> bool {
        true
    }
}

/// Everything the engine needs to run one agent.
pub struct AgentRegistration {
    pub executor: Arc<dyn AgentExecutor>,
    pub hooks: Arc<dyn ExecutionHooks>,
}

impl AgentRegistration {
    pub fn new(executor: Arc<dyn AgentExecutor>) -> Self {
        Self { executor, hooks: Arc::new(NoopHooks) }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ExecutionHooks>) -> Self {
        self.hooks = hooks;
        self
    }
}
