//! Distributed, priority-ordered scheduler for periodic background agents.
//!
//! Coordination state lives in a shared store as two sorted sets: waiting
//! (score = next-eligible epoch second) and working (score = execution
//! deadline). The [`engine::AcquisitionEngine`] moves agents between them
//! atomically under capacity and circuit-breaker constraints, runs each
//! acquired agent on its own task, and reconciles completions back into
//! the store with cadence-preserving reschedules and classified failure
//! backoff.

pub mod agent;
pub mod breaker;
pub mod classify;
pub mod clock;
pub mod engine;
pub mod manual_lock;
pub mod metrics;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod trace;

pub use agent::{
    AgentExecutor, AgentInterval, AgentRegistration, ExecutionHooks, IntervalPolicy,
    ShardPredicate,
};
pub use classify::{FailureClassifier, FailureKind};
pub use engine::AcquisitionEngine;
pub use scheduler::Scheduler;
pub use store::{AgentStore, MemoryAgentStore};

pub use dispatch_macros::test;
