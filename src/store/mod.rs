//! Shared-store contract.
//!
//! The scheduler keeps all cross-process state in two sorted sets inside a
//! shared store. The waiting set scores each agent with the epoch second at
//! which it next becomes eligible; the working set scores each in-flight
//! agent with its execution deadline. Every mutation below preserves the
//! invariant that an agent id lives in at most one of the two sets.
//!
//! Implementations back this with a store-side script engine so that the
//! scan-and-claim operations are atomic. [`memory::MemoryAgentStore`]
//! provides the in-process implementation used by tests and single-node
//! deployments.

pub mod memory;

pub use memory::MemoryAgentStore;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached at all.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered but the operation failed.
    #[error("store operation {op} failed: {reason}")]
    Operation { op: &'static str, reason: String },
}

/// Waiting and working scores for one agent id, absent when the id is not
/// a member of the respective set.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentScores {
    pub agent_id: String,
    pub waiting: Option<f64>,
    pub working: Option<f64>,
}

/// Atomic operations over the waiting and working sorted sets. Scores are
/// epoch seconds.
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Claim up to `limit` due agents in one shot.
    ///
    /// Scans the waiting set ascending from `scan_offset`, considering at
    /// most `scan_limit` members, and moves every scanned id that is due
    /// (`score <= now`) and present in `candidates` into the working set at
    /// the deadline paired with it. Returns the claimed ids. Ids scanned
    /// but absent from `candidates` are left untouched.
    async fn acquire_batch(
        &self,
        now: f64,
        limit: usize,
        scan_offset: usize,
        scan_limit: usize,
        candidates: &[(String, f64)],
    ) -> Result<Vec<String>, StoreError>;

    /// Claim a single agent if it is currently due.
    ///
    /// Moves `agent_id` from waiting to working at `deadline` when its
    /// waiting score is `<= now`. Returns the waiting score it held, or
    /// `None` when the id was missing or not yet due.
    async fn acquire_one(
        &self,
        agent_id: &str,
        now: f64,
        deadline: f64,
    ) -> Result<Option<f64>, StoreError>;

    /// Current membership and scores for each id, in input order.
    async fn scores(&self, agent_ids: &[String]) -> Result<Vec<AgentScores>, StoreError>;

    /// Move `agent_id` from working back to waiting at `new_waiting`, but
    /// only when its working score still equals `expected_working`. Returns
    /// whether the release happened.
    async fn conditional_release(
        &self,
        agent_id: &str,
        expected_working: f64,
        new_waiting: f64,
    ) -> Result<bool, StoreError>;

    /// Add `agent_id` to the waiting set at `score` unless it is already in
    /// either set. Returns whether it was added.
    async fn add_waiting_if_absent(&self, agent_id: &str, score: f64) -> Result<bool, StoreError>;

    /// Batch form of [`add_waiting_if_absent`]; returns the ids actually
    /// added.
    ///
    /// [`add_waiting_if_absent`]: AgentStore::add_waiting_if_absent
    async fn add_waiting_if_absent_batch(
        &self,
        entries: &[(String, f64)],
    ) -> Result<Vec<String>, StoreError>;

    /// Lowest-scored members of the waiting set.
    async fn waiting_head(&self, limit: usize) -> Result<Vec<(String, f64)>, StoreError>;

    /// The store's wall clock as epoch milliseconds.
    async fn server_time_ms(&self) -> Result<i64, StoreError>;
}
