//! Legacy manual-lock surface.
//!
//! Predates score-based coordination and is kept only so old callers can
//! probe it. It grants nothing; scheduling exclusivity comes entirely
//! from the waiting and working sets.

/// A manual lease over one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualLease {
    pub agent_id: String,
    pub token: u64,
}

pub trait ManualLock: Send + Sync {
    /// Try to take a manual lease. `None` means the implementation does
    /// not support manual locking.
    fn try_lock(&self, agent_id: &str) -> Option<ManualLease>;

    /// Release a previously granted lease.
    fn release(&self, lease: &ManualLease) -> bool;

    /// Whether the lease is still held.
    fn is_valid(&self, lease: &ManualLease) -> bool;
}

#[deprecated(note = "manual locking is unsupported; exclusivity comes from the waiting/working sets")]
pub struct UnsupportedManualLock;

#[allow(deprecated)]
impl ManualLock for UnsupportedManualLock {
    fn try_lock(&self, _agent_id: &str) -> Option<ManualLease> {
        None
    }

    fn release(&self, _lease: &ManualLease) -> bool {
        false
    }

    fn is_valid(&self, _lease: &ManualLease) -> bool {
        false
    }
}
