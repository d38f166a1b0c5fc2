//! Store-clock skew correction.
//!
//! Scores written to the shared store must agree across the fleet, so every
//! score computation goes through a process-wide offset between the store's
//! clock and the local clock. The offset is refreshed lazily, at most once
//! per cache period, and survives store read failures by keeping the last
//! known value.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::store::AgentStore;

static SERVER_OFFSET_MS: AtomicI64 = AtomicI64::new(0);
static LAST_SYNC_MS: AtomicI64 = AtomicI64::new(0);

/// Local wall clock as epoch milliseconds.
pub fn local_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Epoch milliseconds corrected to the store's clock.
///
/// Refreshes the cached offset from the store when `cache_ms` has elapsed
/// since the last successful sync. Concurrent callers race on a single
/// compare-and-swap so only one of them performs the store round-trip.
pub async fn now_ms(store: &dyn AgentStore, cache_ms: i64) -> i64 {
    let local = local_now_ms();
    let last = LAST_SYNC_MS.load(Ordering::Acquire);
    if local.saturating_sub(last) >= cache_ms
        && LAST_SYNC_MS
            .compare_exchange(last, local, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    {
        match store.server_time_ms().await {
            Ok(server) => {
                let offset = server - local_now_ms();
                SERVER_OFFSET_MS.store(offset, Ordering::Release);
                debug!(offset_ms = offset, "clock: refreshed store offset");
            }
            Err(err) => {
                // Keep the previous offset; a stale correction beats none.
                debug!(error = %err, "clock: offset refresh failed");
            }
        }
    }
    local_now_ms() + SERVER_OFFSET_MS.load(Ordering::Acquire)
}

/// Store-corrected time as an epoch-second score.
pub async fn score_now(store: &dyn AgentStore, cache_ms: i64) -> f64 {
    now_ms(store, cache_ms).await as f64 / 1000.0
}

/// Drop the cached offset so the next call re-syncs. Test hook.
pub fn reset_for_tests() {
    SERVER_OFFSET_MS.store(0, Ordering::Release);
    LAST_SYNC_MS.store(0, Ordering::Release);
}
