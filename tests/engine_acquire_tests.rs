mod test_helpers;

use std::sync::Arc;

use dispatch::breaker::BreakerState;
use dispatch::store::MemoryAgentStore;

use test_helpers::*;

#[dispatch::test]
async fn batch_failure_falls_back_to_individual_claims() {
    with_timeout!(20000, {
        let store = Arc::new(MemoryAgentStore::new());
        let engine = build_engine(Arc::clone(&store), intervals(100, 10), fast_config(10));

        for id in ["agent-a", "agent-b", "agent-c"] {
            let (_runs, registration) = counting_agent();
            assert!(engine.register(id, registration).await);
        }

        store.fail_next_batch_acquires(1);
        assert_eq!(engine.saturate_pool(1, None).await, 3);

        // One failed batch call, then every claim went through the
        // per-identifier path.
        assert_eq!(store.batch_attempts(), 1);
        assert_eq!(store.single_attempts(), 3);
        assert_eq!(store.working_len(), 3);
        assert_eq!(store.waiting_len(), 0);

        // A single script failure is nowhere near the breaker threshold.
        let status = engine.breaker_status();
        assert_eq!(status.store, BreakerState::Closed);
        assert_eq!(status.acquisition, BreakerState::Closed);
    });
}

#[dispatch::test]
async fn chunked_scan_walks_the_waiting_set_in_windows() {
    with_timeout!(20000, {
        let store = Arc::new(MemoryAgentStore::new());
        let mut config = fast_config(5);
        config.scheduler.batch_size = 2;
        let engine = build_engine(Arc::clone(&store), intervals(100, 10), config);

        for id in ["w-a", "w-b", "w-c", "w-d", "w-e"] {
            let (_runs, registration) = counting_agent();
            assert!(engine.register(id, registration).await);
        }

        assert_eq!(engine.saturate_pool(1, None).await, 5);
        // Five slots through windows of two: 2 + 2 + 1.
        assert_eq!(store.batch_attempts(), 3);
        assert_eq!(store.working_len(), 5);
    });
}

#[dispatch::test]
async fn filtered_entries_at_the_head_do_not_stall_the_scan() {
    with_timeout!(20000, {
        let store = Arc::new(MemoryAgentStore::new());
        let mut config = fast_config(3);
        config.scheduler.batch_size = 2;
        config.scheduler.disabled_pattern = Some("^blocked".to_string());
        let engine = build_engine(Arc::clone(&store), intervals(100, 10), config);

        for id in ["blocked-a", "blocked-b", "live-a", "live-b", "live-c"] {
            let (_runs, registration) = counting_agent();
            assert!(engine.register(id, registration).await);
        }
        // The two filtered agents occupy the oldest scan window.
        let now = now_secs();
        store.seed_waiting("blocked-a", now - 50.0);
        store.seed_waiting("blocked-b", now - 49.0);
        store.seed_waiting("live-a", now - 3.0);
        store.seed_waiting("live-b", now - 2.0);
        store.seed_waiting("live-c", now - 1.0);

        assert_eq!(engine.saturate_pool(1, None).await, 3);
        // First window came back empty; the offset kept advancing.
        assert_eq!(store.batch_attempts(), 3);
        assert!(store.waiting_score("blocked-a").is_some());
        assert!(store.waiting_score("blocked-b").is_some());
        assert!(store.working_score("live-a").is_some());
        assert!(store.working_score("live-b").is_some());
        assert!(store.working_score("live-c").is_some());
    });
}

#[dispatch::test]
async fn earliest_scores_win_when_capacity_is_short() {
    with_timeout!(20000, {
        let store = Arc::new(MemoryAgentStore::new());
        let engine = build_engine(Arc::clone(&store), intervals(100, 10), fast_config(1));

        let (_runs_old, reg_old) = counting_agent();
        let (_runs_new, reg_new) = counting_agent();
        assert!(engine.register("agent-oldest", reg_old).await);
        assert!(engine.register("agent-newer", reg_new).await);
        let now = now_secs();
        store.seed_waiting("agent-oldest", now - 100.0);
        store.seed_waiting("agent-newer", now - 50.0);

        assert_eq!(engine.saturate_pool(1, None).await, 1);
        assert!(store.working_score("agent-oldest").is_some());
        assert!(store.waiting_score("agent-newer").is_some());
    });
}

#[dispatch::test]
async fn store_outage_trips_both_breakers_and_reset_recovers() {
    with_timeout!(20000, {
        let store = Arc::new(MemoryAgentStore::new());
        let engine = build_engine(Arc::clone(&store), intervals(100, 10), fast_config(4));

        let (_runs_a, reg_a) = counting_agent();
        let (_runs_b, reg_b) = counting_agent();
        assert!(engine.register("agent-a", reg_a).await);
        assert!(engine.register("agent-b", reg_b).await);

        store.fail_all_calls(true);
        for cycle in 1..=3 {
            assert_eq!(engine.saturate_pool(cycle, None).await, 0);
        }
        let status = engine.breaker_status();
        assert_eq!(status.store, BreakerState::Open);
        assert_eq!(status.acquisition, BreakerState::Open);

        // With the acquisition breaker open the cycle stops calling the
        // store entirely.
        let batch_before = store.batch_attempts();
        let single_before = store.single_attempts();
        assert_eq!(engine.saturate_pool(4, None).await, 0);
        assert_eq!(store.batch_attempts(), batch_before);
        assert_eq!(store.single_attempts(), single_before);

        store.fail_all_calls(false);
        engine.reset_breakers();
        assert_eq!(engine.saturate_pool(5, None).await, 2);
        let status = engine.breaker_status();
        assert_eq!(status.store, BreakerState::Closed);
        assert_eq!(status.acquisition, BreakerState::Closed);
    });
}

#[dispatch::test]
async fn script_failures_spare_the_store_breaker() {
    with_timeout!(20000, {
        let store = Arc::new(MemoryAgentStore::new());
        let mut config = fast_config(4);
        config.breaker.failure_threshold = 2;
        let engine = build_engine(Arc::clone(&store), intervals(100, 10), config);

        let (_runs_a, reg_a) = counting_agent();
        let (_runs_b, reg_b) = counting_agent();
        assert!(engine.register("agent-a", reg_a).await);
        assert!(engine.register("agent-b", reg_b).await);

        store.fail_next_batch_acquires(1);
        assert_eq!(engine.saturate_pool(1, None).await, 2);

        store.fail_next_batch_acquires(1);
        assert_eq!(engine.saturate_pool(2, None).await, 0);

        // Two script-level failures opened the acquisition breaker while
        // store connectivity still counts as healthy.
        let status = engine.breaker_status();
        assert_eq!(status.acquisition, BreakerState::Open);
        assert_eq!(status.store, BreakerState::Closed);
    });
}

#[dispatch::test]
async fn individual_mode_is_used_when_batching_is_disabled() {
    with_timeout!(20000, {
        let store = Arc::new(MemoryAgentStore::new());
        let mut config = fast_config(4);
        config.scheduler.batch_enabled = false;
        let engine = build_engine(Arc::clone(&store), intervals(100, 10), config);

        let (_runs_a, reg_a) = counting_agent();
        let (_runs_b, reg_b) = counting_agent();
        assert!(engine.register("agent-a", reg_a).await);
        assert!(engine.register("agent-b", reg_b).await);

        assert_eq!(engine.saturate_pool(1, None).await, 2);
        assert_eq!(store.batch_attempts(), 0);
        assert_eq!(store.single_attempts(), 2);
        assert_eq!(store.working_len(), 2);
    });
}
