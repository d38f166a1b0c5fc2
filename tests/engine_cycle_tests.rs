mod test_helpers;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use dispatch::store::MemoryAgentStore;

use test_helpers::*;

#[dispatch::test]
async fn first_cycle_fills_capacity_then_backlog_drains() {
    with_timeout!(20000, {
        let store = Arc::new(MemoryAgentStore::new());
        let engine = build_engine(Arc::clone(&store), intervals(100, 10), fast_config(2));

        let (runs_a, reg_a) = counting_agent();
        let (runs_b, reg_b) = counting_agent();
        let (runs_c, reg_c) = counting_agent();
        assert!(engine.register("agent-a", reg_a).await);
        assert!(engine.register("agent-b", reg_b).await);
        assert!(engine.register("agent-c", reg_c).await);
        assert_eq!(store.waiting_len(), 3);

        // All three are due but only two permits exist.
        let first = engine.saturate_pool(1, None).await;
        assert_eq!(first, 2);
        assert_eq!(store.working_len(), 2);
        assert_eq!(store.waiting_len(), 1);

        wait_until("first wave to finish", || engine.active_count() == 0).await;

        // The next cycle releases the finished pair and claims the leftover.
        let second = engine.saturate_pool(2, None).await;
        assert_eq!(second, 1);

        wait_until("all agents to have run", || {
            runs_a.load(Ordering::Acquire)
                + runs_b.load(Ordering::Acquire)
                + runs_c.load(Ordering::Acquire)
                == 3
        })
        .await;
        assert_eq!(runs_a.load(Ordering::Acquire), 1);
        assert_eq!(runs_b.load(Ordering::Acquire), 1);
        assert_eq!(runs_c.load(Ordering::Acquire), 1);

        let stats = engine.stats();
        assert_eq!(stats.acquired, 3);
    });
}

#[dispatch::test]
async fn completions_are_drained_before_acquisition_in_the_same_cycle() {
    with_timeout!(20000, {
        let store = Arc::new(MemoryAgentStore::new());
        // Zero period: a successful run is due again the moment it is
        // released back to waiting.
        let engine = build_engine(Arc::clone(&store), intervals(0, 10), fast_config(1));

        let (runs, registration) = counting_agent();
        assert!(engine.register("agent-a", registration).await);

        assert_eq!(engine.saturate_pool(1, None).await, 1);
        wait_until("run to finish", || engine.active_count() == 0).await;

        // The completion sits queued; the cycle must process it first or
        // the agent would still look busy and nothing could be claimed.
        assert_eq!(engine.saturate_pool(2, None).await, 1);
        wait_until("second run", || runs.load(Ordering::Acquire) == 2).await;
    });
}

#[dispatch::test]
async fn full_pool_acquires_nothing() {
    with_timeout!(20000, {
        let store = Arc::new(MemoryAgentStore::new());
        let engine = build_engine(Arc::clone(&store), intervals(100, 10), fast_config(2));

        let (_started_a, reg_a) = blocking_agent();
        let (_started_b, reg_b) = blocking_agent();
        let (_started_c, reg_c) = blocking_agent();
        assert!(engine.register("agent-a", reg_a).await);
        assert!(engine.register("agent-b", reg_b).await);
        assert!(engine.register("agent-c", reg_c).await);

        assert_eq!(engine.saturate_pool(1, None).await, 2);
        assert_eq!(engine.active_count(), 2);

        // Both permits are held by parked workers.
        assert_eq!(engine.saturate_pool(2, None).await, 0);
        assert_eq!(engine.active_count(), 2);
        assert_eq!(store.waiting_len(), 1);
        assert_eq!(store.working_len(), 2);
    });
}

#[dispatch::test]
async fn capacity_limit_caps_a_single_cycle() {
    with_timeout!(20000, {
        let store = Arc::new(MemoryAgentStore::new());
        let engine = build_engine(Arc::clone(&store), intervals(100, 10), fast_config(10));

        for id in ["agent-a", "agent-b", "agent-c"] {
            let (_runs, registration) = counting_agent();
            assert!(engine.register(id, registration).await);
        }

        assert_eq!(engine.saturate_pool(1, Some(1)).await, 1);
        assert_eq!(store.working_len(), 1);
    });
}

#[dispatch::test]
async fn shutdown_blocks_new_acquisitions() {
    with_timeout!(20000, {
        let store = Arc::new(MemoryAgentStore::new());
        let engine = build_engine(Arc::clone(&store), intervals(100, 10), fast_config(2));

        let (runs, registration) = counting_agent();
        assert!(engine.register("agent-a", registration).await);

        engine.begin_shutdown();
        assert!(engine.is_shutting_down());
        assert_eq!(engine.saturate_pool(1, None).await, 0);
        assert_eq!(store.working_len(), 0);
        assert_eq!(runs.load(Ordering::Acquire), 0);
    });
}

#[dispatch::test]
async fn shutdown_still_drains_queued_completions() {
    with_timeout!(20000, {
        let store = Arc::new(MemoryAgentStore::new());
        let engine = build_engine(Arc::clone(&store), intervals(100, 10), fast_config(2));

        let (_runs, registration) = counting_agent();
        assert!(engine.register("agent-a", registration).await);

        assert_eq!(engine.saturate_pool(1, None).await, 1);
        wait_until("run to finish", || engine.active_count() == 0).await;

        // The release for the finished run happens even though acquisition
        // is fenced off.
        engine.begin_shutdown();
        assert_eq!(engine.saturate_pool(2, None).await, 0);
        assert_eq!(store.working_len(), 0);
        assert_eq!(store.waiting_len(), 1);
        assert_eq!(engine.stats().succeeded, 1);
    });
}

#[dispatch::test]
async fn stats_track_cycles_and_outcomes() {
    with_timeout!(20000, {
        let store = Arc::new(MemoryAgentStore::new());
        let engine = build_engine(Arc::clone(&store), intervals(100, 10), fast_config(4));

        let (_ok_runs, ok_reg) = counting_agent();
        let (_bad_runs, bad_reg) = failing_agent("schema validation rejected the payload");
        assert!(engine.register("agent-ok", ok_reg).await);
        assert!(engine.register("agent-bad", bad_reg).await);

        assert_eq!(engine.saturate_pool(1, None).await, 2);
        wait_until("both runs to finish", || engine.active_count() == 0).await;
        engine.saturate_pool(2, None).await;

        let stats = engine.stats();
        assert!(stats.cycles >= 2);
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
    });
}

#[dispatch::test]
async fn stats_snapshot_serializes_for_operators() {
    with_timeout!(20000, {
        let store = Arc::new(MemoryAgentStore::new());
        let engine = build_engine(Arc::clone(&store), intervals(100, 10), fast_config(4));

        let (_runs, reg) = counting_agent();
        assert!(engine.register("agent-json", reg).await);
        assert_eq!(engine.saturate_pool(1, None).await, 1);

        let value = serde_json::to_value(engine.stats()).expect("serialize stats");
        assert_eq!(value["cycles"], 1);
        assert_eq!(value["acquired"], 1);
        assert!(value["success_rate"].is_number());
        assert!(value["started_at"].is_string());
        assert!(value["uptime_secs"].is_u64());

        engine.begin_shutdown();
        engine.force_requeue_inflight().await;
    });
}
