//! Circuit breaker behaviour as seen through the live tier
//!
//! A node that stops answering is marked offline, the breaker opens after
//! the third failure and the node is left alone until the open timeout has
//! passed. One successful probe closes it again.

use std::sync::Arc;
use std::time::Duration;

use homelab_monitoring::actors::messages::TierOutcome;
use homelab_monitoring::actors::tiered::run_tier;
use homelab_monitoring::circuit_breaker::BreakerState;
use homelab_monitoring::commands::Tier;
use homelab_monitoring::storage::{MemoryBackend, StorageBackend};
use pretty_assertions::assert_eq;

use crate::helpers::*;

#[tokio::test]
async fn test_unreachable_node_opens_breaker_and_recovers() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let ctx = context(&storage, &executor, quiet_settings());
    let node = create_standalone(&storage, "pi", "10.0.0.10").await;

    executor.on("---CMD:system.uptime---", Reply::Timeout);

    for attempt in 1..=3 {
        let outcome = run_tier(&ctx, node.id, Tier::Live).await.unwrap();
        assert!(
            matches!(outcome, TierOutcome::Failed(ref msg) if msg.contains("timed out")),
            "attempt {attempt} should fail with a timeout, got {outcome:?}"
        );
    }

    assert_eq!(ctx.breaker.state(node.id), BreakerState::Open);
    assert_eq!(executor.calls(), 3);

    let stored = storage.get_node(node.id).await.unwrap().unwrap();
    assert!(!stored.online);
    assert!(stored.last_error.unwrap().contains("timed out"));

    // still inside the open window: no remote call at all
    let outcome = run_tier(&ctx, node.id, Tier::Live).await.unwrap();
    assert_eq!(outcome, TierOutcome::CircuitOpen);
    assert_eq!(executor.calls(), 3);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    executor.on("---CMD:system.uptime---", Reply::Output(live_output(1.0)));

    let outcome = run_tier(&ctx, node.id, Tier::Live).await.unwrap();
    assert_eq!(outcome, TierOutcome::Collected);
    assert_eq!(executor.calls(), 4);

    assert_eq!(ctx.breaker.state(node.id), BreakerState::Closed);
    assert_eq!(ctx.breaker.failures(node.id), 0);

    let stored = storage.get_node(node.id).await.unwrap().unwrap();
    assert!(stored.online);
    assert_eq!(stored.last_error, None);
}

#[tokio::test]
async fn test_failed_probe_reopens_breaker() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let ctx = context(&storage, &executor, quiet_settings());
    let node = create_standalone(&storage, "nas", "10.0.0.11").await;

    executor.on("---CMD:system.uptime---", Reply::Refused);
    for _ in 0..3 {
        run_tier(&ctx, node.id, Tier::Live).await.unwrap();
    }
    assert_eq!(ctx.breaker.state(node.id), BreakerState::Open);

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let outcome = run_tier(&ctx, node.id, Tier::Live).await.unwrap();
    assert!(matches!(outcome, TierOutcome::Failed(_)));
    assert_eq!(ctx.breaker.state(node.id), BreakerState::Open);
    assert_eq!(ctx.breaker.failures(node.id), 4);

    let outcome = run_tier(&ctx, node.id, Tier::Live).await.unwrap();
    assert_eq!(outcome, TierOutcome::CircuitOpen);
}

#[tokio::test]
async fn test_slow_tiers_do_not_probe_open_breaker() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let ctx = context(&storage, &executor, quiet_settings());
    let node = create_standalone(&storage, "router", "10.0.0.12").await;

    executor.on("---CMD:system.uptime---", Reply::Timeout);
    for _ in 0..3 {
        run_tier(&ctx, node.id, Tier::Live).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    // the half-open probe belongs to the live tier
    assert_eq!(
        run_tier(&ctx, node.id, Tier::Status).await.unwrap(),
        TierOutcome::CircuitOpen
    );
    assert_eq!(
        run_tier(&ctx, node.id, Tier::Hardware).await.unwrap(),
        TierOutcome::CircuitOpen
    );
    assert_eq!(ctx.breaker.state(node.id), BreakerState::Open);
    assert_eq!(executor.calls(), 3);
}
