//! Tiered poller tests
//!
//! These tests verify that:
//! - Tiers write disjoint fields of the current stats
//! - Only the live tier decides whether a node is online
//! - The poller stops itself when its node is deleted

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use homelab_monitoring::actors::messages::{TierIntervals, TierOutcome};
use homelab_monitoring::actors::tiered::{TieredPollerHandle, run_tier};
use homelab_monitoring::batch::cmd_marker;
use homelab_monitoring::commands::Tier;
use homelab_monitoring::error::CoreError;
use homelab_monitoring::node::GuestType;
use homelab_monitoring::storage::{MemoryBackend, StorageBackend};
use pretty_assertions::assert_eq;

use crate::helpers::*;

fn slow_intervals() -> TierIntervals {
    TierIntervals {
        live: Duration::from_secs(3_600),
        status: Duration::from_secs(3_600),
        hardware: Duration::from_secs(3_600),
    }
}

#[tokio::test]
async fn test_live_and_status_fields_coexist() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let ctx = context(&storage, &executor, quiet_settings());
    let node = create_standalone(&storage, "server", "10.0.1.1").await;

    executor.on("---CMD:system.uptime---", Reply::Output(live_output(2.0)));
    executor.on("---CMD:storage.df---", Reply::Output(status_output(40, 51.0)));

    assert_eq!(run_tier(&ctx, node.id, Tier::Live).await.unwrap(), TierOutcome::Collected);
    assert_eq!(run_tier(&ctx, node.id, Tier::Status).await.unwrap(), TierOutcome::Collected);

    let stats = storage.current_stats(node.id).await.unwrap().unwrap();
    assert_eq!(stats.cpu_percent, Some(50.0));
    assert_eq!(stats.load_1m, Some(2.0));
    assert_eq!(stats.ram_percent, Some(25.0));
    assert_eq!(stats.disk_percent, Some(40.0));
    assert_eq!(stats.temp_cpu, Some(51.0));
    assert_eq!(stats.net_rx_bytes, Some(1000));
    assert_eq!(stats.net_tx_bytes, Some(2000));
    assert!(stats.tier1_updated_at.is_some());
    assert!(stats.tier2_updated_at.is_some());
}

#[tokio::test]
async fn test_status_tier_never_clears_live_fields() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let ctx = context(&storage, &executor, quiet_settings());
    let node = create_standalone(&storage, "server", "10.0.1.2").await;

    executor.on("---CMD:system.uptime---", Reply::Output(live_output(1.0)));
    run_tier(&ctx, node.id, Tier::Live).await.unwrap();
    let before = storage.current_stats(node.id).await.unwrap().unwrap();

    executor.on("---CMD:storage.df---", Reply::Output(status_output(70, 40.0)));
    run_tier(&ctx, node.id, Tier::Status).await.unwrap();
    run_tier(&ctx, node.id, Tier::Status).await.unwrap();

    let after = storage.current_stats(node.id).await.unwrap().unwrap();
    assert_eq!(after.cpu_percent, before.cpu_percent);
    assert_eq!(after.load_1m, before.load_1m);
    assert_eq!(after.ram_used_bytes, before.ram_used_bytes);
    assert_eq!(after.uptime_seconds, before.uptime_seconds);
    assert_eq!(after.tier1_updated_at, before.tier1_updated_at);
    assert_eq!(after.disk_percent, Some(70.0));
}

#[tokio::test]
async fn test_status_failure_keeps_node_online() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let ctx = context(&storage, &executor, quiet_settings());
    let node = create_standalone(&storage, "server", "10.0.1.3").await;

    executor.on("---CMD:system.uptime---", Reply::Output(live_output(0.5)));
    run_tier(&ctx, node.id, Tier::Live).await.unwrap();

    executor.on("---CMD:storage.df---", Reply::Timeout);
    let outcome = run_tier(&ctx, node.id, Tier::Status).await.unwrap();
    assert_matches!(outcome, TierOutcome::Failed(_));

    let stored = storage.get_node(node.id).await.unwrap().unwrap();
    assert!(stored.online);
    assert_eq!(stored.last_error, None);
    assert_eq!(ctx.breaker.failures(node.id), 0);
}

#[tokio::test]
async fn test_failed_live_tier_keeps_stale_stats() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let ctx = context(&storage, &executor, quiet_settings());
    let node = create_standalone(&storage, "server", "10.0.1.4").await;

    executor.on("---CMD:system.uptime---", Reply::Output(live_output(3.0)));
    run_tier(&ctx, node.id, Tier::Live).await.unwrap();

    executor.on("---CMD:system.uptime---", Reply::Refused);
    run_tier(&ctx, node.id, Tier::Live).await.unwrap();

    let stats = storage.current_stats(node.id).await.unwrap().unwrap();
    assert_eq!(stats.load_1m, Some(3.0));

    let stored = storage.get_node(node.id).await.unwrap().unwrap();
    assert!(!stored.online);
    assert_eq!(stored.last_error.as_deref(), Some("ssh connection failed: connection refused"));
}

#[tokio::test]
async fn test_hardware_tier_writes_separate_record() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let ctx = context(&storage, &executor, quiet_settings());
    let node = create_standalone(&storage, "server", "10.0.1.5").await;

    let output = format!(
        "{}\n{}\n{}\n00:02.0 \"VGA compatible controller\" \"Intel Corporation\" \"UHD Graphics 630\"\n",
        cmd_marker("hardware.fastfetch"),
        r#"[{"type":"CPU","result":{"cpu":"Intel Core i5-8500T","cores":{"physical":6,"logical":6}}},{"type":"Memory","result":{"total":16777216000}}]"#,
        cmd_marker("hardware.lspci"),
    );
    executor.on("---CMD:hardware.fastfetch---", Reply::Output(output));

    assert_eq!(run_tier(&ctx, node.id, Tier::Hardware).await.unwrap(), TierOutcome::Collected);

    let hw = storage.hardware(node.id).await.unwrap().unwrap();
    assert_eq!(hw.cpu_model.as_deref(), Some("Intel Core i5-8500T"));
    assert_eq!(hw.cpu_cores, Some(6));
    assert_eq!(hw.ram_total_bytes, Some(16_777_216_000));
    assert_eq!(hw.pci_devices.len(), 1);

    assert_eq!(storage.current_stats(node.id).await.unwrap(), None);
}

#[tokio::test]
async fn test_disabled_node_is_not_polled() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let ctx = context(&storage, &executor, quiet_settings());

    let mut new = homelab_monitoring::node::NewNode::standalone("off", "10.0.1.6");
    new.monitoring_enabled = false;
    let node = storage.upsert_node(new).await.unwrap();

    assert_eq!(run_tier(&ctx, node.id, Tier::Live).await.unwrap(), TierOutcome::Disabled);
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn test_guest_node_is_rejected() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let ctx = context(&storage, &executor, quiet_settings());
    let host = create_proxmox_host(&storage, "pve", "10.0.1.7").await;
    let guest = create_guest(&storage, &host, 101, GuestType::Lxc, true).await;

    let err = run_tier(&ctx, guest.id, Tier::Live).await.unwrap_err();
    assert_matches!(
        err.downcast_ref::<CoreError>(),
        Some(CoreError::GuestInDirectPoller { .. })
    );
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn test_poll_now_through_handle() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let ctx = context(&storage, &executor, quiet_settings());
    let node = create_standalone(&storage, "server", "10.0.1.8").await;

    executor.on("---CMD:system.uptime---", Reply::Output(live_output(1.0)));
    executor.on("---CMD:storage.df---", Reply::Refused);

    let handle = TieredPollerHandle::spawn(node.id, ctx, slow_intervals());

    assert_eq!(handle.poll_now(Tier::Live).await.unwrap(), TierOutcome::Collected);
    assert_matches!(handle.poll_now(Tier::Status).await.unwrap(), TierOutcome::Failed(_));

    let status = handle.status();
    assert!(status.running);
    assert_eq!(status.last_error(Tier::Live), None);
    assert!(status.last_error(Tier::Status).is_some());

    handle.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_running());
}

#[tokio::test]
async fn test_poller_stops_when_node_is_gone() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let ctx = context(&storage, &executor, quiet_settings());

    // no node with this id exists
    let handle = TieredPollerHandle::spawn(4242, ctx, slow_intervals());

    for _ in 0..50 {
        if !handle.is_running() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(!handle.is_running());
    assert_eq!(executor.calls(), 0);
}
