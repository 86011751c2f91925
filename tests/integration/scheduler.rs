//! Scheduler coordinator tests
//!
//! These tests verify that:
//! - The global tick collects due nodes in bounded chunks
//! - Overlapping ticks are skipped rather than queued
//! - Per-node start/stop and manual collection behave
//! - Discovery picks up guests reported by host collection
//! - Startup is staged and shutdown lets running jobs finish

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use homelab_monitoring::circuit_breaker::BreakerState;
use homelab_monitoring::config::SchedulerConfig;
use homelab_monitoring::error::CoreError;
use homelab_monitoring::node::{GuestStatus, GuestType, NewNode};
use homelab_monitoring::scheduler::{SchedulerCoordinator, TickReport};
use homelab_monitoring::storage::{MemoryBackend, StatsHistoryRow, StorageBackend};
use pretty_assertions::assert_eq;

use crate::helpers::*;

const RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

fn coordinator(storage: &Arc<MemoryBackend>, executor: &Arc<MockExecutor>) -> Arc<SchedulerCoordinator> {
    SchedulerCoordinator::new(
        context(storage, executor, quiet_settings()),
        discovery(storage, executor),
        RETENTION,
    )
}

/// Settings for `start_all` tests: discovery right away, nothing else soon
fn staged_settings(child_poller_delay_secs: u64) -> SchedulerConfig {
    SchedulerConfig {
        tick_ms: 60_000,
        discovery_delay_secs: 0,
        child_poller_delay_secs,
        ip_sweep_delay_secs: 600,
        maintenance_interval_secs: 3_600,
        ..quiet_settings()
    }
}

fn staged_coordinator(
    storage: &Arc<MemoryBackend>,
    executor: &Arc<MockExecutor>,
    child_poller_delay_secs: u64,
) -> Arc<SchedulerCoordinator> {
    SchedulerCoordinator::new(
        context(storage, executor, staged_settings(child_poller_delay_secs)),
        discovery(storage, executor),
        RETENTION,
    )
}

fn history_row(node_id: i64, age: chrono::Duration) -> StatsHistoryRow {
    StatsHistoryRow {
        node_id,
        timestamp: Utc::now() - age,
        cpu_percent: Some(10.0),
        load_1m: Some(0.4),
        ram_percent: None,
        ram_used_bytes: None,
        disk_percent: None,
        temp_cpu: None,
        net_rx_bytes: None,
        net_tx_bytes: None,
    }
}

#[tokio::test]
async fn test_tick_collects_in_bounded_chunks() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    executor.on("===STATS===", Reply::Output(host_output(&[])));
    executor.set_delay(Duration::from_millis(100));
    let scheduler = coordinator(&storage, &executor);

    for i in 0..12 {
        create_standalone(&storage, &format!("node-{i}"), &format!("10.0.4.{i}")).await;
    }

    let report = scheduler.tick().await.unwrap().unwrap();
    assert_eq!(
        report,
        TickReport {
            due: 12,
            succeeded: 12,
            failed: 0,
        }
    );
    assert_eq!(executor.calls(), 12);
    assert!(executor.max_in_flight() <= 5, "max in flight: {}", executor.max_in_flight());

    // everything was just collected
    let report = scheduler.tick().await.unwrap().unwrap();
    assert_eq!(report.due, 0);
    assert_eq!(executor.calls(), 12);
}

#[tokio::test]
async fn test_failed_nodes_wait_a_full_interval() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    executor.on_host("10.0.4.20", "===STATS===", Reply::Output(host_output(&[])));
    executor.on_host("10.0.4.21", "===STATS===", Reply::Timeout);
    let scheduler = coordinator(&storage, &executor);

    create_standalone(&storage, "up", "10.0.4.20").await;
    let down = create_standalone(&storage, "down", "10.0.4.21").await;

    let report = scheduler.tick().await.unwrap().unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);

    let down = storage.get_node(down.id).await.unwrap().unwrap();
    assert!(!down.online);
    assert!(down.last_error.unwrap().contains("timed out"));

    let report = scheduler.tick().await.unwrap().unwrap();
    assert_eq!(report.due, 0);
}

#[tokio::test]
async fn test_overlapping_tick_is_skipped() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    executor.on("===STATS===", Reply::Output(host_output(&[])));
    executor.set_delay(Duration::from_millis(300));
    let scheduler = coordinator(&storage, &executor);

    create_standalone(&storage, "slow", "10.0.4.30").await;

    let first = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.tick().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(scheduler.tick().await.unwrap(), None);

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.map(|r| r.succeeded), Some(1));
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn test_start_and_stop_monitoring() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let scheduler = coordinator(&storage, &executor);

    let node = create_standalone(&storage, "server", "10.0.4.40").await;

    assert!(scheduler.start_monitoring(node.id).await.unwrap());
    assert!(!scheduler.start_monitoring(node.id).await.unwrap());
    assert!(scheduler.tiered_poller(node.id).is_some());

    assert!(scheduler.stop_monitoring(node.id).await.unwrap());
    assert!(!scheduler.stop_monitoring(node.id).await.unwrap());
    assert!(scheduler.tiered_poller(node.id).is_none());

    let mut disabled = NewNode::standalone("off", "10.0.4.41");
    disabled.monitoring_enabled = false;
    let disabled = storage.upsert_node(disabled).await.unwrap();
    assert!(!scheduler.start_monitoring(disabled.id).await.unwrap());

    let host = create_proxmox_host(&storage, "pve", "10.0.4.42").await;
    let guest = create_guest(&storage, &host, 101, GuestType::Lxc, true).await;
    let err = scheduler.start_monitoring(guest.id).await.unwrap_err();
    assert_matches!(
        err.downcast_ref::<CoreError>(),
        Some(CoreError::GuestInDirectPoller { .. })
    );

    scheduler.stop_all().await;
}

#[tokio::test]
async fn test_collect_now_respects_open_breaker() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    executor.on("===STATS===", Reply::Output(host_output(&[])));
    let scheduler = coordinator(&storage, &executor);

    let node = create_standalone(&storage, "server", "10.0.4.50").await;

    let stats = scheduler.collect_now(node.id).await.unwrap();
    assert_eq!(stats.load_1m, Some(1.0));
    assert_eq!(executor.calls(), 1);

    let breaker = &scheduler.context().breaker;
    for _ in 0..3 {
        breaker.record_failure(node.id);
    }
    assert_eq!(breaker.state(node.id), BreakerState::Open);

    assert!(scheduler.collect_now(node.id).await.is_err());
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn test_get_status() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    executor.on("===STATS===", Reply::Output(host_output(&[])));
    let scheduler = coordinator(&storage, &executor);

    let node = create_standalone(&storage, "server", "10.0.4.60").await;
    scheduler.tick().await.unwrap();

    let statuses = scheduler.get_status().await.unwrap();
    assert_eq!(statuses.len(), 1);

    let status = &statuses[0];
    assert_eq!(status.node_id, node.id);
    assert_eq!(status.name, "server");
    assert!(status.online);
    assert!(!status.running);
    assert_eq!(status.breaker, BreakerState::Closed);
    assert_eq!(status.last_error, None);
    assert_eq!(status.stats.as_ref().and_then(|s| s.disk_percent), Some(10.0));
}

#[tokio::test]
async fn test_maintenance_drops_old_history() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let scheduler = coordinator(&storage, &executor);

    let node = create_standalone(&storage, "server", "10.0.4.70").await;
    storage
        .append_stats_history(history_row(node.id, chrono::Duration::days(30)))
        .await
        .unwrap();
    storage
        .append_stats_history(history_row(node.id, chrono::Duration::hours(1)))
        .await
        .unwrap();

    let report = scheduler.maintenance().await.unwrap();
    assert_eq!(report.history_removed, 1);
    assert_eq!(report.breakers_removed, 0);

    assert_eq!(storage.stats_history(node.id, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_host_collection_feeds_discovery() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    executor.on(
        "===STATS===",
        Reply::Output(host_output(&[(101, "web", "running"), (102, "db", "stopped")])),
    );
    executor.on("hostname -I", Reply::Output("192.168.20.101\n".to_string()));
    let scheduler = coordinator(&storage, &executor);

    let mut new = NewNode::standalone("pve", "10.0.4.80");
    new.auto_discovery = true;
    let host = storage.upsert_node(new).await.unwrap();

    let report = scheduler.tick().await.unwrap().unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(storage.is_hypervisor(host.id).await.unwrap());
    assert_eq!(storage.list_guests(host.id).await.unwrap().len(), 2);

    let summary = scheduler.sync_now().await.unwrap();
    assert_eq!(summary.hosts, 1);
    assert_eq!(summary.created, 2);

    let children = storage.list_children(host.id).await.unwrap();
    let web = children.iter().find(|c| c.name == "web").unwrap();
    assert!(web.online);
    assert_eq!(web.guest(), Some((GuestType::Vm, 101)));
    assert_eq!(web.guest_ip.as_deref(), Some("192.168.20.101"));

    let db = children.iter().find(|c| c.name == "db").unwrap();
    assert!(!db.online);

    scheduler.stop_all().await;
}

#[tokio::test]
async fn test_child_pollers_start_after_delay() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    executor.on("===STATS===", Reply::Output(host_output(&[])));
    executor.on_host(
        "10.0.4.90",
        "===STATS===",
        Reply::Output(host_output(&[(101, "web", "running")])),
    );
    let scheduler = staged_coordinator(&storage, &executor, 1);

    let host = create_proxmox_host(&storage, "pve", "10.0.4.90").await;
    let plain = create_standalone(&storage, "nas", "10.0.4.91").await;

    scheduler.start_all().await.unwrap();

    assert!(scheduler.tiered_poller(host.id).is_some());
    assert!(scheduler.tiered_poller(plain.id).is_some());
    assert!(scheduler.child_poller(host.id).is_none());

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert!(scheduler.child_poller(host.id).is_some());
    assert!(scheduler.child_poller(plain.id).is_none());

    scheduler.stop_all().await;

    for id in [host.id, plain.id] {
        assert!(scheduler.tiered_poller(id).is_none());
        assert!(scheduler.child_poller(id).is_none());
    }
    assert!(scheduler.get_status().await.unwrap().iter().all(|s| !s.running));
}

#[tokio::test]
async fn test_stop_all_lets_running_discovery_finish() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    executor.on(
        "===STATS===",
        Reply::Output(host_output(&[(101, "web", "running")])),
    );
    executor.on("hostname -I", Reply::Output("10.0.9.50\n".to_string()));
    executor.set_delay(Duration::from_millis(400));
    let scheduler = staged_coordinator(&storage, &executor, 600);

    let host = create_proxmox_host(&storage, "pve", "10.0.4.95").await;
    storage
        .replace_guests(host.id, vec![guest(101, "web", GuestStatus::Running, GuestType::Vm)])
        .await
        .unwrap();

    scheduler.start_all().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // discovery is waiting on the guest address right now
    scheduler.stop_all().await;
    assert!(scheduler.tiered_poller(host.id).is_none());

    assert!(scheduler.wait_for_jobs(Duration::from_secs(5)).await);

    let children = storage.list_children(host.id).await.unwrap();
    assert_eq!(children.len(), 1);
    let web = &children[0];
    assert!(web.online);
    assert_eq!(web.guest_ip.as_deref(), Some("10.0.9.50"));

    // the finished run did not bring pollers back
    assert!(scheduler.tiered_poller(host.id).is_none());
    assert!(scheduler.child_poller(host.id).is_none());
}
