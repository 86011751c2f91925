//! Collection results survive a restart of the SQLite backend

use std::sync::Arc;

use homelab_monitoring::actors::CollectorContext;
use homelab_monitoring::actors::messages::TierOutcome;
use homelab_monitoring::actors::tiered::run_tier;
use homelab_monitoring::commands::Tier;
use homelab_monitoring::discovery::ORPHAN_MESSAGE;
use homelab_monitoring::node::{GuestStatus, GuestType, NewNode};
use homelab_monitoring::storage::StorageBackend;
use homelab_monitoring::storage::sqlite::SqliteBackend;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::helpers::*;

#[tokio::test]
async fn test_stats_persist_across_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hub.db");

    let executor = MockExecutor::new();
    executor.on("---CMD:system.uptime---", Reply::Output(live_output(2.0)));
    executor.on("---CMD:storage.df---", Reply::Output(status_output(55, 48.0)));

    let node_id = {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::new(&path).await.unwrap());
        let ctx = CollectorContext::new(Arc::clone(&storage), executor.clone(), quiet_settings());
        let node = storage
            .upsert_node(NewNode::standalone("server", "10.0.5.1"))
            .await
            .unwrap();

        assert_eq!(run_tier(&ctx, node.id, Tier::Live).await.unwrap(), TierOutcome::Collected);
        assert_eq!(run_tier(&ctx, node.id, Tier::Status).await.unwrap(), TierOutcome::Collected);

        storage.close().await.unwrap();
        node.id
    };

    let storage = SqliteBackend::new(&path).await.unwrap();

    let node = storage.get_node(node_id).await.unwrap().unwrap();
    assert!(node.online);
    assert_eq!(node.last_error, None);

    let stats = storage.current_stats(node_id).await.unwrap().unwrap();
    assert_eq!(stats.load_1m, Some(2.0));
    assert_eq!(stats.disk_percent, Some(55.0));
    assert_eq!(stats.temp_cpu, Some(48.0));
}

#[tokio::test]
async fn test_discovery_is_idempotent_on_sqlite() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(SqliteBackend::new(dir.path().join("hub.db")).await.unwrap());

    let executor = MockExecutor::new();
    let sync = homelab_monitoring::discovery::DiscoverySync::new(
        storage.clone(),
        executor.clone(),
        Default::default(),
    );

    let mut new = NewNode::standalone("pve", "10.0.5.2");
    new.auto_discovery = true;
    let host = storage.upsert_node(new).await.unwrap();
    storage.set_hypervisor(host.id, true).await.unwrap();
    storage
        .replace_guests(
            host.id,
            vec![
                guest(101, "web", GuestStatus::Stopped, GuestType::Vm),
                guest(102, "db", GuestStatus::Stopped, GuestType::Lxc),
            ],
        )
        .await
        .unwrap();

    assert_eq!(sync.sync_host(host.id).await.unwrap().created, 2);
    assert_eq!(sync.sync_host(host.id).await.unwrap().created, 0);
    assert_eq!(storage.list_children(host.id).await.unwrap().len(), 2);

    storage
        .replace_guests(host.id, vec![guest(101, "web", GuestStatus::Stopped, GuestType::Vm)])
        .await
        .unwrap();
    let report = sync.sync_host(host.id).await.unwrap();
    assert_eq!(report.orphaned, 1);

    let db = storage
        .find_child_by_guest(host.id, 102, GuestType::Lxc)
        .await
        .unwrap()
        .unwrap();
    assert!(!db.online);
    assert_eq!(db.last_error.as_deref(), Some(ORPHAN_MESSAGE));
}
