//! Discovery sync tests
//!
//! Child nodes follow the guest inventory of their host. Repeated syncs
//! must not create duplicates and guests that vanish are kept but marked
//! offline.

use std::sync::Arc;

use homelab_monitoring::discovery::{ORPHAN_MESSAGE, SingleSyncOutcome};
use homelab_monitoring::node::{GuestStatus, GuestType};
use homelab_monitoring::storage::{MemoryBackend, StorageBackend};
use pretty_assertions::assert_eq;

use crate::helpers::*;

#[tokio::test]
async fn test_single_guest_sync_is_idempotent() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    executor.on("hostname -I", Reply::Output("192.168.10.21 fd00::21\n".to_string()));
    let sync = discovery(&storage, &executor);

    let host = create_proxmox_host(&storage, "pve", "10.0.3.1").await;
    storage
        .replace_guests(host.id, vec![guest(101, "web", GuestStatus::Running, GuestType::Lxc)])
        .await
        .unwrap();

    let first = sync.sync_single_guest(host.id, 101, GuestType::Lxc).await.unwrap();
    let SingleSyncOutcome::Created(child_id) = first else {
        panic!("expected a new child, got {first:?}");
    };
    let created = storage.get_node(child_id).await.unwrap().unwrap();
    assert_eq!(created.name, "web");
    assert_eq!(created.parent_id, Some(host.id));
    assert_eq!(created.guest_ip.as_deref(), Some("192.168.10.21"));
    assert!(created.online);

    let second = sync.sync_single_guest(host.id, 101, GuestType::Lxc).await.unwrap();
    assert_eq!(second, SingleSyncOutcome::Updated(child_id));

    let after = storage.get_node(child_id).await.unwrap().unwrap();
    assert_eq!(after, created);
    assert_eq!(storage.list_children(host.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_repeated_host_sync_creates_no_duplicates() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    executor.on("hostname -I", Reply::Output("192.168.10.30\n".to_string()));
    let sync = discovery(&storage, &executor);

    let host = create_proxmox_host(&storage, "pve", "10.0.3.2").await;
    storage
        .replace_guests(
            host.id,
            vec![
                guest(100, "router", GuestStatus::Running, GuestType::Vm),
                guest(200, "dns", GuestStatus::Running, GuestType::Lxc),
                guest(201, "backup", GuestStatus::Stopped, GuestType::Lxc),
            ],
        )
        .await
        .unwrap();

    let first = sync.sync_host(host.id).await.unwrap();
    assert!(!first.skipped);
    assert_eq!(first.created, 3);
    assert_eq!(first.updated, 0);
    assert!(first.errors.is_empty());

    let second = sync.sync_host(host.id).await.unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.updated, 3);

    let children = storage.list_children(host.id).await.unwrap();
    assert_eq!(children.len(), 3);

    let backup = children.iter().find(|c| c.name == "backup").unwrap();
    assert!(!backup.online);
    assert_eq!(backup.last_error.as_deref(), Some("guest is stopped"));
    assert_eq!(backup.guest_ip, None);
}

#[tokio::test]
async fn test_vanished_guest_is_marked_offline_not_deleted() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let sync = discovery(&storage, &executor);

    let host = create_proxmox_host(&storage, "pve", "10.0.3.3").await;
    let kept_a = create_guest(&storage, &host, 101, GuestType::Lxc, true).await;
    let kept_b = create_guest(&storage, &host, 103, GuestType::Lxc, true).await;
    let gone = create_guest(&storage, &host, 105, GuestType::Lxc, true).await;

    let orphans = sync
        .orphaned_children(host.id, &[101, 103], GuestType::Lxc)
        .await
        .unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].id, gone.id);

    storage
        .replace_guests(
            host.id,
            vec![
                guest(101, "lxc-101", GuestStatus::Running, GuestType::Lxc),
                guest(103, "lxc-103", GuestStatus::Running, GuestType::Lxc),
            ],
        )
        .await
        .unwrap();

    let report = sync.sync_host(host.id).await.unwrap();
    assert_eq!(report.orphaned, 1);
    assert_eq!(report.created, 0);

    let gone = storage.get_node(gone.id).await.unwrap().unwrap();
    assert!(!gone.online);
    assert_eq!(gone.last_error.as_deref(), Some(ORPHAN_MESSAGE));

    for id in [kept_a.id, kept_b.id] {
        assert!(storage.get_node(id).await.unwrap().unwrap().online);
    }
}

#[tokio::test]
async fn test_returning_stopped_guest_drops_orphan_message() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let sync = discovery(&storage, &executor);

    let host = create_proxmox_host(&storage, "pve", "10.0.3.5").await;
    let child = create_guest(&storage, &host, 105, GuestType::Lxc, true).await;

    storage.replace_guests(host.id, Vec::new()).await.unwrap();
    assert_eq!(sync.sync_host(host.id).await.unwrap().orphaned, 1);
    let orphan = storage.get_node(child.id).await.unwrap().unwrap();
    assert_eq!(orphan.last_error.as_deref(), Some(ORPHAN_MESSAGE));

    storage
        .replace_guests(host.id, vec![guest(105, "lxc-105", GuestStatus::Stopped, GuestType::Lxc)])
        .await
        .unwrap();

    for _ in 0..2 {
        let report = sync.sync_host(host.id).await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.orphaned, 0);

        let back = storage.get_node(child.id).await.unwrap().unwrap();
        assert!(!back.online);
        assert_eq!(back.last_error.as_deref(), Some("guest is stopped"));
    }
}

#[tokio::test]
async fn test_sync_all_hosts_summary() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let sync = discovery(&storage, &executor);

    let host = create_proxmox_host(&storage, "pve", "10.0.3.4").await;
    create_guest(&storage, &host, 150, GuestType::Vm, true).await;
    storage
        .replace_guests(host.id, vec![guest(151, "nas", GuestStatus::Stopped, GuestType::Vm)])
        .await
        .unwrap();

    // opted out, never touched
    create_standalone(&storage, "laptop", "10.0.3.5").await;

    let summary = sync.sync_all_hosts().await.unwrap();
    assert_eq!(summary.hosts, 1);
    assert_eq!(summary.created, 1);
    assert_eq!(summary.deleted, 1);
    assert!(summary.errors.is_empty());

    let status = sync.status(host.id).await.unwrap();
    assert!(status.enabled);
    assert!(status.is_hypervisor);
    assert!(status.last_sync.is_some());
    assert_eq!(status.guests, 1);
    assert_eq!(status.children, 2);
    assert_eq!(status.vms, 2);
    assert_eq!(status.online, 0);
}

#[tokio::test]
async fn test_fill_missing_guest_ips() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let sync = discovery(&storage, &executor);

    let host = create_proxmox_host(&storage, "pve", "10.0.3.6").await;
    let vm = create_guest(&storage, &host, 120, GuestType::Vm, true).await;
    let ct = create_guest(&storage, &host, 220, GuestType::Lxc, true).await;
    let off = create_guest(&storage, &host, 221, GuestType::Lxc, false).await;

    executor.on(
        "qm guest exec 120",
        Reply::Output(r#"{"exitcode":0,"exited":1,"out-data":"192.168.10.120 \n"}"#.to_string()),
    );
    executor.on("pct exec 220", Reply::Output("not an address\n".to_string()));

    let filled = sync.fill_missing_guest_ips().await.unwrap();
    assert_eq!(filled, 1);

    let vm = storage.get_node(vm.id).await.unwrap().unwrap();
    assert_eq!(vm.guest_ip.as_deref(), Some("192.168.10.120"));

    let ct = storage.get_node(ct.id).await.unwrap().unwrap();
    assert_eq!(ct.guest_ip, None);

    // offline guests are not asked
    assert!(
        executor
            .commands()
            .iter()
            .all(|(_, command)| !command.contains("pct exec 221"))
    );
    assert_eq!(storage.get_node(off.id).await.unwrap().unwrap().guest_ip, None);
}
