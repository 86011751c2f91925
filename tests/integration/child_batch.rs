//! Child batch poller tests
//!
//! All guests of a host are polled through one remote call on the host.
//! Each guest gets its own verdict from its own slice of the output.

use std::sync::Arc;
use std::time::Duration;

use homelab_monitoring::actors::child::{ChildPollerHandle, poll_children};
use homelab_monitoring::batch::{CHILD_ERROR, child_end_marker, child_marker};
use homelab_monitoring::node::{GuestStatus, GuestType, NodeId};
use homelab_monitoring::storage::{MemoryBackend, StorageBackend};
use pretty_assertions::assert_eq;

use crate::helpers::*;

fn segment(id: NodeId, payload: &str) -> String {
    format!("{}\n{payload}\n{}\n", child_marker(id), child_end_marker(id))
}

#[tokio::test]
async fn test_all_guests_polled_in_one_call() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let ctx = context(&storage, &executor, quiet_settings());

    let host = create_proxmox_host(&storage, "pve", "10.0.2.1").await;
    let vm = create_guest(&storage, &host, 101, GuestType::Vm, true).await;
    let ct = create_guest(&storage, &host, 201, GuestType::Lxc, true).await;

    let output = format!(
        "{}{}",
        segment(
            vm.id,
            r#"{"exitcode":0,"exited":1,"out-data":"a1b2|web|nginx:latest|Up 2 hours|running\n"}"#
        ),
        segment(
            ct.id,
            "c3d4|db|postgres:16|Up 3 days|running\ne5f6|cache|redis:7|Exited (0) 1 day ago|exited"
        ),
    );
    executor.on_host("10.0.2.1", "---CHILD:", Reply::Output(output));

    let report = poll_children(&ctx, host.id).await.unwrap();
    assert_eq!(report.polled, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(executor.calls(), 1);

    let (called_host, script) = executor.commands().remove(0);
    assert_eq!(called_host, "10.0.2.1");
    assert!(script.contains("qm guest exec 101"));
    assert!(script.contains("pct exec 201"));

    let vm_containers = storage.list_containers(vm.id).await.unwrap();
    assert_eq!(vm_containers.len(), 1);
    assert_eq!(vm_containers[0].name, "web");

    let ct_containers = storage.list_containers(ct.id).await.unwrap();
    assert_eq!(ct_containers.len(), 2);
    assert_eq!(ct_containers[1].state, "exited");

    // the host itself is not judged by the child batch
    let stored_host = storage.get_node(host.id).await.unwrap().unwrap();
    assert_eq!(stored_host.last_error, None);
}

#[tokio::test]
async fn test_partial_results() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let ctx = context(&storage, &executor, quiet_settings());

    let host = create_proxmox_host(&storage, "pve", "10.0.2.2").await;
    let ok = create_guest(&storage, &host, 101, GuestType::Lxc, true).await;
    let broken = create_guest(&storage, &host, 102, GuestType::Lxc, true).await;
    let silent = create_guest(&storage, &host, 103, GuestType::Lxc, true).await;

    let output = format!(
        "{}{}",
        segment(ok.id, "a1b2|web|nginx|Up 1 hour|running"),
        segment(broken.id, CHILD_ERROR),
    );
    executor.on("---CHILD:", Reply::Output(output));

    let report = poll_children(&ctx, host.id).await.unwrap();
    assert_eq!(report.polled, 3);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 2);

    let ok = storage.get_node(ok.id).await.unwrap().unwrap();
    assert!(ok.online);
    assert_eq!(ctx.breaker.failures(ok.id), 0);

    let broken = storage.get_node(broken.id).await.unwrap().unwrap();
    assert!(!broken.online);
    assert_eq!(broken.last_error.as_deref(), Some("command failed or timed out"));
    assert_eq!(ctx.breaker.failures(broken.id), 1);

    let silent = storage.get_node(silent.id).await.unwrap().unwrap();
    assert!(!silent.online);
    assert_eq!(silent.last_error.as_deref(), Some("no output for guest in batch"));
    assert_eq!(ctx.breaker.failures(silent.id), 1);
}

#[tokio::test]
async fn test_offline_guest_is_not_polled() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let ctx = context(&storage, &executor, quiet_settings());

    let host = create_proxmox_host(&storage, "pve", "10.0.2.3").await;
    let offline = create_guest(&storage, &host, 110, GuestType::Vm, false).await;

    let report = poll_children(&ctx, host.id).await.unwrap();
    assert_eq!(report.polled, 0);
    assert_eq!(executor.calls(), 0);

    let offline = storage.get_node(offline.id).await.unwrap().unwrap();
    assert_eq!(offline.last_error, None);
    assert_eq!(ctx.breaker.failures(offline.id), 0);
}

#[tokio::test]
async fn test_overlapping_cycle_is_skipped() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let ctx = context(&storage, &executor, quiet_settings());

    let host = create_proxmox_host(&storage, "pve", "10.0.2.4").await;
    let guest = create_guest(&storage, &host, 101, GuestType::Lxc, true).await;

    executor.on(
        "---CHILD:",
        Reply::Output(segment(guest.id, "a1b2|web|nginx|Up 1 hour|running")),
    );
    executor.set_delay(Duration::from_millis(300));

    let handle = ChildPollerHandle::spawn(host.id, ctx);

    let first = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.poll_now().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = handle.poll_now().await.unwrap();
    assert!(second.skipped);

    let first = first.await.unwrap().unwrap();
    assert!(!first.skipped);
    assert_eq!(first.succeeded, 1);
    assert_eq!(executor.calls(), 1);

    let stats = handle.stats();
    assert_eq!(stats.poll_count, 1);
    assert_eq!(stats.skipped_count, 1);
    assert_eq!(stats.success_count, 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_guest_waits_for_discovery() {
    let storage = Arc::new(MemoryBackend::new());
    let executor = MockExecutor::new();
    let ctx = context(&storage, &executor, quiet_settings());
    let sync = discovery(&storage, &executor);

    let host = create_proxmox_host(&storage, "pve", "10.0.2.5").await;
    let vm = create_guest(&storage, &host, 120, GuestType::Vm, true).await;
    storage
        .replace_guests(host.id, vec![guest(120, "no-agent", GuestStatus::Running, GuestType::Vm)])
        .await
        .unwrap();
    executor.on("---CHILD:", Reply::Output(segment(vm.id, CHILD_ERROR)));

    for round in 1..=2 {
        let report = poll_children(&ctx, host.id).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(!storage.get_node(vm.id).await.unwrap().unwrap().online);

        // offline guests are left out until discovery sees them running
        let report = poll_children(&ctx, host.id).await.unwrap();
        assert_eq!(report.polled, 0);
        assert_eq!(ctx.breaker.failures(vm.id), round);

        sync.sync_host(host.id).await.unwrap();
        assert!(storage.get_node(vm.id).await.unwrap().unwrap().online);
    }
}
