//! Storage backend trait definition
//!
//! This module defines the `StorageBackend` trait that the pollers, the
//! discovery sync and the scheduler talk to. Nothing above this layer knows
//! whether records live in memory or in SQLite.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use super::schema::{HardwareSnapshot, StatsHistoryRow, StatsPatch, StatsSnapshot};
use crate::node::{ContainerRecord, GuestRecord, GuestType, NewNode, Node, NodeId};

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Trait for persistent storage backends
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync`; every poller holds an
/// `Arc<dyn StorageBackend>` and calls it from its own task.
///
/// ## Atomicity
///
/// [`merge_current_stats`](StorageBackend::merge_current_stats) must apply
/// the patch as one atomic read-modify-write. The live and status tiers of
/// the same node call it concurrently.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ========================================================================
    // Nodes
    // ========================================================================

    async fn list_nodes(&self) -> StorageResult<Vec<Node>>;

    async fn get_node(&self, id: NodeId) -> StorageResult<Option<Node>>;

    /// Insert a node, or update the one with the same name
    ///
    /// Connection settings, flags and capabilities are overwritten; status
    /// fields (online, last error, guest ip) are kept.
    async fn upsert_node(&self, node: NewNode) -> StorageResult<Node>;

    /// Insert a child record for a discovered guest
    async fn create_child_node(&self, node: NewNode) -> StorageResult<Node>;

    async fn rename_node(&self, id: NodeId, name: &str) -> StorageResult<()>;

    /// Record reachability
    ///
    /// Going online clears the last error and stamps `last_seen`.
    async fn set_online(&self, id: NodeId, online: bool, error: Option<&str>) -> StorageResult<()>;

    async fn set_guest_ip(&self, id: NodeId, ip: &str) -> StorageResult<()>;

    async fn list_children(&self, parent_id: NodeId) -> StorageResult<Vec<Node>>;

    async fn find_child_by_guest(
        &self,
        parent_id: NodeId,
        vmid: u32,
        guest_type: GuestType,
    ) -> StorageResult<Option<Node>>;

    /// Online guest nodes that have no address recorded yet
    async fn children_missing_ip(&self) -> StorageResult<Vec<Node>>;

    // ========================================================================
    // Hypervisor detection
    // ========================================================================

    async fn set_hypervisor(&self, id: NodeId, is_hypervisor: bool) -> StorageResult<()>;

    async fn is_hypervisor(&self, id: NodeId) -> StorageResult<bool>;

    // ========================================================================
    // Metrics
    // ========================================================================

    async fn current_stats(&self, id: NodeId) -> StorageResult<Option<StatsSnapshot>>;

    /// Atomically merge `patch` into the node's current stats and return the
    /// merged row
    async fn merge_current_stats(&self, id: NodeId, patch: &StatsPatch)
    -> StorageResult<StatsSnapshot>;

    async fn append_stats_history(&self, row: StatsHistoryRow) -> StorageResult<()>;

    /// Most recent history rows for a node, newest first
    async fn stats_history(&self, id: NodeId, limit: usize) -> StorageResult<Vec<StatsHistoryRow>>;

    /// Delete history older than `before`, returning the number of rows removed
    async fn cleanup_history(&self, before: DateTime<Utc>) -> StorageResult<usize>;

    async fn save_hardware(&self, hardware: HardwareSnapshot) -> StorageResult<()>;

    async fn hardware(&self, id: NodeId) -> StorageResult<Option<HardwareSnapshot>>;

    // ========================================================================
    // Inventory
    // ========================================================================

    /// Replace the guests reported by a hypervisor host
    async fn replace_guests(&self, host_id: NodeId, guests: Vec<GuestRecord>) -> StorageResult<()>;

    async fn list_guests(&self, host_id: NodeId) -> StorageResult<Vec<GuestRecord>>;

    /// Replace the Docker containers found on a node
    async fn replace_containers(
        &self,
        node_id: NodeId,
        containers: Vec<ContainerRecord>,
    ) -> StorageResult<()>;

    async fn list_containers(&self, node_id: NodeId) -> StorageResult<Vec<ContainerRecord>>;

    // ========================================================================
    // Maintenance
    // ========================================================================

    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Release connections; further calls may fail
    async fn close(&self) -> StorageResult<()>;
}
