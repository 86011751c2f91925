//! In-memory storage backend (no persistence)
//!
//! Used when no database is configured and throughout the tests. All state
//! sits behind one `RwLock`, which also makes the stats merge atomic.
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Bounded history**: only the newest samples per node are kept

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{HardwareSnapshot, StatsHistoryRow, StatsPatch, StatsSnapshot};
use crate::node::{ContainerRecord, GuestRecord, GuestType, NewNode, Node, NodeId};

/// Maximum history rows to keep in memory per node
const MAX_HISTORY_PER_NODE: usize = 10_000;

#[derive(Default)]
struct Inner {
    next_id: NodeId,
    nodes: BTreeMap<NodeId, Node>,
    hypervisors: HashSet<NodeId>,
    stats: HashMap<NodeId, StatsSnapshot>,
    history: HashMap<NodeId, VecDeque<StatsHistoryRow>>,
    hardware: HashMap<NodeId, HardwareSnapshot>,
    guests: HashMap<NodeId, Vec<GuestRecord>>,
    containers: HashMap<NodeId, Vec<ContainerRecord>>,
}

impl Inner {
    fn insert(&mut self, node: NewNode) -> Node {
        self.next_id += 1;
        let node = node.into_node(self.next_id);
        self.nodes.insert(node.id, node.clone());
        node
    }

    fn node_mut(&mut self, id: NodeId) -> StorageResult<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| StorageError::NodeNotFound(id))
    }
}

/// In-memory storage backend
#[derive(Default)]
pub struct MemoryBackend {
    inner: RwLock<Inner>,
}

impl MemoryBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn list_nodes(&self) -> StorageResult<Vec<Node>> {
        Ok(self.inner.read().await.nodes.values().cloned().collect())
    }

    async fn get_node(&self, id: NodeId) -> StorageResult<Option<Node>> {
        Ok(self.inner.read().await.nodes.get(&id).cloned())
    }

    async fn upsert_node(&self, new: NewNode) -> StorageResult<Node> {
        let mut inner = self.inner.write().await;

        let existing = inner
            .nodes
            .values()
            .find(|n| n.name == new.name)
            .map(|n| n.id);

        match existing {
            Some(id) => {
                let node = inner.node_mut(id)?;
                let mut updated = new.into_node(id);
                updated.online = node.online;
                updated.last_error = node.last_error.take();
                updated.last_seen = node.last_seen;
                updated.guest_ip = node.guest_ip.take();
                *node = updated.clone();
                Ok(updated)
            }
            None => Ok(inner.insert(new)),
        }
    }

    async fn create_child_node(&self, node: NewNode) -> StorageResult<Node> {
        let mut inner = self.inner.write().await;

        if let Some(parent) = node.parent_id {
            if !inner.nodes.contains_key(&parent) {
                return Err(StorageError::NodeNotFound(parent));
            }
            if let (Some(guest_type), Some(vmid)) = (node.guest_type, node.guest_vmid) {
                let taken = inner.nodes.values().any(|n| {
                    n.parent_id == Some(parent)
                        && n.guest_type == Some(guest_type)
                        && n.guest_vmid == Some(vmid)
                });
                if taken {
                    return Err(StorageError::DuplicateGuest {
                        parent_id: parent,
                        guest_type,
                        vmid,
                    });
                }
            }
        }

        let created = inner.insert(node);
        debug!(node_id = created.id, name = %created.name, "created child node");
        Ok(created)
    }

    async fn rename_node(&self, id: NodeId, name: &str) -> StorageResult<()> {
        self.inner.write().await.node_mut(id)?.name = name.to_string();
        Ok(())
    }

    async fn set_online(&self, id: NodeId, online: bool, error: Option<&str>) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let node = inner.node_mut(id)?;

        node.online = online;
        if online {
            node.last_error = None;
            node.last_seen = Some(Utc::now());
        } else if let Some(error) = error {
            node.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn set_guest_ip(&self, id: NodeId, ip: &str) -> StorageResult<()> {
        self.inner.write().await.node_mut(id)?.guest_ip = Some(ip.to_string());
        Ok(())
    }

    async fn list_children(&self, parent_id: NodeId) -> StorageResult<Vec<Node>> {
        Ok(self
            .inner
            .read()
            .await
            .nodes
            .values()
            .filter(|n| n.parent_id == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn find_child_by_guest(
        &self,
        parent_id: NodeId,
        vmid: u32,
        guest_type: GuestType,
    ) -> StorageResult<Option<Node>> {
        Ok(self
            .inner
            .read()
            .await
            .nodes
            .values()
            .find(|n| {
                n.parent_id == Some(parent_id)
                    && n.guest_vmid == Some(vmid)
                    && n.guest_type == Some(guest_type)
            })
            .cloned())
    }

    async fn children_missing_ip(&self) -> StorageResult<Vec<Node>> {
        Ok(self
            .inner
            .read()
            .await
            .nodes
            .values()
            .filter(|n| n.is_guest() && n.online && n.guest_ip.is_none())
            .cloned()
            .collect())
    }

    async fn set_hypervisor(&self, id: NodeId, is_hypervisor: bool) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        if is_hypervisor {
            inner.hypervisors.insert(id);
        } else {
            inner.hypervisors.remove(&id);
        }
        Ok(())
    }

    async fn is_hypervisor(&self, id: NodeId) -> StorageResult<bool> {
        Ok(self.inner.read().await.hypervisors.contains(&id))
    }

    async fn current_stats(&self, id: NodeId) -> StorageResult<Option<StatsSnapshot>> {
        Ok(self.inner.read().await.stats.get(&id).cloned())
    }

    async fn merge_current_stats(
        &self,
        id: NodeId,
        patch: &StatsPatch,
    ) -> StorageResult<StatsSnapshot> {
        let mut inner = self.inner.write().await;
        let stats = inner
            .stats
            .entry(id)
            .or_insert_with(|| StatsSnapshot::empty(id));
        stats.apply(patch, Utc::now());
        Ok(stats.clone())
    }

    async fn append_stats_history(&self, row: StatsHistoryRow) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let history = inner.history.entry(row.node_id).or_default();
        if history.len() >= MAX_HISTORY_PER_NODE {
            history.pop_front();
        }
        history.push_back(row);
        Ok(())
    }

    async fn stats_history(&self, id: NodeId, limit: usize) -> StorageResult<Vec<StatsHistoryRow>> {
        Ok(self
            .inner
            .read()
            .await
            .history
            .get(&id)
            .map(|h| h.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn cleanup_history(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let mut inner = self.inner.write().await;
        let mut removed = 0;
        for rows in inner.history.values_mut() {
            let len = rows.len();
            rows.retain(|r| r.timestamp >= before);
            removed += len - rows.len();
        }
        debug!("removed {removed} history rows before {before}");
        Ok(removed)
    }

    async fn save_hardware(&self, hardware: HardwareSnapshot) -> StorageResult<()> {
        self.inner
            .write()
            .await
            .hardware
            .insert(hardware.node_id, hardware);
        Ok(())
    }

    async fn hardware(&self, id: NodeId) -> StorageResult<Option<HardwareSnapshot>> {
        Ok(self.inner.read().await.hardware.get(&id).cloned())
    }

    async fn replace_guests(&self, host_id: NodeId, guests: Vec<GuestRecord>) -> StorageResult<()> {
        self.inner.write().await.guests.insert(host_id, guests);
        Ok(())
    }

    async fn list_guests(&self, host_id: NodeId) -> StorageResult<Vec<GuestRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .guests
            .get(&host_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_containers(
        &self,
        node_id: NodeId,
        containers: Vec<ContainerRecord>,
    ) -> StorageResult<()> {
        self.inner
            .write()
            .await
            .containers
            .insert(node_id, containers);
        Ok(())
    }

    async fn list_containers(&self, node_id: NodeId) -> StorageResult<Vec<ContainerRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .containers
            .get(&node_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let inner = self.inner.read().await;
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("nodes".to_string(), inner.nodes.len().to_string()),
            ]),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}
