//! Discovery of Proxmox guests as child nodes
//!
//! The host collection stores each hypervisor's guest inventory. Discovery
//! reconciles that inventory against the node table: new guests become
//! child nodes, known ones get their status (and generated name) refreshed,
//! and children whose guest disappeared are marked offline. Nothing is
//! ever deleted here; an operator decides when history can go.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::batch::unwrap_guest_exec;
use crate::config::DiscoveryConfig;
use crate::error::CoreError;
use crate::executor::RemoteExecutor;
use crate::node::{GuestRecord, GuestType, NewNode, Node, NodeId};
use crate::parsers;
use crate::storage::StorageBackend;

/// Error stored on children whose guest is gone
pub const ORPHAN_MESSAGE: &str = "VM/LXC no longer exists on Proxmox host";

/// Names discovery generated itself and may replace
static AUTO_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(vm|lxc)-\d+$").unwrap());

/// Result of syncing one host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub host_id: NodeId,
    pub skipped: bool,
    pub created: usize,
    pub updated: usize,
    pub orphaned: usize,
    pub errors: Vec<String>,
}

/// Totals over every host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub hosts: usize,
    pub created: usize,
    pub updated: usize,
    /// Orphans marked offline; records are kept
    pub deleted: usize,
    pub errors: Vec<String>,
}

impl SyncSummary {
    fn add(&mut self, report: SyncReport) {
        self.hosts += 1;
        self.created += report.created;
        self.updated += report.updated;
        self.deleted += report.orphaned;
        self.errors.extend(report.errors);
    }
}

/// What happened to a single guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "node_id", rename_all = "snake_case")]
pub enum SingleSyncOutcome {
    Created(NodeId),
    Updated(NodeId),
    /// The guest is gone and its child was marked offline
    Orphaned(NodeId),
    /// Neither a guest nor a child exists
    Absent,
}

/// Discovery view of one host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryStatus {
    pub host_id: NodeId,
    pub enabled: bool,
    pub is_hypervisor: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub guests: usize,
    pub children: usize,
    pub vms: usize,
    pub lxcs: usize,
    pub online: usize,
}

/// Children of one type whose vmid is not in `vmids`
pub fn find_orphans<'a>(children: &'a [Node], vmids: &[u32], guest_type: GuestType) -> Vec<&'a Node> {
    let current: HashSet<u32> = vmids.iter().copied().collect();
    children
        .iter()
        .filter(|c| c.guest_type == Some(guest_type))
        .filter(|c| c.guest_vmid.is_some_and(|vmid| !current.contains(&vmid)))
        .collect()
}

/// Keeps child nodes in line with hypervisor inventory
#[derive(Clone)]
pub struct DiscoverySync {
    storage: Arc<dyn StorageBackend>,
    executor: Arc<dyn RemoteExecutor>,
    config: DiscoveryConfig,
    last_sync: Arc<Mutex<HashMap<NodeId, DateTime<Utc>>>>,
}

impl DiscoverySync {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        executor: Arc<dyn RemoteExecutor>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            storage,
            executor,
            config,
            last_sync: Arc::default(),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Global switch and the host's own opt-in must both be on
    pub fn is_enabled(&self, host: &Node) -> bool {
        self.config.auto_create_child_nodes && host.auto_discovery && !host.is_guest()
    }

    async fn load_host(&self, host_id: NodeId) -> Result<Node> {
        self.storage
            .get_node(host_id)
            .await
            .context("failed to load host")?
            .ok_or_else(|| anyhow!("host {host_id} not found"))
    }

    /// Reconcile the children of one host
    #[instrument(skip(self), fields(host = host_id))]
    pub async fn sync_host(&self, host_id: NodeId) -> Result<SyncReport> {
        let host = self.load_host(host_id).await?;
        let mut report = SyncReport {
            host_id,
            ..Default::default()
        };

        if !self.is_enabled(&host) {
            debug!("auto-discovery disabled");
            report.skipped = true;
            return Ok(report);
        }

        // inventory is only trustworthy once the host has been seen as a hypervisor
        if !self.storage.is_hypervisor(host_id).await? {
            debug!("not a known hypervisor yet");
            report.skipped = true;
            return Ok(report);
        }

        let guests = self.storage.list_guests(host_id).await?;
        let children = self.storage.list_children(host_id).await?;

        for guest_type in GuestType::ALL {
            let reported: Vec<&GuestRecord> =
                guests.iter().filter(|g| g.guest_type == guest_type).collect();

            for guest in &reported {
                let existing = children
                    .iter()
                    .find(|c| c.guest() == Some((guest_type, guest.vmid)));

                match self.apply_guest(&host, existing, guest).await {
                    Ok(SingleSyncOutcome::Created(_)) => report.created += 1,
                    Ok(SingleSyncOutcome::Updated(_)) => report.updated += 1,
                    Ok(_) => {}
                    Err(e) => report
                        .errors
                        .push(format!("failed to sync {guest_type} {}: {e:#}", guest.vmid)),
                }
            }

            let vmids: Vec<u32> = reported.iter().map(|g| g.vmid).collect();
            for orphan in find_orphans(&children, &vmids, guest_type) {
                match self.mark_orphan(orphan).await {
                    Ok(()) => report.orphaned += 1,
                    Err(e) => report
                        .errors
                        .push(format!("failed to handle orphan {}: {e:#}", orphan.name)),
                }
            }
        }

        self.last_sync
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(host_id, Utc::now());

        if report.created > 0 || report.orphaned > 0 {
            info!(
                created = report.created,
                updated = report.updated,
                orphaned = report.orphaned,
                "discovery sync finished"
            );
        }

        Ok(report)
    }

    /// Sync one guest by vmid, e.g. after a manual refresh
    ///
    /// Creating a child still requires discovery to be enabled for the host.
    #[instrument(skip(self), fields(host = host_id))]
    pub async fn sync_single_guest(
        &self,
        host_id: NodeId,
        vmid: u32,
        guest_type: GuestType,
    ) -> Result<SingleSyncOutcome> {
        let host = self.load_host(host_id).await?;

        let guest = self
            .storage
            .list_guests(host_id)
            .await?
            .into_iter()
            .find(|g| g.vmid == vmid && g.guest_type == guest_type);
        let existing = self
            .storage
            .find_child_by_guest(host_id, vmid, guest_type)
            .await?;

        match (guest, existing) {
            (Some(guest), existing) => {
                if existing.is_none() && !self.is_enabled(&host) {
                    return Ok(SingleSyncOutcome::Absent);
                }
                self.apply_guest(&host, existing.as_ref(), &guest).await
            }
            (None, Some(child)) => {
                self.mark_orphan(&child).await?;
                Ok(SingleSyncOutcome::Orphaned(child.id))
            }
            (None, None) => Ok(SingleSyncOutcome::Absent),
        }
    }

    /// Tracked children of a host whose guest is not in `vmids`
    pub async fn orphaned_children(
        &self,
        host_id: NodeId,
        vmids: &[u32],
        guest_type: GuestType,
    ) -> Result<Vec<Node>> {
        let children = self.storage.list_children(host_id).await?;
        Ok(find_orphans(&children, vmids, guest_type)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Sync every host with discovery enabled
    #[instrument(skip(self))]
    pub async fn sync_all_hosts(&self) -> Result<SyncSummary> {
        let nodes = self.storage.list_nodes().await.context("failed to list nodes")?;
        let mut summary = SyncSummary::default();

        for host in nodes.iter().filter(|n| self.is_enabled(n)) {
            match self.sync_host(host.id).await {
                Ok(report) if report.skipped => {}
                Ok(report) => summary.add(report),
                Err(e) => summary.errors.push(format!("{}: {e:#}", host.name)),
            }
        }

        Ok(summary)
    }

    /// Resolve addresses for online children that have none yet
    ///
    /// Returns how many addresses were filled in. Failures are logged.
    #[instrument(skip(self))]
    pub async fn fill_missing_guest_ips(&self) -> Result<usize> {
        let children = self
            .storage
            .children_missing_ip()
            .await
            .context("failed to list children without address")?;

        let mut parents: HashMap<NodeId, Option<Node>> = HashMap::new();
        let mut filled = 0;

        for child in children {
            let (Some(parent_id), Some((guest_type, vmid))) = (child.parent_id, child.guest()) else {
                continue;
            };

            if !parents.contains_key(&parent_id) {
                let parent = self.storage.get_node(parent_id).await?;
                parents.insert(parent_id, parent);
            }
            let Some(Some(parent)) = parents.get(&parent_id) else {
                continue;
            };

            match self.resolve_guest_ip(parent, guest_type, vmid).await {
                Ok(ip) => {
                    self.storage.set_guest_ip(child.id, &ip.to_string()).await?;
                    debug!(child = child.id, %ip, "resolved guest address");
                    filled += 1;
                }
                Err(e) => debug!(child = child.id, "could not resolve guest address: {e:#}"),
            }
        }

        Ok(filled)
    }

    /// Discovery view of one host
    pub async fn status(&self, host_id: NodeId) -> Result<DiscoveryStatus> {
        let host = self.load_host(host_id).await?;
        let children = self.storage.list_children(host_id).await?;
        let count = |t: GuestType| children.iter().filter(|c| c.guest_type == Some(t)).count();

        Ok(DiscoveryStatus {
            host_id,
            enabled: self.is_enabled(&host),
            is_hypervisor: self.storage.is_hypervisor(host_id).await?,
            last_sync: self
                .last_sync
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .get(&host_id)
                .copied(),
            guests: self.storage.list_guests(host_id).await?.len(),
            children: children.len(),
            vms: count(GuestType::Vm),
            lxcs: count(GuestType::Lxc),
            online: children.iter().filter(|c| c.online).count(),
        })
    }

    /// Address of a guest as reported from inside it
    pub async fn resolve_guest_ip(
        &self,
        host: &Node,
        guest_type: GuestType,
        vmid: u32,
    ) -> Result<IpAddr> {
        if !parsers::is_valid_vmid(vmid) {
            bail!("vmid {vmid} outside the Proxmox range");
        }

        let command = format!("{} hostname -I 2>/dev/null", guest_type.exec_prefix(vmid));
        let timeout = Duration::from_secs(self.config.ip_timeout_secs);
        let output = self.executor.run(&host.target(), &command, timeout).await?;

        let text = unwrap_guest_exec(output.stdout.trim()).map_err(|e| anyhow!("{e}"))?;
        parsers::parse_ip(&text).ok_or_else(|| anyhow!("no address in {:?}", text.trim()))
    }

    async fn apply_guest(
        &self,
        host: &Node,
        existing: Option<&Node>,
        guest: &GuestRecord,
    ) -> Result<SingleSyncOutcome> {
        match existing {
            Some(child) => {
                self.refresh_child(child, guest).await?;
                Ok(SingleSyncOutcome::Updated(child.id))
            }
            None => self.create_child(host, guest).await.map(SingleSyncOutcome::Created),
        }
    }

    async fn refresh_child(&self, child: &Node, guest: &GuestRecord) -> Result<()> {
        let running = guest.status.is_running();
        let error = status_error(guest);
        // an orphan message stays put unless the status error replaces it
        if child.online != running || child.last_error != error {
            self.storage
                .set_online(child.id, running, error.as_deref())
                .await?;
        }

        if let Some(name) = guest.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            if name != child.name && AUTO_NAME.is_match(&child.name) {
                debug!(child = child.id, from = %child.name, to = name, "renaming child");
                self.storage.rename_node(child.id, name).await?;
            }
        }

        Ok(())
    }

    async fn create_child(&self, host: &Node, guest: &GuestRecord) -> Result<NodeId> {
        if !parsers::is_valid_vmid(guest.vmid) {
            bail!("vmid {} outside the Proxmox range", guest.vmid);
        }

        let name = guest.child_name();
        info!(host = host.id, %name, guest_type = %guest.guest_type, vmid = guest.vmid, "creating child node");

        let child = self
            .storage
            .create_child_node(NewNode::child_of(host, name, guest.vmid, guest.guest_type))
            .await?;
        if child.guest().is_none() {
            return Err(CoreError::IncompleteGuest { node_id: child.id }.into());
        }

        if guest.status.is_running() {
            match self.resolve_guest_ip(host, guest.guest_type, guest.vmid).await {
                Ok(ip) => self.storage.set_guest_ip(child.id, &ip.to_string()).await?,
                Err(e) => debug!(child = child.id, "guest address not resolved: {e:#}"),
            }
        }

        self.storage
            .set_online(child.id, guest.status.is_running(), status_error(guest).as_deref())
            .await?;

        Ok(child.id)
    }

    async fn mark_orphan(&self, child: &Node) -> Result<()> {
        if child.online || child.last_error.as_deref() != Some(ORPHAN_MESSAGE) {
            warn!(child = child.id, vmid = ?child.guest_vmid, "guest no longer exists, marking {} offline", child.name);
        }
        self.storage
            .set_online(child.id, false, Some(ORPHAN_MESSAGE))
            .await?;
        Ok(())
    }
}

fn status_error(guest: &GuestRecord) -> Option<String> {
    (!guest.status.is_running()).then(|| format!("guest is {}", guest.status.as_str()))
}
