//! Monitored node model
//!
//! A [`Node`] is anything the hub talks to over SSH: a bare-metal box, a
//! Proxmox host, or a guest (VM/LXC) reached through its parent host.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::executor::SshTarget;

/// Node identifier as stored by the persistence layer
pub type NodeId = i64;

/// Kind of guest a child node represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestType {
    /// QEMU virtual machine, reached via `qm guest exec`
    Vm,
    /// LXC container, reached via `pct exec`
    Lxc,
}

impl GuestType {
    pub const ALL: [GuestType; 2] = [GuestType::Vm, GuestType::Lxc];

    pub fn as_str(&self) -> &'static str {
        match self {
            GuestType::Vm => "vm",
            GuestType::Lxc => "lxc",
        }
    }

    /// Command prefix that runs a command inside the guest from the host
    pub fn exec_prefix(&self, vmid: u32) -> String {
        match self {
            GuestType::Vm => format!("qm guest exec {vmid} --"),
            GuestType::Lxc => format!("pct exec {vmid} --"),
        }
    }
}

impl fmt::Display for GuestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GuestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vm" | "qemu" => Ok(GuestType::Vm),
            "lxc" | "ct" => Ok(GuestType::Lxc),
            other => Err(format!("unknown guest type: {other}")),
        }
    }
}

/// Capability set detected on a node (docker, proxmox, sensors, ...)
///
/// Values are kept as raw JSON because detection reports a mix of flags
/// (`"docker": true`) and modes (`"sensors": "limited"`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(HashMap<String, serde_json::Value>);

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<serde_json::Value>) {
        self.0.insert(name.to_string(), value.into());
    }

    /// Whether the capability is present with a truthy value
    pub fn has(&self, name: &str) -> bool {
        match self.0.get(name) {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
            Some(serde_json::Value::String(s)) => {
                !matches!(s.trim(), "" | "0" | "false" | "none" | "no")
            }
            Some(serde_json::Value::Array(a)) => !a.is_empty(),
            Some(serde_json::Value::Object(o)) => !o.is_empty(),
        }
    }

    /// Capability value as a string mode, e.g. `sensors = "full"`
    pub fn mode(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| v.as_str())
    }

    /// Explicitly recorded as unavailable (as opposed to simply unknown)
    pub fn is_explicitly_absent(&self, name: &str) -> bool {
        self.0.contains_key(name) && !self.has(name)
    }

    /// Whether commands can be run inside a guest of the given type
    ///
    /// LXC guests are always reachable through `pct exec`. VMs need the
    /// QEMU guest agent; unless detection said it is missing we try.
    pub fn allows_guest_exec(&self, guest_type: GuestType) -> bool {
        match guest_type {
            GuestType::Lxc => true,
            GuestType::Vm => !self.is_explicitly_absent("guest_agent"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A monitored node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub identity_file: Option<PathBuf>,

    pub monitoring_enabled: bool,

    /// Seconds between global collection passes for this node
    pub monitoring_interval: u64,

    /// Per-host opt-in for automatic child node creation
    pub auto_discovery: bool,

    pub parent_id: Option<NodeId>,
    pub guest_vmid: Option<u32>,
    pub guest_type: Option<GuestType>,
    pub guest_ip: Option<String>,

    pub online: bool,
    pub last_error: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,

    #[serde(default)]
    pub capabilities: Capabilities,
}

impl Node {
    /// Whether this node is a VM/LXC polled through its parent
    pub fn is_guest(&self) -> bool {
        self.guest_type.is_some()
    }

    /// Guest coordinates, when both halves are known
    pub fn guest(&self) -> Option<(GuestType, u32)> {
        match (self.guest_type, self.guest_vmid) {
            (Some(t), Some(vmid)) => Some((t, vmid)),
            _ => None,
        }
    }

    /// SSH target for direct execution on this node
    pub fn target(&self) -> SshTarget {
        SshTarget {
            host: self.host.clone(),
            port: self.ssh_port,
            user: self.ssh_user.clone(),
            identity_file: self.identity_file.clone(),
        }
    }

    /// Name used for logs
    pub fn display_name(&self) -> String {
        format!("{} ({})", self.name, self.id)
    }
}

/// Data needed to create a node record; the backend assigns the id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNode {
    pub name: String,
    pub host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub identity_file: Option<PathBuf>,
    pub monitoring_enabled: bool,
    pub monitoring_interval: u64,
    pub auto_discovery: bool,
    pub parent_id: Option<NodeId>,
    pub guest_vmid: Option<u32>,
    pub guest_type: Option<GuestType>,
    pub capabilities: Capabilities,
}

impl NewNode {
    /// Standalone node with default connection settings
    pub fn standalone(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            ssh_port: 22,
            ssh_user: "root".to_string(),
            identity_file: None,
            monitoring_enabled: true,
            monitoring_interval: 30,
            auto_discovery: false,
            parent_id: None,
            guest_vmid: None,
            guest_type: None,
            capabilities: Capabilities::default(),
        }
    }

    /// Child record for a guest discovered on `parent`
    ///
    /// Guests inherit the parent's connection parameters because every
    /// command reaches them through the parent host.
    pub fn child_of(parent: &Node, name: String, vmid: u32, guest_type: GuestType) -> Self {
        Self {
            name,
            host: parent.host.clone(),
            ssh_port: parent.ssh_port,
            ssh_user: parent.ssh_user.clone(),
            identity_file: parent.identity_file.clone(),
            monitoring_enabled: true,
            monitoring_interval: parent.monitoring_interval,
            auto_discovery: false,
            parent_id: Some(parent.id),
            guest_vmid: Some(vmid),
            guest_type: Some(guest_type),
            capabilities: Capabilities::default(),
        }
    }

    pub fn into_node(self, id: NodeId) -> Node {
        Node {
            id,
            name: self.name,
            host: self.host,
            ssh_port: self.ssh_port,
            ssh_user: self.ssh_user,
            identity_file: self.identity_file,
            monitoring_enabled: self.monitoring_enabled,
            monitoring_interval: self.monitoring_interval,
            auto_discovery: self.auto_discovery,
            parent_id: self.parent_id,
            guest_vmid: self.guest_vmid,
            guest_type: self.guest_type,
            guest_ip: None,
            online: false,
            last_error: None,
            last_seen: None,
            capabilities: self.capabilities,
        }
    }
}

/// Run state of a guest as reported by the hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestStatus {
    Running,
    Stopped,
    Paused,
    Unknown,
}

impl GuestStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, GuestStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GuestStatus::Running => "running",
            GuestStatus::Stopped => "stopped",
            GuestStatus::Paused => "paused",
            GuestStatus::Unknown => "unknown",
        }
    }
}

impl From<&str> for GuestStatus {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => GuestStatus::Running,
            "stopped" => GuestStatus::Stopped,
            "paused" | "suspended" => GuestStatus::Paused,
            _ => GuestStatus::Unknown,
        }
    }
}

/// A VM or container as listed by the parent host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestRecord {
    pub vmid: u32,
    pub name: Option<String>,
    pub status: GuestStatus,
    pub guest_type: GuestType,
}

impl GuestRecord {
    /// Name for a child created from this guest
    pub fn child_name(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => format!("{}-{}", self.guest_type, self.vmid),
        }
    }
}

/// A Docker container found on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub container_id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub state: String,
}
