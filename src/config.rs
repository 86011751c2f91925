use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tracing::trace;

use crate::circuit_breaker::BreakerSettings;
use crate::commands::Tier;
use crate::node::{Capabilities, NewNode};

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none", alias = "memory")]
    Memory,

    /// SQLite database (default for most deployments)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        /// Stats history older than this is deleted by the maintenance job
        #[serde(default = "default_retention_hours")]
        retention_hours: u64,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
            retention_hours: default_retention_hours(),
        }
    }
}

impl StorageConfig {
    pub fn retention(&self) -> Duration {
        let hours = match self {
            StorageConfig::Memory => default_retention_hours(),
            StorageConfig::Sqlite {
                retention_hours, ..
            } => *retention_hours,
        };
        Duration::from_secs(hours * 3600)
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./homelab.db")
}

fn default_retention_hours() -> u64 {
    168
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    /// Nodes to register on startup
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    /// Storage configuration (optional - defaults to SQLite)
    pub storage: Option<StorageConfig>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub ssh: SshConfig,
}

/// A node seeded from the config file
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    pub identity_file: Option<PathBuf>,
    /// Seconds between global collection passes
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Create child nodes for this host's VMs and containers
    #[serde(default)]
    pub auto_discovery: bool,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl NodeConfig {
    pub fn to_new_node(&self) -> NewNode {
        NewNode {
            name: self.name.clone(),
            host: self.host.clone(),
            ssh_port: self.port,
            ssh_user: self.user.clone(),
            identity_file: self.identity_file.clone(),
            monitoring_enabled: self.enabled,
            monitoring_interval: self.interval,
            auto_discovery: self.auto_discovery,
            parent_id: None,
            guest_vmid: None,
            guest_type: None,
            capabilities: self.capabilities.clone(),
        }
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Interval and deadline of one collection tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub struct TierConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl TierConfig {
    fn defaults(tier: Tier) -> Self {
        Self {
            interval_secs: tier.default_interval().as_secs(),
            timeout_secs: tier.default_timeout().as_secs(),
        }
    }
}

fn default_tier1() -> TierConfig {
    TierConfig::defaults(Tier::Live)
}

fn default_tier2() -> TierConfig {
    TierConfig::defaults(Tier::Status)
}

fn default_tier3() -> TierConfig {
    TierConfig::defaults(Tier::Hardware)
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SchedulerConfig {
    /// How often the global tick looks for due nodes
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Lower bound on any node's collection interval
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,

    /// Host collections running at the same time during a tick
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_host_timeout_secs")]
    pub host_timeout_secs: u64,

    /// Append a history row on every global collection
    #[serde(default = "default_true")]
    pub record_history: bool,

    #[serde(default = "default_tier1")]
    pub tier1: TierConfig,
    #[serde(default = "default_tier2")]
    pub tier2: TierConfig,
    #[serde(default = "default_tier3")]
    pub tier3: TierConfig,

    #[serde(default = "default_child_interval_secs")]
    pub child_poll_interval_secs: u64,
    #[serde(default = "default_child_timeout_secs")]
    pub child_timeout_secs: u64,
    #[serde(default = "default_child_batch_timeout_secs")]
    pub child_batch_timeout_secs: u64,
    #[serde(default = "default_child_first_poll_ms")]
    pub child_first_poll_ms: u64,

    /// Startup delays, counted from `start_all`
    #[serde(default = "default_discovery_delay_secs")]
    pub discovery_delay_secs: u64,
    #[serde(default = "default_child_poller_delay_secs")]
    pub child_poller_delay_secs: u64,
    #[serde(default = "default_ip_sweep_delay_secs")]
    pub ip_sweep_delay_secs: u64,

    #[serde(default = "default_maintenance_secs")]
    pub maintenance_interval_secs: u64,

    #[serde(default = "default_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_open_timeout_secs")]
    pub breaker_open_timeout_secs: u64,
    #[serde(default = "default_stale_breaker_secs")]
    pub breaker_stale_after_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            min_interval_secs: default_min_interval_secs(),
            chunk_size: default_chunk_size(),
            host_timeout_secs: default_host_timeout_secs(),
            record_history: true,
            tier1: default_tier1(),
            tier2: default_tier2(),
            tier3: default_tier3(),
            child_poll_interval_secs: default_child_interval_secs(),
            child_timeout_secs: default_child_timeout_secs(),
            child_batch_timeout_secs: default_child_batch_timeout_secs(),
            child_first_poll_ms: default_child_first_poll_ms(),
            discovery_delay_secs: default_discovery_delay_secs(),
            child_poller_delay_secs: default_child_poller_delay_secs(),
            ip_sweep_delay_secs: default_ip_sweep_delay_secs(),
            maintenance_interval_secs: default_maintenance_secs(),
            breaker_failure_threshold: default_failure_threshold(),
            breaker_open_timeout_secs: default_open_timeout_secs(),
            breaker_stale_after_secs: default_stale_breaker_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn tier(&self, tier: Tier) -> TierConfig {
        match tier {
            Tier::Live => self.tier1,
            Tier::Status => self.tier2,
            Tier::Hardware => self.tier3,
        }
    }

    pub fn tier_interval(&self, tier: Tier) -> Duration {
        Duration::from_secs(self.tier(tier).interval_secs.max(1))
    }

    pub fn tier_timeout(&self, tier: Tier) -> Duration {
        Duration::from_secs(self.tier(tier).timeout_secs.max(1))
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.breaker_failure_threshold.max(1),
            open_timeout: Duration::from_secs(self.breaker_open_timeout_secs),
            ..BreakerSettings::default()
        }
    }
}

fn default_tick_ms() -> u64 {
    5_000
}

fn default_min_interval_secs() -> u64 {
    10
}

fn default_chunk_size() -> usize {
    5
}

fn default_host_timeout_secs() -> u64 {
    15
}

fn default_child_interval_secs() -> u64 {
    60
}

fn default_child_timeout_secs() -> u64 {
    5
}

fn default_child_batch_timeout_secs() -> u64 {
    30
}

fn default_child_first_poll_ms() -> u64 {
    2_000
}

fn default_discovery_delay_secs() -> u64 {
    10
}

fn default_child_poller_delay_secs() -> u64 {
    30
}

fn default_ip_sweep_delay_secs() -> u64 {
    60
}

fn default_maintenance_secs() -> u64 {
    3_600
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_open_timeout_secs() -> u64 {
    60
}

fn default_stale_breaker_secs() -> u64 {
    600
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct DiscoveryConfig {
    /// Global switch; hosts must also opt in with `auto_discovery`
    #[serde(default = "default_true")]
    pub auto_create_child_nodes: bool,

    #[serde(default = "default_discovery_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_ip_sweep_interval_secs")]
    pub ip_sweep_interval_secs: u64,

    /// Deadline for resolving one guest's address
    #[serde(default = "default_ip_timeout_secs")]
    pub ip_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            auto_create_child_nodes: true,
            interval_secs: default_discovery_interval_secs(),
            ip_sweep_interval_secs: default_ip_sweep_interval_secs(),
            ip_timeout_secs: default_ip_timeout_secs(),
        }
    }
}

fn default_discovery_interval_secs() -> u64 {
    60
}

fn default_ip_sweep_interval_secs() -> u64 {
    300
}

fn default_ip_timeout_secs() -> u64 {
    5
}

/// Options for the system ssh client
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_binary")]
    pub binary: PathBuf,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Enables connection multiplexing, e.g. `/tmp/homelab-%r@%h:%p`
    pub control_path: Option<PathBuf>,

    #[serde(default = "default_control_persist_secs")]
    pub control_persist_secs: u64,

    #[serde(default)]
    pub strict_host_key_checking: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: default_ssh_binary(),
            connect_timeout_secs: default_connect_timeout_secs(),
            control_path: None,
            control_persist_secs: default_control_persist_secs(),
            strict_host_key_checking: false,
        }
    }
}

fn default_ssh_binary() -> PathBuf {
    PathBuf::from("ssh")
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_control_persist_secs() -> u64 {
    60
}

pub fn read_config_file(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&file_content)
        .context("invalid configuration file")
        .inspect(|config| trace!("loaded config: {config:?}"))
}
