//! Catalog of remote probes
//!
//! Each probe is tagged with the tier that runs it, the capability a node
//! must report for it to make sense, and the shape of its output. The
//! catalog is static; nodes only differ in which entries they select.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::node::Capabilities;

/// Polling cadence class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Live metrics: load, memory, containers
    Live,
    /// Health: disks, sensors, network
    Status,
    /// Identity: hardware inventory
    Hardware,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Live, Tier::Status, Tier::Hardware];

    pub fn number(&self) -> u8 {
        match self {
            Tier::Live => 1,
            Tier::Status => 2,
            Tier::Hardware => 3,
        }
    }

    pub fn from_number(n: u8) -> Option<Tier> {
        match n {
            1 => Some(Tier::Live),
            2 => Some(Tier::Status),
            3 => Some(Tier::Hardware),
            _ => None,
        }
    }

    /// Default interval between runs
    pub fn default_interval(&self) -> Duration {
        match self {
            Tier::Live => Duration::from_secs(5),
            Tier::Status => Duration::from_secs(30),
            Tier::Hardware => Duration::from_secs(300),
        }
    }

    /// Default deadline for one run's remote call
    pub fn default_timeout(&self) -> Duration {
        match self {
            Tier::Live => Duration::from_secs(5),
            Tier::Status => Duration::from_secs(10),
            Tier::Hardware => Duration::from_secs(30),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier{}", self.number())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseFormat {
    Text,
    Columns,
    Json,
    Csv,
    Custom,
}

/// One remote probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandDescriptor {
    pub key: &'static str,
    pub command: &'static str,
    pub tier: Tier,
    pub requires: Option<&'static str>,
    pub parse_format: ParseFormat,
    pub fallback: Option<&'static str>,
    pub description: &'static str,
}

impl CommandDescriptor {
    /// Shell line that runs the probe, falling back when it fails
    pub fn command_line(&self) -> String {
        match self.fallback {
            Some(fallback) => format!("{{ {}; }} || {{ {}; }}", self.command, fallback),
            None => self.command.to_string(),
        }
    }

    /// Whether a node with `capabilities` can run this probe
    pub fn is_supported(&self, capabilities: &Capabilities) -> bool {
        self.requires.is_none_or(|cap| capabilities.has(cap))
    }
}

macro_rules! probe {
    ($key:literal, $tier:ident, $requires:expr, $format:ident, $command:literal, $fallback:expr, $desc:literal) => {
        CommandDescriptor {
            key: $key,
            command: $command,
            tier: Tier::$tier,
            requires: $requires,
            parse_format: ParseFormat::$format,
            fallback: $fallback,
            description: $desc,
        }
    };
}

static COMMANDS: &[CommandDescriptor] = &[
    // tier 1
    probe!(
        "system.uptime",
        Live,
        None,
        Text,
        "uptime",
        None,
        "System load average and uptime"
    ),
    probe!(
        "system.memory",
        Live,
        None,
        Columns,
        "free -b",
        None,
        "Memory and swap usage"
    ),
    probe!(
        "system.nproc",
        Live,
        None,
        Text,
        "nproc 2>/dev/null || grep -c ^processor /proc/cpuinfo",
        None,
        "Online CPU count, used to scale load into a CPU estimate"
    ),
    probe!(
        "docker.stats",
        Live,
        Some("docker"),
        Json,
        "docker stats --no-stream --format '{{json .}}' 2>/dev/null",
        None,
        "Docker container resource usage"
    ),
    probe!(
        "proxmox.vms",
        Live,
        Some("proxmox"),
        Json,
        "pvesh get /nodes/$(hostname)/qemu --output-format json 2>/dev/null || echo '[]'",
        None,
        "Proxmox VM status"
    ),
    probe!(
        "proxmox.cts",
        Live,
        Some("proxmox"),
        Json,
        "pvesh get /nodes/$(hostname)/lxc --output-format json 2>/dev/null || echo '[]'",
        None,
        "Proxmox LXC container status"
    ),
    // tier 2
    probe!(
        "storage.df",
        Status,
        None,
        Columns,
        "df -B1 -P / 2>/dev/null | tail -n 1",
        None,
        "Root filesystem usage"
    ),
    probe!(
        "storage.lsblk",
        Status,
        None,
        Json,
        "lsblk -b -o NAME,SIZE,FSUSED,FSAVAIL,MOUNTPOINT --json 2>/dev/null || echo '{}'",
        None,
        "Block device information"
    ),
    probe!(
        "sensors.thermal",
        Status,
        Some("sensors"),
        Custom,
        "sensors -u 2>/dev/null | grep -q _input && sensors -u 2>/dev/null",
        Some("cat /sys/class/thermal/thermal_zone0/temp 2>/dev/null"),
        "Thermal sensor readings"
    ),
    probe!(
        "network.interfaces",
        Status,
        None,
        Custom,
        "cat /proc/net/dev 2>/dev/null",
        None,
        "Network interface byte counters"
    ),
    probe!(
        "gpu.nvidia",
        Status,
        Some("gpu"),
        Csv,
        "nvidia-smi --query-gpu=index,name,temperature.gpu,utilization.gpu,memory.used,memory.total --format=csv,noheader,nounits 2>/dev/null",
        None,
        "NVIDIA GPU metrics"
    ),
    probe!(
        "zfs.pools",
        Status,
        Some("zfs"),
        Columns,
        "zpool list -H -o name,size,alloc,free,health 2>/dev/null",
        None,
        "ZFS pool status"
    ),
    // tier 3
    probe!(
        "hardware.fastfetch",
        Hardware,
        None,
        Json,
        "fastfetch --format json 2>/dev/null | grep -q . && fastfetch --format json 2>/dev/null",
        Some("inxi -Fzxxx --output json --output-file print 2>/dev/null || echo '{}'"),
        "System identity (cpu model, cores, memory)"
    ),
    probe!(
        "hardware.lspci",
        Hardware,
        None,
        Custom,
        "lspci -mm 2>/dev/null",
        None,
        "PCI device listing"
    ),
    probe!(
        "hardware.lsusb",
        Hardware,
        None,
        Custom,
        "lsusb 2>/dev/null",
        None,
        "USB device listing"
    ),
    probe!(
        "storage.smart",
        Hardware,
        Some("smart"),
        Custom,
        "smartctl -H /dev/sda 2>/dev/null",
        None,
        "SMART disk health"
    ),
];

/// Read-only view over the probe catalog
#[derive(Debug, Clone, Copy)]
pub struct CommandRegistry {
    commands: &'static [CommandDescriptor],
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self { commands: COMMANDS }
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> &'static [CommandDescriptor] {
        self.commands
    }

    /// Probes of `tier` the node's capabilities allow
    pub fn commands_for_tier(
        &self,
        tier: Tier,
        capabilities: &Capabilities,
    ) -> Vec<&'static CommandDescriptor> {
        self.commands
            .iter()
            .filter(|c| c.tier == tier && c.is_supported(capabilities))
            .collect()
    }

    pub fn by_key(&self, key: &str) -> Option<&'static CommandDescriptor> {
        self.commands.iter().find(|c| c.key == key)
    }

    pub fn by_capability(&self, capability: &str) -> Vec<&'static CommandDescriptor> {
        self.commands
            .iter()
            .filter(|c| c.requires == Some(capability))
            .collect()
    }

    pub fn tier_interval(&self, tier: Tier) -> Duration {
        tier.default_interval()
    }
}
