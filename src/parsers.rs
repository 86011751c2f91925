//! Parsers for probe output
//!
//! Remote hosts run different distributions and tool versions, so every
//! parser here is lenient: anything it cannot read comes back as `None` (or
//! an empty list) and the caller decides on a default. None of them fail.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::node::{ContainerRecord, GuestRecord, GuestStatus, GuestType};

static UPTIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"up\s+(?:(\d+)\s+days?,?\s*)?(?:(\d+):(\d+)|(\d+)\s+min)?").unwrap()
});

static LOAD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"load averages?:\s*([\d.]+),?\s+([\d.]+),?\s+([\d.]+)").unwrap()
});

static USERS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+users?").unwrap());

static SENSORS_TEMP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"temp\d+_input:\s*([\d.]+)").unwrap());

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"===(\w+)===").unwrap());

static SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([\d.]+)\s*([KMGT])i?B").unwrap());

/// Lock states `pct list` can print between status and name
const PCT_LOCKS: [&str; 6] = ["backup", "create", "migrate", "rollback", "snapshot", "suspended"];

/// Proxmox only hands out vmids in this range
pub const VMID_RANGE: std::ops::RangeInclusive<u32> = 100..=999_999;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UptimeInfo {
    pub uptime_seconds: Option<u64>,
    pub load: Option<(f64, f64, f64)>,
    pub users: Option<u32>,
}

/// Parse `uptime` output
///
/// Handles `up 3 days, 4:05`, `up 4:05` and `up 12 min`.
pub fn parse_uptime(text: &str) -> UptimeInfo {
    let mut info = UptimeInfo::default();

    if let Some(caps) = UPTIME_RE.captures(text) {
        let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u64>().ok());
        let days = num(1);
        let hours = num(2);
        let mins = num(3).or(num(4));

        if days.is_some() || hours.is_some() || mins.is_some() {
            // saturating: the numbers come straight from remote output
            info.uptime_seconds = Some(
                days.unwrap_or(0)
                    .saturating_mul(86_400)
                    .saturating_add(hours.unwrap_or(0).saturating_mul(3_600))
                    .saturating_add(mins.unwrap_or(0).saturating_mul(60)),
            );
        }
    }

    if let Some(caps) = LOAD_RE.captures(text) {
        let load = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<f64>().ok());
        if let (Some(a), Some(b), Some(c)) = (load(1), load(2), load(3)) {
            info.load = Some((a, b, c));
        }
    }

    info.users = USERS_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());

    info
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total: u64,
    pub used: u64,
    /// `available` column when the kernel reports it, `free` otherwise
    pub available: u64,
    pub swap_used: Option<u64>,
}

impl MemoryInfo {
    pub fn used_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.used as f64 / self.total as f64 * 100.0).round()
    }
}

/// Parse `free -b`
pub fn parse_free(text: &str) -> Option<MemoryInfo> {
    let columns = |line: &str| -> Vec<u64> {
        line.split_whitespace()
            .skip(1)
            .map(|v| v.parse().unwrap_or(0))
            .collect()
    };

    let mem = text.lines().find(|l| l.trim_start().starts_with("Mem:"))?;
    let values = columns(mem.trim_start());
    if values.len() < 3 {
        return None;
    }

    let swap_used = text
        .lines()
        .find(|l| l.trim_start().starts_with("Swap:"))
        .and_then(|l| columns(l.trim_start()).get(1).copied());

    Some(MemoryInfo {
        total: values[0],
        used: values[1],
        available: values.get(5).copied().unwrap_or(values[2]),
        swap_used,
    })
}

pub fn parse_nproc(text: &str) -> Option<u32> {
    text.split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .filter(|n| *n > 0)
}

/// Rough CPU utilisation derived from the 1 minute load
///
/// Load counts runnable and uninterruptible tasks, not busy time, so this
/// overestimates on IO-bound hosts. Clamped to `[0, 100]`.
pub fn cpu_estimate(load_1m: f64, cores: u32) -> f64 {
    let cores = cores.max(1) as f64;
    (load_1m / cores * 100.0).round().clamp(0.0, 100.0)
}

/// Number of containers in `docker stats --format '{{json .}}'` output
///
/// Accepts one object per line as well as a single JSON array.
pub fn count_docker_stats(text: &str) -> u32 {
    let trimmed = text.trim();
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) {
        return items.len() as u32;
    }

    trimmed
        .lines()
        .filter(|l| matches!(serde_json::from_str::<Value>(l.trim()), Ok(Value::Object(_))))
        .count() as u32
}

/// Parse `pvesh get /nodes/<node>/{qemu,lxc}` JSON
pub fn parse_pvesh_guests(text: &str, guest_type: GuestType) -> Vec<GuestRecord> {
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text.trim()) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let vmid = match item.get("vmid")? {
                Value::Number(n) => n.as_u64()?,
                Value::String(s) => s.parse().ok()?,
                _ => return None,
            };
            Some(GuestRecord {
                vmid: u32::try_from(vmid).ok()?,
                name: item.get("name").and_then(|n| n.as_str()).map(str::to_string),
                status: item
                    .get("status")
                    .and_then(|s| s.as_str())
                    .map(GuestStatus::from)
                    .unwrap_or(GuestStatus::Unknown),
                guest_type,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiskUsage {
    pub used: u64,
    pub available: u64,
    pub percent: f64,
}

impl DiskUsage {
    fn new(total: u64, used: u64, available: u64) -> Self {
        let percent = if total > 0 {
            (used as f64 / total as f64 * 100.0).round()
        } else {
            0.0
        };
        Self {
            used,
            available,
            percent,
        }
    }
}

/// Parse a `df -B1 -P` data line: filesystem, size, used, avail, use%, mount
pub fn parse_df(text: &str) -> Option<DiskUsage> {
    text.lines().rev().find_map(|line| {
        let parts: Vec<_> = line.split_whitespace().collect();
        if parts.len() < 6 {
            return None;
        }
        let total = parts[1].parse().ok()?;
        let used = parts[2].parse().ok()?;
        let available = parts[3].parse().ok()?;
        Some(DiskUsage::new(total, used, available))
    })
}

/// Root filesystem usage from `lsblk --json`
pub fn parse_lsblk_root(text: &str) -> Option<DiskUsage> {
    fn as_u64(v: Option<&Value>) -> Option<u64> {
        match v? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn find_root(devices: &[Value]) -> Option<DiskUsage> {
        for dev in devices {
            if dev.get("mountpoint").and_then(|m| m.as_str()) == Some("/") {
                let used = as_u64(dev.get("fsused"))?;
                let available = as_u64(dev.get("fsavail"))?;
                return Some(DiskUsage::new(used.saturating_add(available), used, available));
            }
            if let Some(Value::Array(children)) = dev.get("children") {
                if let Some(found) = find_root(children) {
                    return Some(found);
                }
            }
        }
        None
    }

    let value: Value = serde_json::from_str(text.trim()).ok()?;
    match value.get("blockdevices")? {
        Value::Array(devices) => find_root(devices),
        _ => None,
    }
}

/// CPU temperature in °C from `sensors -u` or a sysfs thermal zone
///
/// sysfs reports millidegrees; anything above 200 is taken to be one.
pub fn parse_temperature(text: &str) -> Option<f64> {
    if let Some(caps) = SENSORS_TEMP_RE.captures(text) {
        return caps.get(1)?.as_str().parse().ok();
    }

    let raw: f64 = text.split_whitespace().next()?.parse().ok()?;
    if raw <= 0.0 {
        return None;
    }
    Some(if raw > 200.0 { raw / 1000.0 } else { raw })
}

/// Received and transmitted bytes over all non-loopback interfaces
pub fn parse_net_dev(text: &str) -> Option<(u64, u64)> {
    let mut totals: Option<(u64, u64)> = None;

    for line in text.lines() {
        let Some((iface, counters)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<u64> = counters
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        if fields.len() < 9 {
            continue;
        }
        let (rx, tx) = totals.get_or_insert((0, 0));
        *rx = rx.saturating_add(fields[0]);
        *tx = tx.saturating_add(fields[8]);
    }

    totals
}

/// Highest GPU temperature from `nvidia-smi --format=csv,noheader,nounits`
pub fn parse_nvidia_temp(text: &str) -> Option<f64> {
    text.lines()
        .filter_map(|line| line.split(',').nth(2)?.trim().parse::<f64>().ok())
        .reduce(f64::max)
}

/// Pools whose `zpool list -H` health column is not ONLINE
pub fn count_unhealthy_pools(text: &str) -> Option<u32> {
    let healths: Vec<_> = text
        .lines()
        .filter_map(|l| l.split_whitespace().nth(4))
        .collect();
    if healths.is_empty() {
        return None;
    }
    Some(healths.iter().filter(|h| !h.eq_ignore_ascii_case("ONLINE")).count() as u32)
}

/// `16 GiB`, `512 MB` etc. in bytes
pub fn parse_size(text: &str) -> Option<u64> {
    let caps = SIZE_RE.captures(text)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier: u64 = match caps.get(2)?.as_str().to_ascii_uppercase().as_str() {
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        _ => 1,
    };
    Some((value * multiplier as f64).round() as u64)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardwareIdentity {
    pub cpu_model: Option<String>,
    pub cpu_cores: Option<u32>,
    pub ram_total_bytes: Option<u64>,
}

/// Hardware identity from fastfetch or inxi JSON
///
/// fastfetch prints either `{"CPU": {...}, "Memory": {...}}` or a list of
/// `{"type": "CPU", "result": {...}}` modules depending on version; inxi
/// nests a list under `CPU`.
pub fn parse_hardware_json(text: &str) -> HardwareIdentity {
    let mut identity = HardwareIdentity::default();
    let Ok(value) = serde_json::from_str::<Value>(text.trim()) else {
        return identity;
    };

    let module = |name: &str| -> Option<Value> {
        match &value {
            Value::Object(map) => map.get(name).cloned(),
            Value::Array(items) => items
                .iter()
                .find(|m| m.get("type").and_then(|t| t.as_str()) == Some(name))
                .and_then(|m| m.get("result").cloned()),
            _ => None,
        }
    };

    if let Some(cpu) = module("CPU") {
        let cpu = match cpu {
            Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
            other => other,
        };

        identity.cpu_model = ["name", "model", "cpu"]
            .iter()
            .find_map(|k| cpu.get(*k).and_then(|v| v.as_str()))
            .map(|s| s.trim().to_string());

        identity.cpu_cores = match cpu.get("cores") {
            Some(Value::Number(n)) => n.as_u64().map(|n| n as u32),
            Some(Value::Object(cores)) => ["online", "logical", "physical"]
                .iter()
                .find_map(|k| cores.get(*k).and_then(|v| v.as_u64()))
                .map(|n| n as u32),
            _ => None,
        }
        .or_else(|| {
            cpu.get("core-count")
                .or_else(|| cpu.get("physicalCores"))
                .and_then(|v| v.as_u64())
                .map(|n| n as u32)
        });
    }

    if let Some(memory) = module("Memory") {
        identity.ram_total_bytes = match memory.get("total").or_else(|| memory.get("size")) {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => parse_size(s),
            _ => None,
        };
    }

    identity
}

/// Device lines from `lspci -mm`, e.g. `00:02.0 VGA compatible controller: Intel Corporation UHD 630`
pub fn parse_lspci(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let (slot, rest) = line.trim().split_once(' ')?;
            let fields: Vec<_> = rest
                .split('"')
                .map(str::trim)
                .filter(|f| !f.is_empty() && !f.starts_with('-'))
                .collect();
            match fields.as_slice() {
                [class, vendor, device, ..] => Some(format!("{slot} {class}: {vendor} {device}")),
                _ => None,
            }
        })
        .collect()
}

/// Device descriptions from `lsusb`
pub fn parse_lsusb(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let (_, after) = line.split_once(" ID ")?;
            let (id, desc) = after.split_once(' ').unwrap_or((after, ""));
            Some(format!("{} {}", id.trim(), desc.trim()).trim().to_string())
        })
        .collect()
}

/// Overall health from `smartctl -H`
pub fn parse_smart_health(text: &str) -> Option<bool> {
    let line = text
        .lines()
        .find(|l| l.contains("overall-health") || l.contains("SMART Health Status"))?;
    let verdict = line.rsplit(':').next()?.trim();
    Some(verdict.eq_ignore_ascii_case("PASSED") || verdict.eq_ignore_ascii_case("OK"))
}

/// Containers from `docker ps -a --format "{{.ID}}|{{.Names}}|{{.Image}}|{{.Status}}|{{.State}}"`
pub fn parse_docker_ps(text: &str) -> Vec<ContainerRecord> {
    text.lines()
        .filter_map(|line| {
            let parts: Vec<_> = line.trim().split('|').collect();
            if parts.len() < 5 || parts[0].is_empty() {
                return None;
            }
            Some(ContainerRecord {
                container_id: parts[0].to_string(),
                name: parts[1].to_string(),
                image: parts[2].to_string(),
                status: parts[3].to_string(),
                state: parts[4].to_string(),
            })
        })
        .collect()
}

/// Split `===NAME===` sections
pub fn split_sections(raw: &str) -> HashMap<String, String> {
    let markers: Vec<_> = SECTION_RE.captures_iter(raw).collect();
    let mut sections = HashMap::new();

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|n| n.get(0))
            .map(|m| m.start())
            .unwrap_or(raw.len());
        sections.insert(name.as_str().to_string(), raw[whole.end()..end].trim().to_string());
    }

    sections
}

fn data_lines(text: &str) -> impl Iterator<Item = Vec<&str>> {
    text.lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>())
        .filter(|parts| parts.first().is_some_and(|p| p.parse::<u32>().is_ok()))
}

/// `qm list`: VMID NAME STATUS MEM(MB) BOOTDISK(GB) PID
pub fn parse_qm_list(text: &str) -> Vec<GuestRecord> {
    data_lines(text)
        .filter(|parts| parts.len() >= 3)
        .filter_map(|parts| {
            Some(GuestRecord {
                vmid: parts[0].parse().ok()?,
                name: Some(parts[1].to_string()),
                status: GuestStatus::from(parts[2]),
                guest_type: GuestType::Vm,
            })
        })
        .collect()
}

/// `pct list`: VMID Status [Lock] Name
pub fn parse_pct_list(text: &str) -> Vec<GuestRecord> {
    data_lines(text)
        .filter(|parts| parts.len() >= 2)
        .filter_map(|parts| {
            let name_start = match parts.get(2) {
                Some(p) if PCT_LOCKS.contains(&p.to_ascii_lowercase().as_str()) => 3,
                _ => 2,
            };
            let name = parts.get(name_start..).map(|n| n.join(" ")).filter(|n| !n.is_empty());

            Some(GuestRecord {
                vmid: parts[0].parse().ok()?,
                name,
                status: GuestStatus::from(parts[1]),
                guest_type: GuestType::Lxc,
            })
        })
        .collect()
}

/// First token of `hostname -I` style output, if it is an IP address
pub fn parse_ip(text: &str) -> Option<IpAddr> {
    text.split_whitespace().next()?.parse().ok()
}

pub fn is_valid_vmid(vmid: u32) -> bool {
    VMID_RANGE.contains(&vmid)
}
