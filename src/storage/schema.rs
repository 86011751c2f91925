//! Records persisted by the storage layer
//!
//! ## Current stats
//!
//! One [`StatsSnapshot`] row per node holds the latest value of every metric.
//! Different pollers own different columns: the live tier writes load,
//! memory and containers, the status tier writes disk, temperatures and
//! network counters. Writers never send a full row, they send a
//! [`StatsPatch`] and the backend merges it, so one tier can never clear
//! another tier's values.
//!
//! ## History
//!
//! [`StatsHistoryRow`] is an append-only sample of the headline numbers,
//! written by the global collection pass and trimmed by retention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::NodeId;

/// Latest known metrics of a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub node_id: NodeId,

    // === live tier ===
    pub cpu_percent: Option<f64>,
    pub load_1m: Option<f64>,
    pub load_5m: Option<f64>,
    pub load_15m: Option<f64>,
    pub ram_used_bytes: Option<u64>,
    pub ram_available_bytes: Option<u64>,
    pub ram_percent: Option<f64>,
    pub swap_used_bytes: Option<u64>,
    pub uptime_seconds: Option<u64>,
    pub users: Option<u32>,
    pub containers_running: Option<u32>,
    pub tier1_updated_at: Option<DateTime<Utc>>,

    // === status tier ===
    pub disk_used_bytes: Option<u64>,
    pub disk_available_bytes: Option<u64>,
    pub disk_percent: Option<f64>,
    pub temp_cpu: Option<f64>,
    pub temp_gpu: Option<f64>,
    pub zfs_unhealthy_pools: Option<u32>,
    pub net_rx_bytes: Option<u64>,
    pub net_tx_bytes: Option<u64>,
    pub tier2_updated_at: Option<DateTime<Utc>>,

    /// Last time any writer touched the row
    pub updated_at: Option<DateTime<Utc>>,
}

/// Partial update of [`StatsSnapshot`]; `None` leaves the stored value alone
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsPatch {
    pub cpu_percent: Option<f64>,
    pub load_1m: Option<f64>,
    pub load_5m: Option<f64>,
    pub load_15m: Option<f64>,
    pub ram_used_bytes: Option<u64>,
    pub ram_available_bytes: Option<u64>,
    pub ram_percent: Option<f64>,
    pub swap_used_bytes: Option<u64>,
    pub uptime_seconds: Option<u64>,
    pub users: Option<u32>,
    pub containers_running: Option<u32>,
    pub tier1_updated_at: Option<DateTime<Utc>>,

    pub disk_used_bytes: Option<u64>,
    pub disk_available_bytes: Option<u64>,
    pub disk_percent: Option<f64>,
    pub temp_cpu: Option<f64>,
    pub temp_gpu: Option<f64>,
    pub zfs_unhealthy_pools: Option<u32>,
    pub net_rx_bytes: Option<u64>,
    pub net_tx_bytes: Option<u64>,
    pub tier2_updated_at: Option<DateTime<Utc>>,
}

macro_rules! merge_fields {
    ($target:expr, $patch:expr, $($field:ident),+ $(,)?) => {
        $(
            if $patch.$field.is_some() {
                $target.$field = $patch.$field.clone();
            }
        )+
    };
}

impl StatsSnapshot {
    pub fn empty(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Overwrite the fields the patch sets
    pub fn apply(&mut self, patch: &StatsPatch, now: DateTime<Utc>) {
        merge_fields!(
            self,
            patch,
            cpu_percent,
            load_1m,
            load_5m,
            load_15m,
            ram_used_bytes,
            ram_available_bytes,
            ram_percent,
            swap_used_bytes,
            uptime_seconds,
            users,
            containers_running,
            tier1_updated_at,
            disk_used_bytes,
            disk_available_bytes,
            disk_percent,
            temp_cpu,
            temp_gpu,
            zfs_unhealthy_pools,
            net_rx_bytes,
            net_tx_bytes,
            tier2_updated_at,
        );
        self.updated_at = Some(now);
    }
}

impl StatsPatch {
    pub fn is_empty(&self) -> bool {
        *self == StatsPatch::default()
    }
}

/// Slow-changing hardware identity, refreshed by the hardware tier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    pub node_id: NodeId,
    pub cpu_model: Option<String>,
    pub cpu_cores: Option<u32>,
    pub ram_total_bytes: Option<u64>,
    pub pci_devices: Vec<String>,
    pub usb_devices: Vec<String>,
    pub smart_healthy: Option<bool>,
    pub updated_at: DateTime<Utc>,
}

/// One history sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsHistoryRow {
    pub node_id: NodeId,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: Option<f64>,
    pub load_1m: Option<f64>,
    pub ram_percent: Option<f64>,
    pub ram_used_bytes: Option<u64>,
    pub disk_percent: Option<f64>,
    pub temp_cpu: Option<f64>,
    pub net_rx_bytes: Option<u64>,
    pub net_tx_bytes: Option<u64>,
}

impl StatsHistoryRow {
    pub fn from_snapshot(stats: &StatsSnapshot, timestamp: DateTime<Utc>) -> Self {
        Self {
            node_id: stats.node_id,
            timestamp,
            cpu_percent: stats.cpu_percent,
            load_1m: stats.load_1m,
            ram_percent: stats.ram_percent,
            ram_used_bytes: stats.ram_used_bytes,
            disk_percent: stats.disk_percent,
            temp_cpu: stats.temp_cpu,
            net_rx_bytes: stats.net_rx_bytes,
            net_tx_bytes: stats.net_tx_bytes,
        }
    }
}
