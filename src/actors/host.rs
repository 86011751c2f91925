//! Lightweight collection run by the global tick
//!
//! One remote call per node gathers the basics plus whatever Proxmox
//! tooling is installed. The result feeds current stats and history, and
//! tells the coordinator whether the node hosts guests that discovery and
//! the child poller should care about.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::error::CoreError;
use crate::node::{GuestRecord, Node};
use crate::parsers;
use crate::storage::{StatsHistoryRow, StatsPatch, StatsSnapshot};

use super::CollectorContext;
use super::tiered::live_patch;

/// Sectioned script; the Proxmox sections stay empty on other hosts
pub const HOST_SCRIPT: &str = "echo '===STATS==='; uptime; \
echo '===MEM==='; free -b; \
echo '===NPROC==='; nproc; \
echo '===DISK==='; df -B1 -P / | tail -n 1; \
echo '===PVE==='; pveversion 2>/dev/null; \
echo '===QM==='; qm list 2>/dev/null; \
echo '===PCT==='; pct list 2>/dev/null";

/// What one host collection found
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostReading {
    pub patch: StatsPatch,
    pub is_hypervisor: bool,
    pub guests: Vec<GuestRecord>,
}

/// Turn the sectioned output into stats and inventory
pub fn parse_host_output(raw: &str) -> HostReading {
    let sections = parsers::split_sections(raw);
    let get = |name: &str| sections.get(name).map(String::as_str);

    let mut patch = live_patch(get("STATS"), get("MEM"), get("NPROC"), Utc::now());
    if let Some(disk) = get("DISK").and_then(parsers::parse_df) {
        patch.disk_used_bytes = Some(disk.used);
        patch.disk_available_bytes = Some(disk.available);
        patch.disk_percent = Some(disk.percent);
    }

    let mut guests = get("QM").map(parsers::parse_qm_list).unwrap_or_default();
    guests.extend(get("PCT").map(parsers::parse_pct_list).unwrap_or_default());

    let is_hypervisor = get("PVE").is_some_and(|v| !v.is_empty()) || !guests.is_empty();

    HostReading {
        patch,
        is_hypervisor,
        guests,
    }
}

fn has_sections(raw: &str) -> bool {
    let sections: HashMap<String, String> = parsers::split_sections(raw);
    sections.contains_key("STATS")
}

/// Collect one node and persist the result
///
/// Returns the merged current stats. Honors the breaker without driving it;
/// the live tier owns the breaker for standalone nodes.
#[instrument(skip_all, fields(node = node.id))]
pub async fn collect_host(ctx: &CollectorContext, node: &Node) -> Result<StatsSnapshot> {
    if node.is_guest() {
        return Err(CoreError::GuestInDirectPoller { node_id: node.id }.into());
    }

    if !ctx.breaker.is_closed(node.id) {
        debug!("circuit open, skipping collection");
        bail!("circuit breaker open for node {}", node.id);
    }

    let timeout = Duration::from_secs(ctx.settings.host_timeout_secs);
    let result = ctx.executor.run(&node.target(), HOST_SCRIPT, timeout).await;

    let output = match result {
        Ok(output) if output.is_usable() && has_sections(&output.stdout) => output,
        Ok(output) => {
            let msg = format!("collection returned no usable output (exit {:?})", output.exit_code);
            return mark_failed(ctx, node, msg).await;
        }
        Err(e) => return mark_failed(ctx, node, e.to_string()).await,
    };

    let reading = parse_host_output(&output.stdout);

    let stats = ctx
        .storage
        .merge_current_stats(node.id, &reading.patch)
        .await
        .context("failed to store stats")?;

    if ctx.settings.record_history {
        ctx.storage
            .append_stats_history(StatsHistoryRow::from_snapshot(&stats, Utc::now()))
            .await
            .context("failed to append history")?;
    }

    ctx.storage
        .set_online(node.id, true, None)
        .await
        .context("failed to mark node online")?;

    ctx.storage
        .set_hypervisor(node.id, reading.is_hypervisor)
        .await
        .context("failed to record hypervisor flag")?;

    if reading.is_hypervisor {
        debug!(guests = reading.guests.len(), "hypervisor inventory collected");
        ctx.storage
            .replace_guests(node.id, reading.guests)
            .await
            .context("failed to store guest inventory")?;
    }

    Ok(stats)
}

async fn mark_failed(ctx: &CollectorContext, node: &Node, msg: String) -> Result<StatsSnapshot> {
    warn!("collection failed: {msg}");
    ctx.storage
        .set_online(node.id, false, Some(&msg))
        .await
        .context("failed to mark node offline")?;
    bail!("collection of {} failed: {msg}", node.display_name())
}
