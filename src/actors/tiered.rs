//! TieredPollerActor - three cadences of collection for one node
//!
//! ## Tiers
//!
//! | Tier | Default | Timeout | Collects | On failure |
//! |------|---------|---------|----------|------------|
//! | live | 5s | 5s | load, memory, uptime, containers | node offline, breaker failure |
//! | status | 30s | 10s | disk, temperatures, network | logged |
//! | hardware | 300s | 30s | cpu model, cores, devices | logged |
//!
//! The live tier is the only one that moves the circuit breaker or the
//! node's online flag. The slower tiers only run while the breaker is
//! closed, so they never steal the half-open probe.
//!
//! ## Message Flow
//!
//! ```text
//! tier timer ─▶ spawn run_tier ─▶ one batched remote call ─▶ parse ─▶ merge stats
//!     ↑
//!     └─── Commands (PollNow, UpdateIntervals, Shutdown)
//! ```
//!
//! Every run is its own task: a slow hardware probe never delays the live
//! tier, and shutting the actor down leaves in-flight runs to finish.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::batch::{build_command_batch, parse_command_batch};
use crate::commands::Tier;
use crate::error::CoreError;
use crate::executor::ExecOutput;
use crate::node::{GuestType, Node, NodeId};
use crate::parsers;
use crate::storage::{HardwareSnapshot, StatsPatch};

use super::CollectorContext;
use super::messages::{TierIntervals, TierOutcome, TierState, TieredCommand, TieredStatus};

type SharedStatus = Arc<Mutex<HashMap<Tier, TierState>>>;

/// Run one tier against a node
///
/// Re-reads the node first so deletions and disabled monitoring take effect
/// on the next run. Only storage failures and invariant violations are
/// returned as errors; remote failures are reported as
/// [`TierOutcome::Failed`].
#[instrument(skip_all, fields(node = node_id, tier = %tier))]
pub async fn run_tier(ctx: &CollectorContext, node_id: NodeId, tier: Tier) -> Result<TierOutcome> {
    let Some(node) = ctx
        .storage
        .get_node(node_id)
        .await
        .context("failed to load node")?
    else {
        return Ok(TierOutcome::NodeGone);
    };

    if node.is_guest() {
        return Err(CoreError::GuestInDirectPoller { node_id }.into());
    }

    if !node.monitoring_enabled {
        trace!("monitoring disabled, skipping");
        return Ok(TierOutcome::Disabled);
    }

    let allowed = match tier {
        Tier::Live => ctx.breaker.can_execute(node_id),
        Tier::Status | Tier::Hardware => ctx.breaker.is_closed(node_id),
    };
    if !allowed {
        debug!("circuit open, skipping");
        return Ok(TierOutcome::CircuitOpen);
    }

    let commands = ctx.registry.commands_for_tier(tier, &node.capabilities);
    if commands.is_empty() {
        return Ok(TierOutcome::Collected);
    }

    let script = build_command_batch(&commands);
    let timeout = ctx.settings.tier_timeout(tier);

    let failure = match ctx.executor.run(&node.target(), &script, timeout).await {
        Ok(output) if output.is_usable() => {
            let sections = parse_command_batch(&output.stdout);
            let now = Utc::now();
            match tier {
                Tier::Live => store_live(ctx, &node, &sections, now).await?,
                Tier::Status => store_status(ctx, &node, &sections, now).await?,
                Tier::Hardware => store_hardware(ctx, &node, &sections, now).await?,
            }
            return Ok(TierOutcome::Collected);
        }
        Ok(output) => describe_unusable(&output),
        Err(e) => e.to_string(),
    };

    if tier == Tier::Live {
        ctx.breaker.record_failure(node_id);
        ctx.storage
            .set_online(node_id, false, Some(&failure))
            .await
            .context("failed to mark node offline")?;
    }
    warn!("collection failed: {failure}");

    Ok(TierOutcome::Failed(failure))
}

fn describe_unusable(output: &ExecOutput) -> String {
    let stderr = output.stderr.trim();
    match output.exit_code {
        Some(code) if !stderr.is_empty() => format!("exit code {code}: {stderr}"),
        Some(code) => format!("exit code {code} without output"),
        None => "remote command killed by signal".to_string(),
    }
}

fn section<'a>(sections: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    sections.get(key).map(String::as_str)
}

/// Live-tier fields from `uptime`, `free -b` and `nproc` output
///
/// Missing values fall back to zero so a garbled reply does not leave the
/// previous numbers looking current.
pub(crate) fn live_patch(
    uptime: Option<&str>,
    free: Option<&str>,
    nproc: Option<&str>,
    now: DateTime<Utc>,
) -> StatsPatch {
    let up = uptime.map(parsers::parse_uptime).unwrap_or_default();
    let (load_1m, load_5m, load_15m) = up.load.unwrap_or_else(|| {
        warn!("no load average in uptime output");
        (0.0, 0.0, 0.0)
    });

    let mem = free.and_then(parsers::parse_free).unwrap_or_else(|| {
        warn!("no memory line in free output");
        parsers::MemoryInfo::default()
    });

    let cores = nproc.and_then(parsers::parse_nproc).unwrap_or(1);

    StatsPatch {
        cpu_percent: Some(parsers::cpu_estimate(load_1m, cores)),
        load_1m: Some(load_1m),
        load_5m: Some(load_5m),
        load_15m: Some(load_15m),
        ram_used_bytes: Some(mem.used),
        ram_available_bytes: Some(mem.available),
        ram_percent: Some(mem.used_percent()),
        swap_used_bytes: Some(mem.swap_used.unwrap_or(0)),
        uptime_seconds: Some(up.uptime_seconds.unwrap_or(0)),
        users: Some(up.users.unwrap_or(0)),
        tier1_updated_at: Some(now),
        ..Default::default()
    }
}

async fn store_live(
    ctx: &CollectorContext,
    node: &Node,
    sections: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut patch = live_patch(
        section(sections, "system.uptime"),
        section(sections, "system.memory"),
        section(sections, "system.nproc"),
        now,
    );

    if let Some(stats) = section(sections, "docker.stats") {
        patch.containers_running = Some(parsers::count_docker_stats(stats));
    }

    ctx.storage
        .merge_current_stats(node.id, &patch)
        .await
        .context("failed to store live stats")?;

    // pvesh falls back to `[]` on error, so an empty list is not trusted to
    // clear the inventory; the host collection handles that case
    if node.capabilities.has("proxmox") {
        let mut guests = Vec::new();
        for (key, guest_type) in [("proxmox.vms", GuestType::Vm), ("proxmox.cts", GuestType::Lxc)] {
            if let Some(text) = section(sections, key) {
                guests.extend(parsers::parse_pvesh_guests(text, guest_type));
            }
        }
        if !guests.is_empty() {
            ctx.storage
                .set_hypervisor(node.id, true)
                .await
                .context("failed to flag hypervisor")?;
            ctx.storage
                .replace_guests(node.id, guests)
                .await
                .context("failed to store guest inventory")?;
        }
    }

    ctx.storage
        .set_online(node.id, true, None)
        .await
        .context("failed to mark node online")?;
    ctx.breaker.record_success(node.id);

    Ok(())
}

/// Status-tier fields; nothing here touches the live columns
pub(crate) fn status_patch(sections: &HashMap<String, String>, now: DateTime<Utc>) -> StatsPatch {
    let disk = section(sections, "storage.df")
        .and_then(parsers::parse_df)
        .or_else(|| section(sections, "storage.lsblk").and_then(parsers::parse_lsblk_root));
    if disk.is_none() {
        warn!("no usable disk usage in df or lsblk output");
    }
    let disk = disk.unwrap_or_default();

    let (net_rx, net_tx) = match section(sections, "network.interfaces").and_then(parsers::parse_net_dev) {
        Some((rx, tx)) => (Some(rx), Some(tx)),
        None => (None, None),
    };

    StatsPatch {
        disk_used_bytes: Some(disk.used),
        disk_available_bytes: Some(disk.available),
        disk_percent: Some(disk.percent),
        temp_cpu: section(sections, "sensors.thermal").and_then(parsers::parse_temperature),
        temp_gpu: section(sections, "gpu.nvidia").and_then(parsers::parse_nvidia_temp),
        zfs_unhealthy_pools: section(sections, "zfs.pools").and_then(parsers::count_unhealthy_pools),
        net_rx_bytes: net_rx,
        net_tx_bytes: net_tx,
        tier2_updated_at: Some(now),
        ..Default::default()
    }
}

async fn store_status(
    ctx: &CollectorContext,
    node: &Node,
    sections: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> Result<()> {
    let patch = status_patch(sections, now);
    ctx.storage
        .merge_current_stats(node.id, &patch)
        .await
        .context("failed to store status stats")?;
    Ok(())
}

pub(crate) fn hardware_snapshot(
    node_id: NodeId,
    sections: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> HardwareSnapshot {
    let identity = section(sections, "hardware.fastfetch")
        .map(parsers::parse_hardware_json)
        .unwrap_or_default();

    HardwareSnapshot {
        node_id,
        cpu_model: identity.cpu_model,
        cpu_cores: identity.cpu_cores,
        ram_total_bytes: identity.ram_total_bytes,
        pci_devices: section(sections, "hardware.lspci")
            .map(parsers::parse_lspci)
            .unwrap_or_default(),
        usb_devices: section(sections, "hardware.lsusb")
            .map(parsers::parse_lsusb)
            .unwrap_or_default(),
        smart_healthy: section(sections, "storage.smart").and_then(parsers::parse_smart_health),
        updated_at: now,
    }
}

async fn store_hardware(
    ctx: &CollectorContext,
    node: &Node,
    sections: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> Result<()> {
    ctx.storage
        .save_hardware(hardware_snapshot(node.id, sections, now))
        .await
        .context("failed to store hardware snapshot")?;
    Ok(())
}

/// Run a tier and record its outcome in the shared status
async fn run_and_record(
    ctx: CollectorContext,
    node_id: NodeId,
    tier: Tier,
    status: SharedStatus,
    control: mpsc::WeakSender<TieredCommand>,
) -> Result<TierOutcome> {
    let result = run_tier(&ctx, node_id, tier).await;

    {
        let mut status = status.lock().unwrap_or_else(|p| p.into_inner());
        let state = status.entry(tier).or_default();
        state.runs += 1;
        state.last_run = Some(Utc::now());
        match &result {
            Ok(outcome) => {
                state.last_error = match outcome {
                    TierOutcome::Failed(msg) => Some(msg.clone()),
                    _ => None,
                };
                state.last_outcome = Some(outcome.clone());
            }
            Err(e) => state.last_error = Some(format!("{e:#}")),
        }
    }

    match &result {
        Ok(TierOutcome::NodeGone) => {
            info!(node = node_id, "node deleted, stopping poller");
            if let Some(tx) = control.upgrade() {
                let _ = tx.try_send(TieredCommand::Shutdown);
            }
        }
        Err(e) => error!(node = node_id, %tier, "tier run failed: {e:#}"),
        _ => {}
    }

    result
}

fn ticker(period: std::time::Duration) -> Interval {
    let mut t = interval(period);
    t.set_missed_tick_behavior(MissedTickBehavior::Skip);
    t
}

/// Actor that runs the three tiers of one node
pub struct TieredPollerActor {
    node_id: NodeId,
    ctx: CollectorContext,
    intervals: TierIntervals,
    command_rx: mpsc::Receiver<TieredCommand>,
    control: mpsc::WeakSender<TieredCommand>,
    status: SharedStatus,
}

impl TieredPollerActor {
    fn spawn_run(&self, tier: Tier) {
        tokio::spawn(run_and_record(
            self.ctx.clone(),
            self.node_id,
            tier,
            Arc::clone(&self.status),
            self.control.clone(),
        ));
    }

    #[instrument(skip(self), fields(node = self.node_id))]
    pub async fn run(mut self) {
        debug!("starting tiered poller");

        let mut live = ticker(self.intervals.live);
        let mut status = ticker(self.intervals.status);
        let mut hardware = ticker(self.intervals.hardware);

        loop {
            tokio::select! {
                _ = live.tick() => self.spawn_run(Tier::Live),
                _ = status.tick() => self.spawn_run(Tier::Status),
                _ = hardware.tick() => self.spawn_run(Tier::Hardware),

                cmd = self.command_rx.recv() => {
                    // timers never finish, so a closed channel has to end the loop here
                    let Some(cmd) = cmd else {
                        warn!("command channel closed, shutting down");
                        break;
                    };

                    match cmd {
                        TieredCommand::PollNow { tier, respond_to } => {
                            debug!(%tier, "received PollNow command");
                            let run = run_and_record(
                                self.ctx.clone(),
                                self.node_id,
                                tier,
                                Arc::clone(&self.status),
                                self.control.clone(),
                            );
                            tokio::spawn(async move {
                                let _ = respond_to.send(run.await);
                            });
                        }

                        TieredCommand::UpdateIntervals(intervals) => {
                            debug!(?intervals, "updating tier intervals");
                            self.intervals = intervals;
                            live = ticker(intervals.live);
                            status = ticker(intervals.status);
                            hardware = ticker(intervals.hardware);
                        }

                        TieredCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }
            }
        }

        debug!("tiered poller stopped");
    }
}

/// Handle for controlling a TieredPollerActor
#[derive(Clone)]
pub struct TieredPollerHandle {
    sender: mpsc::Sender<TieredCommand>,
    status: SharedStatus,
    pub node_id: NodeId,
}

impl TieredPollerHandle {
    /// Spawn a poller; every tier fires once immediately
    pub fn spawn(node_id: NodeId, ctx: CollectorContext, intervals: TierIntervals) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let status = SharedStatus::default();

        let actor = TieredPollerActor {
            node_id,
            ctx,
            intervals,
            command_rx: cmd_rx,
            control: cmd_tx.downgrade(),
            status: Arc::clone(&status),
        };

        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            status,
            node_id,
        }
    }

    /// Run a tier immediately and wait for its outcome
    pub async fn poll_now(&self, tier: Tier) -> Result<TierOutcome> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(TieredCommand::PollNow {
                tier,
                respond_to: tx,
            })
            .await
            .context("failed to send PollNow command")?;

        rx.await.context("failed to receive response")?
    }

    pub async fn update_intervals(&self, intervals: TierIntervals) -> Result<()> {
        self.sender
            .send(TieredCommand::UpdateIntervals(intervals))
            .await
            .context("failed to send UpdateIntervals command")?;
        Ok(())
    }

    /// Stop the timers; in-flight runs are not cancelled
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(TieredCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn status(&self) -> TieredStatus {
        TieredStatus {
            running: self.is_running(),
            tiers: self.status.lock().unwrap_or_else(|p| p.into_inner()).clone(),
        }
    }
}
