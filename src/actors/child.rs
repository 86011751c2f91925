//! ChildPollerActor - Docker inventory of every guest on one host
//!
//! Instead of one SSH connection per VM or container, the actor sends a
//! single script to the Proxmox host that enters each guest with
//! `pct exec` / `qm guest exec`, runs the probe under its own `timeout` and
//! frames the output with `---CHILD:<id>---` markers.
//!
//! ```text
//! timer ─▶ guard ─▶ eligible children ─▶ one remote call ─▶ split by marker
//!                                                              │
//!                         per guest: containers, online flag, breaker
//! ```
//!
//! A cycle that fires while the previous one is still waiting on the host
//! is skipped. The host's own online flag is never touched here.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, error, info, instrument, warn};

use crate::batch::{ChildTarget, build_child_batch, parse_child_batch};
use crate::error::CoreError;
use crate::guard::NonReentrantGuard;
use crate::node::{Node, NodeId};
use crate::parsers;

use super::CollectorContext;
use super::messages::{ChildPollerCommand, ChildPollerStats, CycleReport};

/// Probe run inside every guest; guests without Docker report no containers
pub const DOCKER_PROBE: &str = "command -v docker >/dev/null 2>&1 || exit 0; \
    docker ps -a --format \"{{.ID}}|{{.Names}}|{{.Image}}|{{.Status}}|{{.State}}\"";

/// Children of `host` that can take part in this cycle
///
/// Guests that are offline, lack a way in, or sit behind an open breaker
/// are left out without being counted as failures.
pub fn eligible_children(ctx: &CollectorContext, host: &Node, children: &[Node]) -> Result<Vec<ChildTarget>> {
    let mut targets = Vec::new();

    for child in children {
        if child.parent_id != Some(host.id) {
            return Err(CoreError::ForeignChild {
                node_id: child.id,
                host_id: host.id,
                parent_id: child.parent_id,
            }
            .into());
        }

        let Some((guest_type, vmid)) = child.guest() else {
            continue;
        };
        if !child.online || !child.capabilities.allows_guest_exec(guest_type) {
            continue;
        }
        if !ctx.breaker.can_execute(child.id) {
            debug!(child = child.id, "circuit open, excluding from batch");
            continue;
        }

        targets.push(ChildTarget {
            node_id: child.id,
            guest_type,
            vmid,
        });
    }

    Ok(targets)
}

/// Poll every eligible guest of a host in one remote call
#[instrument(skip(ctx), fields(host = host_id))]
pub async fn poll_children(ctx: &CollectorContext, host_id: NodeId) -> Result<CycleReport> {
    let Some(host) = ctx
        .storage
        .get_node(host_id)
        .await
        .context("failed to load host")?
    else {
        bail!("host {host_id} no longer exists");
    };

    if !host.monitoring_enabled {
        return Ok(CycleReport::default());
    }

    let children = ctx
        .storage
        .list_children(host_id)
        .await
        .context("failed to list children")?;

    let targets = eligible_children(ctx, &host, &children)?;
    if targets.is_empty() {
        debug!("no eligible children");
        return Ok(CycleReport::default());
    }

    let script = build_child_batch(&targets, DOCKER_PROBE, ctx.settings.child_timeout_secs);
    let timeout = Duration::from_secs(ctx.settings.child_batch_timeout_secs);

    let mut report = CycleReport {
        polled: targets.len(),
        ..Default::default()
    };

    let output = match ctx.executor.run(&host.target(), &script, timeout).await {
        Ok(output) if output.is_usable() => output,
        Ok(output) => {
            let reason = format!("batch returned no output (exit {:?})", output.exit_code);
            fail_all(ctx, &targets, &reason).await;
            report.failed = targets.len();
            return Ok(report);
        }
        Err(e) => {
            let reason = format!("batch call failed: {e}");
            fail_all(ctx, &targets, &reason).await;
            report.failed = targets.len();
            return Ok(report);
        }
    };

    let segments = parse_child_batch(&output.stdout);

    for target in &targets {
        let body = match segments.get(&target.node_id) {
            Some(segment) => segment.body().map_err(|e| e.to_string()),
            None => Err("no output for guest in batch".to_string()),
        };

        match body {
            Ok(text) => {
                let containers = parsers::parse_docker_ps(&text);
                debug!(child = target.node_id, containers = containers.len(), "guest polled");
                if let Err(e) = store_success(ctx, target.node_id, containers).await {
                    error!(child = target.node_id, "failed to store guest result: {e:#}");
                }
                report.succeeded += 1;
            }
            Err(reason) => {
                fail_child(ctx, target.node_id, &reason).await;
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

async fn store_success(
    ctx: &CollectorContext,
    node_id: NodeId,
    containers: Vec<crate::node::ContainerRecord>,
) -> Result<()> {
    ctx.breaker.record_success(node_id);
    ctx.storage.replace_containers(node_id, containers).await?;
    ctx.storage.set_online(node_id, true, None).await?;
    Ok(())
}

async fn fail_child(ctx: &CollectorContext, node_id: NodeId, reason: &str) {
    warn!(child = node_id, "guest poll failed: {reason}");
    ctx.breaker.record_failure(node_id);
    if let Err(e) = ctx.storage.set_online(node_id, false, Some(reason)).await {
        error!(child = node_id, "failed to mark guest offline: {e}");
    }
}

async fn fail_all(ctx: &CollectorContext, targets: &[ChildTarget], reason: &str) {
    for target in targets {
        fail_child(ctx, target.node_id, reason).await;
    }
}

/// One guarded cycle, updating the shared counters
async fn run_cycle(
    ctx: CollectorContext,
    host_id: NodeId,
    guard: NonReentrantGuard,
    stats: Arc<Mutex<ChildPollerStats>>,
) -> Result<CycleReport> {
    let Some(_permit) = guard.try_enter() else {
        warn!(host = host_id, "previous child poll still running, skipping cycle");
        stats.lock().unwrap_or_else(|p| p.into_inner()).skipped_count += 1;
        return Ok(CycleReport::skipped());
    };

    let started = Instant::now();
    let result = poll_children(&ctx, host_id).await;
    let elapsed = started.elapsed();

    let mut s = stats.lock().unwrap_or_else(|p| p.into_inner());
    s.poll_count += 1;
    s.last_duration_ms = elapsed.as_millis() as u64;
    s.last_poll = Some(Utc::now());
    match &result {
        Ok(report) => {
            s.success_count += report.succeeded as u64;
            s.fail_count += report.failed as u64;
            s.children_polled = report.polled;
            s.last_error = None;
        }
        Err(e) => {
            s.last_error = Some(format!("{e:#}"));
            error!(host = host_id, "child poll failed: {e:#}");
        }
    }

    result
}

/// Actor that polls the guests of one host
pub struct ChildPollerActor {
    host_id: NodeId,
    ctx: CollectorContext,
    command_rx: mpsc::Receiver<ChildPollerCommand>,
    guard: NonReentrantGuard,
    stats: Arc<Mutex<ChildPollerStats>>,
}

impl ChildPollerActor {
    fn spawn_cycle(&self) -> tokio::task::JoinHandle<Result<CycleReport>> {
        tokio::spawn(run_cycle(
            self.ctx.clone(),
            self.host_id,
            self.guard.clone(),
            Arc::clone(&self.stats),
        ))
    }

    #[instrument(skip(self), fields(host = self.host_id))]
    pub async fn run(mut self) {
        let period = Duration::from_secs(self.ctx.settings.child_poll_interval_secs.max(1));
        let first = Duration::from_millis(self.ctx.settings.child_first_poll_ms);
        info!(interval = ?period, "starting child poller");

        let mut ticker = interval_at(tokio::time::Instant::now() + first, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.spawn_cycle();
                }

                cmd = self.command_rx.recv() => {
                    let Some(cmd) = cmd else {
                        warn!("command channel closed, shutting down");
                        break;
                    };

                    match cmd {
                        ChildPollerCommand::PollNow { respond_to } => {
                            debug!("received PollNow command");
                            let cycle = self.spawn_cycle();
                            tokio::spawn(async move {
                                let result = match cycle.await {
                                    Ok(result) => result,
                                    Err(e) => Err(anyhow::anyhow!("child poll task failed: {e}")),
                                };
                                let _ = respond_to.send(result);
                            });
                        }

                        ChildPollerCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }
            }
        }

        debug!("child poller stopped");
    }
}

/// Handle for controlling a ChildPollerActor
#[derive(Clone)]
pub struct ChildPollerHandle {
    sender: mpsc::Sender<ChildPollerCommand>,
    stats: Arc<Mutex<ChildPollerStats>>,
    pub host_id: NodeId,
}

impl ChildPollerHandle {
    pub fn spawn(host_id: NodeId, ctx: CollectorContext) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let stats = Arc::new(Mutex::new(ChildPollerStats::default()));

        let actor = ChildPollerActor {
            host_id,
            ctx,
            command_rx: cmd_rx,
            guard: NonReentrantGuard::new(),
            stats: Arc::clone(&stats),
        };

        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            stats,
            host_id,
        }
    }

    /// Run a cycle now; returns a skipped report if one is already running
    pub async fn poll_now(&self) -> Result<CycleReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ChildPollerCommand::PollNow { respond_to: tx })
            .await
            .context("failed to send PollNow command")?;

        rx.await.context("failed to receive response")?
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(ChildPollerCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn stats(&self) -> ChildPollerStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}
