//! SchedulerCoordinator - owner of every poller and timer
//!
//! ## Responsibilities
//!
//! - A global tick that collects due nodes in bounded chunks
//! - One tiered poller per monitored standalone or host node
//! - One child poller per hypervisor host, once discovery had a chance to run
//! - Discovery, guest address sweep and maintenance timers
//!
//! ## Startup staging
//!
//! ```text
//! t=0    tick loop, tiered pollers
//! t=10s  discovery (hypervisor flags come from the tick by then)
//! t=30s  child pollers
//! t=60s  guest address sweep
//! hourly history retention, stale breaker cleanup
//! ```
//!
//! All poller handles live in a [`PollerRegistry`] owned by the coordinator,
//! so a fresh coordinator always starts from a clean slate.
//!
//! Stopping ends the timer loops and the pollers. A discovery or sweep run
//! that is already underway keeps its own task and finishes, so no SSH call
//! is cut off halfway.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tracing::{debug, error, info, instrument, warn};

use crate::actors::CollectorContext;
use crate::actors::child::ChildPollerHandle;
use crate::actors::host::collect_host;
use crate::actors::messages::TierIntervals;
use crate::actors::tiered::TieredPollerHandle;
use crate::circuit_breaker::BreakerState;
use crate::commands::Tier;
use crate::discovery::{DiscoverySync, SyncSummary};
use crate::error::CoreError;
use crate::guard::NonReentrantGuard;
use crate::node::{Node, NodeId};
use crate::storage::StatsSnapshot;

/// Active pollers and collection bookkeeping, keyed by node id
#[derive(Default)]
pub struct PollerRegistry {
    pub tiered: HashMap<NodeId, TieredPollerHandle>,
    pub child: HashMap<NodeId, ChildPollerHandle>,
    pub last_collection: HashMap<NodeId, Instant>,
}

/// Result of one global tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Result of the maintenance job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub history_removed: usize,
    pub breakers_removed: usize,
}

/// Per-node view for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub name: String,
    pub online: bool,
    /// A poller is currently responsible for this node
    pub running: bool,
    pub breaker: BreakerState,
    pub last_error: Option<String>,
    pub stats: Option<StatsSnapshot>,
}

/// Whether a node should be collected by the global tick
///
/// Guests are polled through their host and never collected directly.
pub fn is_due(node: &Node, last: Option<Instant>, now: Instant, min_interval: Duration) -> bool {
    if !node.monitoring_enabled || node.is_guest() {
        return false;
    }
    let interval = Duration::from_secs(node.monitoring_interval).max(min_interval);
    match last {
        None => true,
        Some(last) => now.saturating_duration_since(last) >= interval,
    }
}

pub struct SchedulerCoordinator {
    ctx: CollectorContext,
    discovery: DiscoverySync,
    retention: Duration,
    registry: Mutex<PollerRegistry>,
    tick_guard: NonReentrantGuard,
    timers: Mutex<Vec<JoinHandle<()>>>,
    /// Ticks and timer jobs that may still be running
    runs: Mutex<Vec<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
    child_pollers_enabled: AtomicBool,
}

/// Resolves once `stop_all` has been called
async fn stopped(stop: &mut watch::Receiver<bool>) {
    // a dropped sender counts as stopped
    let _ = stop.wait_for(|stopping| *stopping).await;
}

impl SchedulerCoordinator {
    pub fn new(ctx: CollectorContext, discovery: DiscoverySync, retention: Duration) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            discovery,
            retention,
            registry: Mutex::new(PollerRegistry::default()),
            tick_guard: NonReentrantGuard::new(),
            timers: Mutex::new(Vec::new()),
            runs: Mutex::new(Vec::new()),
            stop: watch::channel(false).0,
            child_pollers_enabled: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &CollectorContext {
        &self.ctx
    }

    pub fn discovery(&self) -> &DiscoverySync {
        &self.discovery
    }

    fn registry(&self) -> MutexGuard<'_, PollerRegistry> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn tiered_poller(&self, node_id: NodeId) -> Option<TieredPollerHandle> {
        self.registry().tiered.get(&node_id).cloned()
    }

    pub fn child_poller(&self, host_id: NodeId) -> Option<ChildPollerHandle> {
        self.registry().child.get(&host_id).cloned()
    }

    /// One pass of the global collection loop
    ///
    /// Returns `None` when the previous tick is still running. Failing to
    /// load the node list aborts this tick only.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<Option<TickReport>> {
        let Some(_permit) = self.tick_guard.try_enter() else {
            debug!("previous tick still running, skipping");
            return Ok(None);
        };

        let nodes = self
            .ctx
            .storage
            .list_nodes()
            .await
            .context("failed to load nodes")?;

        let min_interval = Duration::from_secs(self.ctx.settings.min_interval_secs);
        let now = Instant::now();
        let due: Vec<Node> = {
            let registry = self.registry();
            nodes
                .into_iter()
                .filter(|n| is_due(n, registry.last_collection.get(&n.id).copied(), now, min_interval))
                .collect()
        };

        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(Some(report));
        }

        for chunk in due.chunks(self.ctx.settings.chunk_size.max(1)) {
            let results = join_all(chunk.iter().map(|node| collect_host(&self.ctx, node))).await;

            let mut registry = self.registry();
            for (node, result) in chunk.iter().zip(results) {
                // stamped on failure too, so a dead host waits a full interval
                registry.last_collection.insert(node.id, Instant::now());
                match result {
                    Ok(_) => report.succeeded += 1,
                    Err(e) => {
                        debug!(node = node.id, "collection failed: {e:#}");
                        report.failed += 1;
                    }
                }
            }
        }

        debug!(due = report.due, failed = report.failed, "tick finished");
        Ok(Some(report))
    }

    fn push_timer(&self, handle: JoinHandle<()>) {
        self.timers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(handle);
    }

    fn track_run(&self, handle: JoinHandle<()>) {
        let mut runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        runs.retain(|h| !h.is_finished());
        runs.push(handle);
    }

    /// Wait up to `grace` for ticks and timer jobs started before `stop_all`
    ///
    /// Returns `false` if some were still running when the grace period ended.
    pub async fn wait_for_jobs(&self, grace: Duration) -> bool {
        let runs: Vec<_> = self
            .runs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        if runs.is_empty() {
            return true;
        }
        debug!(jobs = runs.len(), "waiting for running jobs");
        tokio::time::timeout(grace, join_all(runs)).await.is_ok()
    }

    /// Run `job` after `delay` and then every `period`, one run at a time
    ///
    /// Each run gets its own task; stopping ends the loop but lets a run
    /// in progress complete.
    fn spawn_periodic<F, Fut>(self: &Arc<Self>, name: &'static str, delay: Duration, period: Duration, job: F)
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let this = Arc::clone(self);
        let mut stop = self.stop.subscribe();
        let handle = tokio::spawn(async move {
            let guard = NonReentrantGuard::new();
            let mut ticker = interval_at(Instant::now() + delay, period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped(&mut stop) => break,
                }
                let Some(permit) = guard.try_enter() else {
                    debug!(timer = name, "previous run still going, skipping");
                    continue;
                };
                let run = job(Arc::clone(&this));
                this.track_run(tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = run.await {
                        error!(timer = name, "{e:#}");
                    }
                }));
            }
            debug!(timer = name, "timer stopped");
        });
        self.push_timer(handle);
    }

    /// Start the tick loop, pollers and background timers
    #[instrument(skip(self))]
    pub async fn start_all(self: &Arc<Self>) -> Result<()> {
        let settings = Arc::clone(&self.ctx.settings);
        self.stop.send_replace(false);
        info!(
            tick_ms = settings.tick_ms,
            chunk_size = settings.chunk_size,
            "starting scheduler"
        );

        // each tick runs in its own task so the guard, not the loop, decides on overlap
        let this = Arc::clone(self);
        let mut stop = self.stop.subscribe();
        let tick_period = Duration::from_millis(settings.tick_ms.max(1));
        self.push_timer(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped(&mut stop) => break,
                }
                let run = Arc::clone(&this);
                this.track_run(tokio::spawn(async move {
                    if let Err(e) = run.tick().await {
                        error!("tick failed: {e:#}");
                    }
                }));
            }
        }));

        self.reconcile_pollers().await?;

        let discovery = self.discovery.config().clone();

        self.spawn_periodic(
            "discovery",
            Duration::from_secs(settings.discovery_delay_secs),
            Duration::from_secs(discovery.interval_secs),
            |this| async move {
                let summary = this.discovery.sync_all_hosts().await?;
                for e in &summary.errors {
                    warn!("discovery: {e}");
                }
                this.reconcile_pollers().await
            },
        );

        let this = Arc::clone(self);
        let mut stop = self.stop.subscribe();
        let delay = Duration::from_secs(settings.child_poller_delay_secs);
        self.push_timer(tokio::spawn(async move {
            tokio::select! {
                _ = sleep(delay) => {}
                _ = stopped(&mut stop) => return,
            }
            if *stop.borrow() {
                return;
            }
            this.child_pollers_enabled.store(true, Ordering::Release);
            info!("enabling child pollers");
            if let Err(e) = this.reconcile_pollers().await {
                error!("failed to start child pollers: {e:#}");
            }
        }));

        self.spawn_periodic(
            "ip-sweep",
            Duration::from_secs(settings.ip_sweep_delay_secs),
            Duration::from_secs(discovery.ip_sweep_interval_secs),
            |this| async move {
                let filled = this.discovery.fill_missing_guest_ips().await?;
                if filled > 0 {
                    info!(filled, "resolved guest addresses");
                }
                Ok(())
            },
        );

        let maintenance = Duration::from_secs(settings.maintenance_interval_secs);
        self.spawn_periodic("maintenance", maintenance, maintenance, |this| async move {
            this.maintenance().await.map(|_| ())
        });

        Ok(())
    }

    /// Stop timers and every poller; in-flight calls finish on their own
    #[instrument(skip(self))]
    pub async fn stop_all(&self) {
        self.stop.send_replace(true);
        self.child_pollers_enabled.store(false, Ordering::Release);

        let timers: Vec<_> = self
            .timers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for timer in timers {
            if let Err(e) = timer.await {
                warn!("timer ended abnormally: {e}");
            }
        }

        let (tiered, child): (Vec<_>, Vec<_>) = {
            let mut registry = self.registry();
            (
                registry.tiered.drain().map(|(_, h)| h).collect(),
                registry.child.drain().map(|(_, h)| h).collect(),
            )
        };

        info!(
            tiered = tiered.len(),
            child = child.len(),
            "stopping pollers"
        );

        for handle in tiered {
            let _ = handle.shutdown().await;
        }
        for handle in child {
            let _ = handle.shutdown().await;
        }
    }

    /// Bring the set of running pollers in line with the node table
    ///
    /// Starts pollers for enabled standalone/host nodes and, once enabled,
    /// for hypervisor hosts; stops pollers of deleted or disabled nodes.
    pub async fn reconcile_pollers(&self) -> Result<()> {
        let nodes = self
            .ctx
            .storage
            .list_nodes()
            .await
            .context("failed to load nodes")?;

        let monitored: HashSet<NodeId> = nodes
            .iter()
            .filter(|n| n.monitoring_enabled && !n.is_guest())
            .map(|n| n.id)
            .collect();

        let mut hypervisors = HashSet::new();
        if self.child_pollers_enabled.load(Ordering::Acquire) {
            for id in &monitored {
                if self.ctx.storage.is_hypervisor(*id).await? {
                    hypervisors.insert(*id);
                }
            }
        }

        let intervals = TierIntervals::from_config(&self.ctx.settings);
        let mut stopped_tiered = Vec::new();
        let mut stopped_child = Vec::new();

        {
            let mut registry = self.registry();
            // a discovery run outliving stop_all must not restart pollers
            if *self.stop.borrow() {
                return Ok(());
            }

            registry
                .tiered
                .retain(|id, handle| {
                    let keep = monitored.contains(id) && handle.is_running();
                    if !keep {
                        stopped_tiered.push(handle.clone());
                    }
                    keep
                });
            registry.child.retain(|id, handle| {
                let keep = hypervisors.contains(id) && handle.is_running();
                if !keep {
                    stopped_child.push(handle.clone());
                }
                keep
            });

            for id in &monitored {
                if !registry.tiered.contains_key(id) {
                    debug!(node = id, "starting tiered poller");
                    let handle = TieredPollerHandle::spawn(*id, self.ctx.clone(), intervals);
                    registry.tiered.insert(*id, handle);
                }
            }
            for id in &hypervisors {
                if !registry.child.contains_key(id) {
                    debug!(host = id, "starting child poller");
                    let handle = ChildPollerHandle::spawn(*id, self.ctx.clone());
                    registry.child.insert(*id, handle);
                }
            }

            registry.last_collection.retain(|id, _| monitored.contains(id));
        }

        for handle in stopped_tiered {
            let _ = handle.shutdown().await;
        }
        for handle in stopped_child {
            let _ = handle.shutdown().await;
        }

        Ok(())
    }

    /// Start polling one node
    ///
    /// Returns `false` when monitoring is disabled or a poller already runs.
    #[instrument(skip(self))]
    pub async fn start_monitoring(&self, node_id: NodeId) -> Result<bool> {
        let node = self
            .ctx
            .storage
            .get_node(node_id)
            .await?
            .ok_or_else(|| anyhow!("node {node_id} not found"))?;

        if node.is_guest() {
            return Err(CoreError::GuestInDirectPoller { node_id }.into());
        }
        if !node.monitoring_enabled {
            return Ok(false);
        }

        let start_child = self.child_pollers_enabled.load(Ordering::Acquire)
            && self.ctx.storage.is_hypervisor(node_id).await?;

        let mut registry = self.registry();
        let mut started = false;

        if !registry.tiered.get(&node_id).is_some_and(|h| h.is_running()) {
            let intervals = TierIntervals::from_config(&self.ctx.settings);
            registry
                .tiered
                .insert(node_id, TieredPollerHandle::spawn(node_id, self.ctx.clone(), intervals));
            started = true;
        }
        if start_child && !registry.child.get(&node_id).is_some_and(|h| h.is_running()) {
            registry
                .child
                .insert(node_id, ChildPollerHandle::spawn(node_id, self.ctx.clone()));
        }

        Ok(started)
    }

    /// Stop the pollers of one node; returns whether any was running
    #[instrument(skip(self))]
    pub async fn stop_monitoring(&self, node_id: NodeId) -> Result<bool> {
        let (tiered, child) = {
            let mut registry = self.registry();
            registry.last_collection.remove(&node_id);
            (registry.tiered.remove(&node_id), registry.child.remove(&node_id))
        };

        let was_running = tiered.is_some() || child.is_some();
        if let Some(handle) = tiered {
            handle.shutdown().await?;
        }
        if let Some(handle) = child {
            handle.shutdown().await?;
        }

        Ok(was_running)
    }

    /// Collect one node right away, honoring its circuit breaker
    #[instrument(skip(self))]
    pub async fn collect_now(&self, node_id: NodeId) -> Result<StatsSnapshot> {
        let node = self
            .ctx
            .storage
            .get_node(node_id)
            .await?
            .ok_or_else(|| anyhow!("node {node_id} not found"))?;

        let result = collect_host(&self.ctx, &node).await;
        self.registry().last_collection.insert(node_id, Instant::now());
        result
    }

    /// Status of every known node
    pub async fn get_status(&self) -> Result<Vec<NodeStatus>> {
        let nodes = self.ctx.storage.list_nodes().await?;
        let mut statuses = Vec::with_capacity(nodes.len());

        for node in nodes {
            let (running, poller_error) = {
                let registry = self.registry();
                match node.parent_id.filter(|_| node.is_guest()) {
                    Some(parent) => (
                        registry.child.get(&parent).is_some_and(|h| h.is_running()),
                        None,
                    ),
                    None => match registry.tiered.get(&node.id) {
                        Some(h) => (
                            h.is_running(),
                            h.status().last_error(Tier::Live).map(str::to_string),
                        ),
                        None => (false, None),
                    },
                }
            };

            let stats = self.ctx.storage.current_stats(node.id).await?;
            statuses.push(NodeStatus {
                node_id: node.id,
                name: node.name,
                online: node.online,
                running,
                breaker: self.ctx.breaker.state(node.id),
                last_error: node.last_error.or(poller_error),
                stats,
            });
        }

        Ok(statuses)
    }

    /// Manual discovery run, followed by poller reconciliation
    pub async fn sync_now(&self) -> Result<SyncSummary> {
        let summary = self.discovery.sync_all_hosts().await?;
        self.reconcile_pollers().await?;
        Ok(summary)
    }

    /// History retention and stale breaker cleanup
    #[instrument(skip(self))]
    pub async fn maintenance(&self) -> Result<MaintenanceReport> {
        let retention = chrono::Duration::from_std(self.retention).context("retention out of range")?;
        let history_removed = self
            .ctx
            .storage
            .cleanup_history(Utc::now() - retention)
            .await
            .context("failed to clean up history")?;

        let stale_after = Duration::from_secs(self.ctx.settings.breaker_stale_after_secs);
        let breakers_removed = self.ctx.breaker.cleanup_stale(stale_after);

        if history_removed > 0 || breakers_removed > 0 {
            info!(history_removed, breakers_removed, "maintenance finished");
        }

        Ok(MaintenanceReport {
            history_removed,
            breakers_removed,
        })
    }
}
