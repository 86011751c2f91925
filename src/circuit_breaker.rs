//! Per-node circuit breaker
//!
//! Stops the hub from opening SSH connection after SSH connection to a node
//! that is clearly down. Without it an offline node produces a timeout on
//! every tier tick.
//!
//! ## States
//!
//! ```text
//!            failures >= threshold
//!   Closed ───────────────────────────▶ Open
//!     ▲                                  │
//!     │ success             open_timeout │ elapsed (next check)
//!     │                                  ▼
//!     └──────────────────────────── HalfOpen ──▶ Open (probe failed)
//! ```
//!
//! The breaker does no I/O and cannot fail. Every method has an `_at`
//! variant that takes the clock reading explicitly so transitions can be
//! tested without sleeping.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::node::NodeId;

/// Consecutive failures before the breaker opens
pub const FAILURE_THRESHOLD: u32 = 3;

/// How long an open breaker blocks before allowing a probe
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(60);

/// Probes allowed while half-open
pub const HALF_OPEN_MAX_CALLS: u32 = 1;

/// Open breakers untouched for longer than this are dropped by cleanup
pub const DEFAULT_STALE_AGE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Tunables, defaulting to the constants above
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: FAILURE_THRESHOLD,
            open_timeout: OPEN_TIMEOUT,
            half_open_max_calls: HALF_OPEN_MAX_CALLS,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    failures: u32,
    last_failure: Option<Instant>,
    state: BreakerState,
    half_open_calls: u32,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            failures: 0,
            last_failure: None,
            state: BreakerState::Closed,
            half_open_calls: 0,
        }
    }
}

/// Aggregate counts over all tracked nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub total: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
}

/// Detailed state of one node's breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub node_id: NodeId,
    pub state: BreakerState,
    pub failures: u32,
    pub secs_since_failure: Option<u64>,
}

/// Circuit breaker registry keyed by node id
///
/// Owned by the scheduler coordinator and shared with every poller through
/// an `Arc`. The lock is never held across an await point.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    entries: Mutex<HashMap<NodeId, Entry>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: BreakerSettings) -> Self {
        Self {
            settings,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> BreakerSettings {
        self.settings
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<NodeId, Entry>> {
        // a panic while holding the lock leaves plain counters behind, which
        // are still safe to use
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether an operation against `node_id` may proceed now
    pub fn can_execute(&self, node_id: NodeId) -> bool {
        self.can_execute_at(node_id, Instant::now())
    }

    pub fn can_execute_at(&self, node_id: NodeId, now: Instant) -> bool {
        let mut entries = self.entries();
        let entry = entries.entry(node_id).or_default();

        match entry.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = entry
                    .last_failure
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(Duration::MAX);

                if elapsed > self.settings.open_timeout {
                    // the transitioning call is the probe
                    entry.state = BreakerState::HalfOpen;
                    entry.half_open_calls = 1;
                    info!(node_id, "circuit breaker half-open, allowing probe");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if entry.half_open_calls < self.settings.half_open_max_calls {
                    entry.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Non-mutating check: true only while the breaker is closed
    ///
    /// Used by secondary pollers that must not consume the half-open probe.
    pub fn is_closed(&self, node_id: NodeId) -> bool {
        self.entries()
            .get(&node_id)
            .is_none_or(|e| e.state == BreakerState::Closed)
    }

    pub fn record_success(&self, node_id: NodeId) {
        let mut entries = self.entries();
        let entry = entries.entry(node_id).or_default();

        if entry.state != BreakerState::Closed {
            info!(node_id, "circuit breaker closed after successful request");
        }

        entry.failures = 0;
        entry.state = BreakerState::Closed;
        entry.half_open_calls = 0;
    }

    pub fn record_failure(&self, node_id: NodeId) {
        self.record_failure_at(node_id, Instant::now());
    }

    pub fn record_failure_at(&self, node_id: NodeId, now: Instant) {
        let mut entries = self.entries();
        let entry = entries.entry(node_id).or_default();

        entry.failures = entry.failures.saturating_add(1);
        entry.last_failure = Some(now);

        match entry.state {
            BreakerState::HalfOpen => {
                entry.state = BreakerState::Open;
                warn!(
                    node_id,
                    failures = entry.failures,
                    "circuit breaker reopened, probe failed"
                );
            }
            BreakerState::Closed if entry.failures >= self.settings.failure_threshold => {
                entry.state = BreakerState::Open;
                warn!(
                    node_id,
                    failures = entry.failures,
                    "circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    pub fn state(&self, node_id: NodeId) -> BreakerState {
        self.entries()
            .get(&node_id)
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn failures(&self, node_id: NodeId) -> u32 {
        self.entries().get(&node_id).map(|e| e.failures).unwrap_or(0)
    }

    pub fn reset(&self, node_id: NodeId) {
        if self.entries().remove(&node_id).is_some() {
            debug!(node_id, "circuit breaker reset");
        }
    }

    pub fn reset_all(&self) {
        let mut entries = self.entries();
        let count = entries.len();
        entries.clear();
        debug!("reset {count} circuit breakers");
    }

    pub fn stats(&self) -> BreakerStats {
        let entries = self.entries();
        let mut stats = BreakerStats {
            total: entries.len(),
            ..Default::default()
        };

        for entry in entries.values() {
            match entry.state {
                BreakerState::Closed => stats.closed += 1,
                BreakerState::Open => stats.open += 1,
                BreakerState::HalfOpen => stats.half_open += 1,
            }
        }

        stats
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let mut out: Vec<_> = self
            .entries()
            .iter()
            .map(|(id, e)| BreakerSnapshot {
                node_id: *id,
                state: e.state,
                failures: e.failures,
                secs_since_failure: e
                    .last_failure
                    .map(|t| now.saturating_duration_since(t).as_secs()),
            })
            .collect();
        out.sort_by_key(|s| s.node_id);
        out
    }

    /// Drop open breakers whose last failure is older than `max_age`
    ///
    /// A node that is still polled never stays open that long (the next
    /// check moves it to half-open), so this only sheds state for nodes
    /// nobody asks about anymore.
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        self.cleanup_stale_at(max_age, Instant::now())
    }

    pub fn cleanup_stale_at(&self, max_age: Duration, now: Instant) -> usize {
        let mut entries = self.entries();
        let before = entries.len();

        entries.retain(|node_id, e| {
            let stale = e.state == BreakerState::Open
                && e.last_failure
                    .is_some_and(|t| now.saturating_duration_since(t) > max_age);
            if stale {
                debug!(node_id, "dropping stale circuit breaker");
            }
            !stale
        });

        before - entries.len()
    }
}
