//! Message types for actor communication
//!
//! Each poller is driven by an mpsc command channel. Requests that need an
//! answer carry a oneshot sender; status that in-flight runs update is
//! shared through the handle instead of a round trip.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::commands::Tier;
use crate::config::SchedulerConfig;

/// Result of one tier run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum TierOutcome {
    /// Data was collected and stored
    Collected,
    /// The circuit breaker refused the call
    CircuitOpen,
    /// Monitoring is switched off for the node
    Disabled,
    /// The node no longer exists; the poller stops itself
    NodeGone,
    /// The remote call failed or returned nothing usable
    Failed(String),
}

/// Intervals of the three tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierIntervals {
    pub live: Duration,
    pub status: Duration,
    pub hardware: Duration,
}

impl TierIntervals {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            live: config.tier_interval(Tier::Live),
            status: config.tier_interval(Tier::Status),
            hardware: config.tier_interval(Tier::Hardware),
        }
    }

    pub fn get(&self, tier: Tier) -> Duration {
        match tier {
            Tier::Live => self.live,
            Tier::Status => self.status,
            Tier::Hardware => self.hardware,
        }
    }
}

impl Default for TierIntervals {
    fn default() -> Self {
        Self {
            live: Tier::Live.default_interval(),
            status: Tier::Status.default_interval(),
            hardware: Tier::Hardware.default_interval(),
        }
    }
}

/// Commands that can be sent to a TieredPollerActor
#[derive(Debug)]
pub enum TieredCommand {
    /// Run one tier right away, outside its timer
    PollNow {
        tier: Tier,
        respond_to: oneshot::Sender<anyhow::Result<TierOutcome>>,
    },

    /// Replace the tier intervals; all three timers are re-armed
    UpdateIntervals(TierIntervals),

    /// Stop the timers. Runs already in flight finish on their own.
    Shutdown,
}

/// Last known state of one tier
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierState {
    pub last_run: Option<DateTime<Utc>>,
    pub last_outcome: Option<TierOutcome>,
    pub last_error: Option<String>,
    pub runs: u64,
}

/// Status of a tiered poller as seen through its handle
#[derive(Debug, Clone, Default, Serialize)]
pub struct TieredStatus {
    pub running: bool,
    pub tiers: HashMap<Tier, TierState>,
}

impl TieredStatus {
    pub fn last_error(&self, tier: Tier) -> Option<&str> {
        self.tiers.get(&tier).and_then(|t| t.last_error.as_deref())
    }
}

/// Result of one child batch cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// The previous cycle was still running, nothing was done
    pub skipped: bool,
    pub polled: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl CycleReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// Commands that can be sent to a ChildPollerActor
#[derive(Debug)]
pub enum ChildPollerCommand {
    PollNow {
        respond_to: oneshot::Sender<anyhow::Result<CycleReport>>,
    },

    Shutdown,
}

/// Counters kept by a child poller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChildPollerStats {
    pub poll_count: u64,
    pub success_count: u64,
    pub fail_count: u64,
    pub skipped_count: u64,
    pub last_duration_ms: u64,
    pub children_polled: usize,
    pub last_error: Option<String>,
    pub last_poll: Option<DateTime<Utc>>,
}
