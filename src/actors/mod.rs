//! Polling actors
//!
//! Each poller runs as an independent tokio task with its own timers and an
//! mpsc command channel, controlled through a cloneable handle.
//!
//! ```text
//!                 SchedulerCoordinator
//!                   │            │
//!          spawns   │            │ spawns
//!                   ▼            ▼
//!        TieredPoller (per node)   ChildPoller (per hypervisor host)
//!         tier1 / tier2 / tier3     one batched call for all guests
//!                   │            │
//!                   └─────┬──────┘
//!                         ▼
//!        CircuitBreaker ─▶ RemoteExecutor ─▶ StorageBackend
//! ```
//!
//! ## Actor Types
//!
//! - **TieredPollerActor**: live, status and hardware tiers of one node
//! - **ChildPollerActor**: Docker inventory of every guest on one host
//! - **host**: not an actor; the lightweight collection run by the global tick
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Request/Response**: oneshot channels for `PollNow`
//! 3. **Shared status**: counters the handle reads without a round trip

use std::sync::Arc;

use crate::circuit_breaker::CircuitBreaker;
use crate::commands::CommandRegistry;
use crate::config::SchedulerConfig;
use crate::executor::RemoteExecutor;
use crate::storage::StorageBackend;

pub mod child;
pub mod host;
pub mod messages;
pub mod tiered;

/// Shared collaborators every poller needs
#[derive(Clone)]
pub struct CollectorContext {
    pub storage: Arc<dyn StorageBackend>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub breaker: Arc<CircuitBreaker>,
    pub registry: CommandRegistry,
    pub settings: Arc<SchedulerConfig>,
}

impl CollectorContext {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        executor: Arc<dyn RemoteExecutor>,
        settings: SchedulerConfig,
    ) -> Self {
        Self {
            breaker: Arc::new(CircuitBreaker::with_settings(settings.breaker_settings())),
            storage,
            executor,
            registry: CommandRegistry::new(),
            settings: Arc::new(settings),
        }
    }
}
