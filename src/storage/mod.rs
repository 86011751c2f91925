//! Persistence for nodes, metrics and inventory
//!
//! ## Design
//!
//! - **Trait-based**: `StorageBackend` trait allows swapping implementations
//! - **Async**: All operations are async for compatibility with Tokio actors
//! - **Partial writes**: current stats are merged, never overwritten wholesale
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database, behind the `storage-sqlite` feature
//! - **In-Memory**: No persistence, for tests or a throwaway hub
//!
//! ## Usage
//!
//! ```no_run
//! use homelab_monitoring::storage::{StorageBackend, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./homelab.db").await?;
//!     let nodes = backend.list_nodes().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{HealthStatus, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use schema::{HardwareSnapshot, StatsHistoryRow, StatsPatch, StatsSnapshot};

use crate::config::StorageConfig;

/// Build the backend selected in the config
pub async fn open(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path, .. } => Ok(Arc::new(sqlite::SqliteBackend::new(path).await?)),
        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => Err(StorageError::InvalidConfig(
            "sqlite storage requires the storage-sqlite feature".to_string(),
        )),
    }
}
