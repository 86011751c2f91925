//! Error types for storage operations

use std::fmt;

use crate::node::{GuestType, NodeId};

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug)]
pub enum StorageError {
    /// Could not open the database
    ConnectionFailed(String),

    QueryFailed(String),

    MigrationFailed(String),

    /// Backend selected in the config is not available
    InvalidConfig(String),

    /// No node with this id
    NodeNotFound(NodeId),

    /// The parent already has a child for this guest
    DuplicateGuest {
        parent_id: NodeId,
        guest_type: GuestType,
        vmid: u32,
    },

    /// Stored JSON (capabilities, device lists) could not be read or written
    SerializationError(String),

    IoError(std::io::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ConnectionFailed(msg) => write!(f, "cannot open storage: {msg}"),
            StorageError::QueryFailed(msg) => write!(f, "query failed: {msg}"),
            StorageError::MigrationFailed(msg) => write!(f, "migration failed: {msg}"),
            StorageError::InvalidConfig(msg) => write!(f, "invalid storage configuration: {msg}"),
            StorageError::NodeNotFound(id) => write!(f, "node {id} not found"),
            StorageError::DuplicateGuest {
                parent_id,
                guest_type,
                vmid,
            } => write!(f, "node {parent_id} already has a child for {guest_type} {vmid}"),
            StorageError::SerializationError(msg) => write!(f, "cannot encode stored value: {msg}"),
            StorageError::IoError(err) => write!(f, "storage I/O: {err}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::IoError(err)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(io_err) => StorageError::IoError(io_err),
            _ => StorageError::QueryFailed(err.to_string()),
        }
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StorageError::MigrationFailed(err.to_string())
    }
}
