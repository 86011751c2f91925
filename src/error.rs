//! Errors for broken data-model assumptions

use std::fmt;

use crate::node::NodeId;

/// Raised when stored data contradicts what a component was built for
///
/// These indicate a bug or a corrupted record, never a flaky host, so they
/// are surfaced instead of being retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A guest node was handed to a poller that connects directly
    GuestInDirectPoller { node_id: NodeId },

    /// A child was handed to the batch builder of a host it does not belong to
    ForeignChild {
        node_id: NodeId,
        host_id: NodeId,
        parent_id: Option<NodeId>,
    },

    /// A node is flagged as a guest but lacks its vmid
    IncompleteGuest { node_id: NodeId },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::GuestInDirectPoller { node_id } => {
                write!(f, "node {} is a guest and must be polled through its host", node_id)
            }
            CoreError::ForeignChild {
                node_id,
                host_id,
                parent_id,
            } => write!(
                f,
                "node {} has parent {:?}, cannot be polled through host {}",
                node_id, parent_id, host_id
            ),
            CoreError::IncompleteGuest { node_id } => {
                write!(f, "guest node {} has no vmid", node_id)
            }
        }
    }
}

impl std::error::Error for CoreError {}
