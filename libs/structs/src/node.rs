//! Nodes, as seen through the tainted-nodes index.
//!
//! Only tainted nodes are handed to the reconciler; a node absent from the
//! index is healthy and ready.

use chrono::{DateTime, Utc};
use flotilla_id::NodeId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Ready,
    Initializing,
    Down,
    Disconnected,
    Ineligible,
}

/// A tainted-index entry for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub status: NodeStatus,
    /// Set while the node is draining its workloads.
    pub drain: bool,
    /// When the heartbeat tracker observed the current status. For a
    /// disconnected node this is the disconnect-observed-at instant.
    pub status_updated_at: DateTime<Utc>,
    /// Upper bound on how long a disconnected client keeps its
    /// allocations. `None` means the node imposes no bound of its own.
    pub max_client_disconnect: Option<Duration>,
}

impl Node {
    /// True when allocations on this node should migrate away.
    #[must_use]
    pub fn draining_or_ineligible(&self) -> bool {
        self.drain || self.status == NodeStatus::Ineligible
    }
}
