use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Raft group identifier, shared by all replicas of one range
pub type ClusterId = u64;

/// Replica identifier inside a raft group, unique across the fleet
pub type NodeId = u64;

/// Node host identifier (one per process)
pub type Nhid = String;

/// Opaque command payload proposed to a group
pub type Command = Bytes;

/// Live membership of one raft group as seen by the consensus layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub cluster_id: ClusterId,
    /// node_id -> node host that runs it
    pub voters: BTreeMap<NodeId, Nhid>,
    pub leader: Option<NodeId>,
    /// Bumped on every voter change
    pub config_epoch: u64,
}

impl Membership {
    pub fn len(&self) -> usize {
        self.voters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.voters.contains_key(&node_id)
    }
}
