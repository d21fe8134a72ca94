use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::RaftError;
use crate::types::{ClusterId, Nhid, NodeId};

// === Cluster Configuration ===
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub epoch: u64, // Configuration version number
    pub voters: BTreeMap<NodeId, Nhid>,
}

impl ClusterConfig {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn simple(voters: BTreeMap<NodeId, Nhid>) -> Self {
        Self { epoch: 1, voters }
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.voters.contains_key(&node_id)
    }

    /// Votes required to commit
    pub fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    /// Whether the running members form a majority of the voters
    pub fn has_quorum(&self, running: &BTreeSet<NodeId>) -> bool {
        let votes = self.voters.keys().filter(|id| running.contains(id)).count();
        !self.voters.is_empty() && votes >= self.quorum()
    }

    /// Leader is the lowest running voter; stable as long as that member stays up
    pub fn leader(&self, running: &BTreeSet<NodeId>) -> Option<NodeId> {
        if !self.has_quorum(running) {
            return None;
        }
        self.voters.keys().copied().find(|id| running.contains(id))
    }

    /// Add a voter. Re-adding the same (node, host) pair is a no-op.
    pub fn add_voter(
        &mut self,
        cluster_id: ClusterId,
        node_id: NodeId,
        nhid: Nhid,
    ) -> Result<bool, RaftError> {
        match self.voters.get(&node_id) {
            Some(existing) if *existing == nhid => return Ok(false),
            Some(existing) => {
                return Err(RaftError::InvalidMembership(format!(
                    "cluster {} node {} already placed on {}",
                    cluster_id, node_id, existing
                )))
            }
            None => {}
        }
        if self.voters.values().any(|host| *host == nhid) {
            return Err(RaftError::InvalidMembership(format!(
                "cluster {} already has a member on {}",
                cluster_id, nhid
            )));
        }
        self.voters.insert(node_id, nhid);
        self.epoch += 1;
        Ok(true)
    }

    /// Remove a voter. Removing an unknown node is a no-op; removing the last voter is rejected.
    pub fn remove_voter(&mut self, cluster_id: ClusterId, node_id: NodeId) -> Result<bool, RaftError> {
        if !self.voters.contains_key(&node_id) {
            return Ok(false);
        }
        if self.voters.len() == 1 {
            return Err(RaftError::InvalidMembership(format!(
                "cannot remove the last voter of cluster {}",
                cluster_id
            )));
        }
        self.voters.remove(&node_id);
        self.epoch += 1;
        Ok(true)
    }
}
