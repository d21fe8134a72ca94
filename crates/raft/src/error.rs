use thiserror::Error;

use crate::types::{ClusterId, NodeId};

pub type RaftResult<T> = Result<T, RaftError>;

/// Errors surfaced by the consensus layer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RaftError {
    #[error("cluster {0} not found on this host")]
    ClusterNotFound(ClusterId),

    #[error("cluster {0} already running on this host")]
    ClusterAlreadyExists(ClusterId),

    #[error("cluster {0} has no quorum of running members")]
    NotReady(ClusterId),

    #[error("not leader of cluster {cluster_id}, leader hint: {leader:?}")]
    NotLeader {
        cluster_id: ClusterId,
        leader: Option<NodeId>,
    },

    #[error("node {node_id} is not a member of cluster {cluster_id}")]
    NodeNotMember { cluster_id: ClusterId, node_id: NodeId },

    #[error("invalid membership: {0}")]
    InvalidMembership(String),

    #[error("request timed out")]
    Timeout,

    #[error("apply failed: {0}")]
    Apply(#[from] ApplyError),

    #[error("snapshot failed: {0}")]
    Snapshot(String),

    #[error("node host is closed")]
    Closed,
}

impl RaftError {
    /// Transient conditions a caller may retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::NotReady(_) | RaftError::NotLeader { .. } | RaftError::Timeout
        )
    }
}

/// Fatal state machine failure: the replica diverged and must stop serving
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("invalid command at index {index}: {reason}")]
    InvalidCommand { index: u64, reason: String },

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApplyError {
    pub fn internal_err(msg: impl Into<String>) -> Self {
        ApplyError::Internal(msg.into())
    }
}
