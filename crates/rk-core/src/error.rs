//! Error taxonomy
//!
//! Errors are serializable: a replica encodes business rejections into the applied
//! result so every member reaches the same outcome for the same log entry.

use raft::RaftError;
use serde::{Deserialize, Serialize};
use storage::StoreError;
use thiserror::Error;

use crate::keys::printable;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Error {
    /// Caller routed with a stale descriptor
    #[error("range {range_id} generation mismatch: request {requested}, current {current}")]
    RangeGenerationMismatch {
        range_id: u64,
        requested: u64,
        current: u64,
    },

    #[error("not leader of cluster {cluster_id} (leader hint: {leader:?})")]
    NotLeader { cluster_id: u64, leader: Option<u64> },

    #[error("node {node_id} of cluster {cluster_id} cannot be resolved")]
    NodeUnknown { cluster_id: u64, node_id: u64 },

    #[error("routing exhausted after {attempts} attempts: {last_error}")]
    RoutingExhausted { attempts: u32, last_error: String },

    #[error("range {range_id} holds no splittable data")]
    EmptyRangeSplitRejected { range_id: u64 },

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("timed out")]
    Timeout,

    /// The local replica diverged; it no longer serves
    #[error("consensus apply failure: {0}")]
    ConsensusApplyFailure(String),

    #[error("range {range_id} is splitting")]
    RangeSplitting { range_id: u64 },

    #[error("key {} is outside range {range_id}", printable(.key))]
    KeyOutOfRange { key: Vec<u8>, range_id: u64 },

    /// Another administrative operation holds the range lock
    #[error("range {range_id} is busy")]
    RangeBusy { range_id: u64 },

    #[error("range not found: {0}")]
    RangeNotFound(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("condition failed: {0}")]
    ConditionFailed(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl Error {
    /// Safe to retry after re-resolving the route or backing off
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RangeGenerationMismatch { .. }
                | Error::NotLeader { .. }
                | Error::NodeUnknown { .. }
                | Error::Unavailable(_)
                | Error::Timeout
                | Error::RangeSplitting { .. }
                | Error::KeyOutOfRange { .. }
                | Error::RangeNotFound(_)
        )
    }

    /// The cached descriptor used for routing is no longer valid
    pub fn is_stale_route(&self) -> bool {
        matches!(
            self,
            Error::RangeGenerationMismatch { .. }
                | Error::KeyOutOfRange { .. }
                | Error::RangeNotFound(_)
        )
    }
}

impl From<RaftError> for Error {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::ClusterNotFound(cluster_id) => {
                Error::RangeNotFound(format!("cluster {}", cluster_id))
            }
            RaftError::NotLeader { cluster_id, leader } => Error::NotLeader { cluster_id, leader },
            RaftError::NotReady(cluster_id) => {
                Error::Unavailable(format!("cluster {} has no quorum", cluster_id))
            }
            RaftError::Timeout => Error::Timeout,
            RaftError::Apply(e) => Error::ConsensusApplyFailure(e.to_string()),
            RaftError::Closed => Error::Unavailable("node host closed".to_string()),
            e @ (RaftError::ClusterAlreadyExists(_)
            | RaftError::NodeNotMember { .. }
            | RaftError::InvalidMembership(_)) => Error::InvalidArgument(e.to_string()),
            RaftError::Snapshot(msg) => Error::Storage(msg),
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Closed => Error::Unavailable("engine closed".to_string()),
            other => Error::Storage(other.to_string()),
        }
    }
}
