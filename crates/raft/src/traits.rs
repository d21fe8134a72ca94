use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{ApplyError, RaftResult};
use crate::types::{ClusterId, Membership, Nhid, NodeId};

pub type ApplyResult<T> = Result<T, ApplyError>;

/// Per-group state machine fed by the consensus layer.
///
/// `apply` is called exactly once per committed index, in log order, and never
/// concurrently for the same group. It must be deterministic given the prior state
/// and the entry. Business-level rejections belong inside the returned bytes; an
/// `Err` means the replica can no longer be trusted.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Open local state, returning the last applied index persisted by the machine
    async fn open(&self) -> RaftResult<u64>;

    async fn apply(&self, index: u64, command: &[u8]) -> ApplyResult<Bytes>;

    fn applied_index(&self) -> u64;

    /// Serialize the state at `applied_index()`
    async fn snapshot(&self) -> RaftResult<Bytes>;

    /// Replace local state with a snapshot taken at `index`
    async fn restore(&self, index: u64, data: &[u8]) -> RaftResult<()>;

    async fn close(&self);
}

/// Multi-group consensus service as seen by one node host
#[async_trait]
pub trait Consensus: Send + Sync {
    fn nhid(&self) -> &str;

    /// Start a local member of `cluster_id`.
    ///
    /// With `join == false` the group is created from `initial_members` (or the
    /// existing configuration when restarting). With `join == true` the member must
    /// already have been added as a voter and catches up from the group.
    async fn start_cluster(
        &self,
        cluster_id: ClusterId,
        node_id: NodeId,
        initial_members: BTreeMap<NodeId, Nhid>,
        join: bool,
        state_machine: Arc<dyn StateMachine>,
    ) -> RaftResult<()>;

    /// Stop the local member; the group configuration is left untouched
    async fn stop_cluster(&self, cluster_id: ClusterId) -> RaftResult<()>;

    /// Propose a command and wait until it is committed and applied locally
    async fn propose(
        &self,
        cluster_id: ClusterId,
        command: Bytes,
        timeout: Duration,
    ) -> RaftResult<Bytes>;

    /// Confirm leadership and wait until the local member applied the read index
    async fn read_index(&self, cluster_id: ClusterId, timeout: Duration) -> RaftResult<u64>;

    async fn add_voter(
        &self,
        cluster_id: ClusterId,
        node_id: NodeId,
        nhid: Nhid,
        timeout: Duration,
    ) -> RaftResult<()>;

    async fn remove_voter(
        &self,
        cluster_id: ClusterId,
        node_id: NodeId,
        timeout: Duration,
    ) -> RaftResult<()>;

    async fn membership(&self, cluster_id: ClusterId) -> RaftResult<Membership>;

    fn has_cluster(&self, cluster_id: ClusterId) -> bool;
}
