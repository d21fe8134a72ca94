//! Node-to-node API surface and the in-process transport that carries it

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::try_join_all;
use parking_lot::RwLock;
use rk_core::{BatchCmd, BatchResponse, ClusterId, Error, FileRecord, Header, NodeId, Result};
use tracing::debug;

/// Ask a host to start (or join) a member of a raft group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartClusterRequest {
    pub cluster_id: ClusterId,
    pub node_id: NodeId,
    /// node_id -> nhid
    pub initial_members: BTreeMap<NodeId, String>,
    /// Catch up from an existing group instead of creating it
    pub join: bool,
    /// First entry proposed to a new group
    pub batch: Option<BatchCmd>,
}

/// Calls one store serves for its peers
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn start_cluster(&self, req: StartClusterRequest) -> Result<()>;

    /// Stop the local member and destroy its data
    async fn remove_data(&self, cluster_id: ClusterId, node_id: NodeId) -> Result<()>;

    /// Propose through the replica named by the header and wait for the applied result
    async fn sync_propose(&self, header: Header, batch: BatchCmd) -> Result<BatchResponse>;

    /// Linearizable read-only batch
    async fn sync_read(&self, header: Header, batch: BatchCmd) -> Result<BatchResponse>;

    /// Stage record bytes on the replica ahead of the metadata write
    async fn write_record(&self, header: Header, record: FileRecord, data: Bytes) -> Result<()>;

    /// Read `limit` bytes (0 = all) of a registered record starting at `offset`
    async fn read_record(
        &self,
        header: Header,
        record: FileRecord,
        offset: u64,
        limit: u64,
    ) -> Result<Bytes>;
}

/// Resolves an rpc address to a client
pub trait Transport: Send + Sync {
    fn client(&self, rpc_address: &str) -> Result<Arc<dyn ApiClient>>;
}

/// A peer replica together with the header addressing it
#[derive(Clone)]
pub struct PeerHeader {
    pub client: Arc<dyn ApiClient>,
    pub header: Header,
}

/// Stage the same bytes on every peer; fails if any peer fails
pub async fn multi_write(peers: &[PeerHeader], record: &FileRecord, data: Bytes) -> Result<()> {
    try_join_all(peers.iter().map(|peer| {
        peer.client
            .write_record(peer.header, record.clone(), data.clone())
    }))
    .await?;
    Ok(())
}

/// In-process transport: rpc address -> store
#[derive(Default)]
pub struct LocalTransport {
    endpoints: RwLock<HashMap<String, Weak<dyn ApiClient>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, rpc_address: impl Into<String>, client: Weak<dyn ApiClient>) {
        let rpc_address = rpc_address.into();
        debug!("transport: serving {}", rpc_address);
        self.endpoints.write().insert(rpc_address, client);
    }

    pub fn unregister(&self, rpc_address: &str) {
        self.endpoints.write().remove(rpc_address);
    }
}

impl Transport for LocalTransport {
    fn client(&self, rpc_address: &str) -> Result<Arc<dyn ApiClient>> {
        self.endpoints
            .read()
            .get(rpc_address)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Unavailable(format!("no endpoint at {}", rpc_address)))
    }
}
