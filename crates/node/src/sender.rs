//! Request router
//!
//! Resolves the range owning a key (cache first, meta range on a miss), picks a
//! replica and runs a call against it. Stale-route failures invalidate the cached
//! descriptor and re-resolve; `NotLeader` records the disclosed leader; `NodeUnknown`
//! refreshes the registry from gossip. Attempts are bounded with exponential backoff.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use rk_core::keys::{self, printable};
use rk_core::{
    BatchBuilder, BatchCmd, BatchResponse, Error, FileRecord, Header, RangeDescriptor,
    ReplicaDescriptor, Request, Result,
};
use tracing::{debug, warn};

use crate::config::SenderConfig;
use crate::gossip::GossipManager;
use crate::registry::NodeRegistry;
use crate::rangecache::RangeCache;
use crate::transport::{multi_write, ApiClient, PeerHeader, Transport};

#[derive(Clone)]
pub struct Sender {
    config: SenderConfig,
    registry: Arc<NodeRegistry>,
    cache: Arc<RangeCache>,
    transport: Arc<dyn Transport>,
    gossip: Arc<GossipManager>,
}

impl Sender {
    pub fn new(
        config: SenderConfig,
        registry: Arc<NodeRegistry>,
        cache: Arc<RangeCache>,
        transport: Arc<dyn Transport>,
        gossip: Arc<GossipManager>,
    ) -> Self {
        Self {
            config,
            registry,
            cache,
            transport,
            gossip,
        }
    }

    pub fn cache(&self) -> &Arc<RangeCache> {
        &self.cache
    }

    /// Pull every gossiped descriptor and placement into the cache and registry
    fn refresh_from_gossip(&self) {
        let snapshot = self.gossip.snapshot();
        self.registry.refresh(&snapshot);
        for rd in snapshot.ranges.values() {
            self.cache.update(rd.clone());
        }
    }

    fn meta_range(&self) -> Result<RangeDescriptor> {
        if let Some(meta) = self.cache.meta_range() {
            return Ok(meta);
        }
        self.refresh_from_gossip();
        self.cache
            .meta_range()
            .ok_or_else(|| Error::Unavailable("meta range not yet known".to_string()))
    }

    /// Replicas of `rd`, last known leader first
    fn ordered_replicas(&self, rd: &RangeDescriptor) -> Vec<ReplicaDescriptor> {
        let mut replicas = rd.replicas.clone();
        if let Some(leader) = self.cache.leader(rd.range_id) {
            if let Some(pos) = replicas.iter().position(|r| *r == leader) {
                replicas[..=pos].rotate_right(1);
            }
        }
        replicas
    }

    fn client_for(&self, replica: &ReplicaDescriptor) -> Result<Arc<dyn ApiClient>> {
        let node = self.registry.resolve(replica)?;
        self.transport.client(&node.rpc_address)
    }

    /// Owner of `key`: cached descriptor, or a one-entry scan of the meta range
    pub async fn lookup_range(&self, key: &[u8]) -> Result<RangeDescriptor> {
        if key < [keys::MIN_BYTE].as_slice() || key >= [keys::MAX_BYTE].as_slice() {
            return Err(Error::InvalidArgument(format!(
                "{} is outside the keyspace",
                printable(key)
            )));
        }
        if let Some(rd) = self.cache.lookup(key) {
            return Ok(rd);
        }
        let meta = self.meta_range()?;
        if keys::is_unsplittable(key) {
            return Ok(meta);
        }

        let batch = BatchBuilder::new()
            .add(Request::scan(
                keys::meta_lookup_start(key),
                keys::meta_keys_end(),
                1,
            ))
            .build();
        let mut last_error = None;
        for replica in self.ordered_replicas(&meta) {
            let client = match self.client_for(&replica) {
                Ok(client) => client,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };
            match client
                .sync_read(Header::new(&meta, replica), batch.clone())
                .await
            {
                Ok(resp) => {
                    let rd = match resp.scanned(0)?.into_iter().next() {
                        Some((_, value)) => RangeDescriptor::decode(&value)?,
                        None => {
                            return Err(Error::RangeNotFound(format!(
                                "no meta entry covers {}",
                                printable(key)
                            )))
                        }
                    };
                    if !rd.contains_key(key) {
                        return Err(Error::RangeNotFound(format!(
                            "meta entry {} does not cover {}",
                            rd,
                            printable(key)
                        )));
                    }
                    // A lagging meta entry loses to a newer gossiped descriptor
                    if !self.cache.update(rd.clone()) {
                        if let Some(newer) = self.cache.lookup(key) {
                            return Ok(newer);
                        }
                    }
                    return Ok(rd);
                }
                Err(e) if e.is_stale_route() => {
                    self.cache.invalidate(meta.range_id);
                    self.refresh_from_gossip();
                    return Err(e);
                }
                Err(e) if e.is_retryable() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::Unavailable(format!("meta range {} has no replicas", meta.range_id))
        }))
    }

    /// Bookkeeping after a failed attempt against `rd`.
    /// Returns true when the next attempt should move to another replica.
    fn on_error(&self, rd: &RangeDescriptor, err: &Error) -> bool {
        match err {
            e if e.is_stale_route() => {
                self.cache.invalidate(rd.range_id);
                if rd.is_meta_range() {
                    self.refresh_from_gossip();
                }
                false
            }
            Error::NotLeader {
                cluster_id,
                leader: Some(node_id),
            } => {
                self.cache
                    .set_leader(rd.range_id, ReplicaDescriptor::new(*cluster_id, *node_id));
                false
            }
            Error::NotLeader { leader: None, .. } => {
                self.cache.clear_leader(rd.range_id);
                true
            }
            Error::NodeUnknown { .. } => {
                self.registry.refresh(&self.gossip.snapshot());
                true
            }
            Error::RangeSplitting { .. } => false,
            _ => true,
        }
    }

    fn exhausted(&self, last_error: Option<Error>) -> Error {
        Error::RoutingExhausted {
            attempts: self.config.max_attempts,
            last_error: last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string()),
        }
    }

    /// Run `f` against one replica of the range owning `key`
    pub async fn run<F, Fut, T>(&self, key: &[u8], f: F) -> Result<T>
    where
        F: Fn(Arc<dyn ApiClient>, Header) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut last_error = None;
        let mut skip = 0usize;
        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.backoff(attempt - 1)).await;
            }
            let rd = match self.lookup_range(key).await {
                Ok(rd) => rd,
                Err(e) if e.is_retryable() => {
                    debug!("lookup of {} failed: {}", printable(key), e);
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let replicas = self.ordered_replicas(&rd);
            if replicas.is_empty() {
                self.cache.invalidate(rd.range_id);
                last_error = Some(Error::RangeNotFound(format!("{} has no replicas", rd)));
                continue;
            }
            let replica = replicas[skip % replicas.len()];

            let result = match self.client_for(&replica) {
                Ok(client) => f(client, Header::new(&rd, replica)).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(value) => {
                    self.cache.set_leader(rd.range_id, replica);
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    debug!(
                        "attempt {} for {} on c{}n{} failed: {}",
                        attempt,
                        printable(key),
                        replica.cluster_id,
                        replica.node_id,
                        e
                    );
                    if self.on_error(&rd, &e) {
                        skip += 1;
                    } else {
                        skip = 0;
                    }
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        warn!(
            "routing {} exhausted after {} attempts",
            printable(key),
            self.config.max_attempts
        );
        Err(self.exhausted(last_error))
    }

    /// Run `f` once with every replica of the range owning `key`
    pub async fn run_all<F, Fut, T>(&self, key: &[u8], f: F) -> Result<T>
    where
        F: Fn(Vec<PeerHeader>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut last_error = None;
        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.backoff(attempt - 1)).await;
            }
            let rd = match self.lookup_range(key).await {
                Ok(rd) => rd,
                Err(e) if e.is_retryable() => {
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let peers: Result<Vec<PeerHeader>> = rd
                .replicas
                .iter()
                .map(|replica| {
                    Ok(PeerHeader {
                        client: self.client_for(replica)?,
                        header: Header::new(&rd, *replica),
                    })
                })
                .collect();
            let result = match peers {
                Ok(peers) => f(peers).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    debug!("fan-out attempt {} for {} failed: {}", attempt, printable(key), e);
                    self.on_error(&rd, &e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(self.exhausted(last_error))
    }

    /// Propose `batch` to the range owning `key` and wait for the applied result
    pub async fn sync_propose(&self, key: &[u8], batch: BatchCmd) -> Result<BatchResponse> {
        let batch = &batch;
        self.run(key, |client, header| {
            let batch = batch.clone();
            async move { client.sync_propose(header, batch).await }
        })
        .await
    }

    /// Linearizable read-only batch against the range owning `key`
    pub async fn sync_read(&self, key: &[u8], batch: BatchCmd) -> Result<BatchResponse> {
        let batch = &batch;
        self.run(key, |client, header| {
            let batch = batch.clone();
            async move { client.sync_read(header, batch).await }
        })
        .await
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let batch = BatchBuilder::new().add(Request::direct_read(key)).build();
        self.sync_read(key, batch).await?.value(0)
    }

    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let batch = BatchBuilder::new()
            .add(Request::direct_write(key, value))
            .build();
        self.sync_propose(key, batch).await?;
        Ok(())
    }

    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        let batch = BatchBuilder::new()
            .add(Request::DirectDelete { key: key.to_vec() })
            .build();
        self.sync_propose(key, batch).await?;
        Ok(())
    }

    /// Atomically add `delta` to a u64 counter and return the new value
    pub async fn increment(&self, key: &[u8], delta: u64) -> Result<u64> {
        let batch = BatchBuilder::new()
            .add(Request::increment(key, delta))
            .build();
        self.sync_propose(key, batch).await?.incremented(0)
    }

    /// Stage the bytes on every replica, then register the record through consensus
    pub async fn write_record(&self, record: &FileRecord, data: Bytes) -> Result<()> {
        let key = record.metadata_key()?;
        let data = &data;
        self.run_all(&key, |peers| {
            let data = data.clone();
            async move { multi_write(&peers, record, data).await }
        })
        .await?;
        let batch = BatchBuilder::new()
            .add(Request::FileWrite {
                record: record.clone(),
            })
            .build();
        self.sync_propose(&key, batch).await?;
        Ok(())
    }

    /// Read `limit` bytes (0 = all) of a registered record from `offset`
    pub async fn read_record(&self, record: &FileRecord, offset: u64, limit: u64) -> Result<Bytes> {
        let key = record.metadata_key()?;
        self.run(&key, |client, header| {
            let record = record.clone();
            async move { client.read_record(header, record, offset, limit).await }
        })
        .await
    }
}
