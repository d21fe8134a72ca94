//! Store
//!
//! One per node host. Owns the local replicas and the in-memory range table derived
//! from their applied descriptors, serves the node API for peers, and drives the
//! administrative operations: starting groups, adding and removing members, and
//! splitting a range into two independent groups.
//!
//! Split protocol for a range R = [L, Rt):
//! 1. take R's lock token and verify the caller's generation
//! 2. pick the median stored key S (> L, never below the unsplittable prefix)
//! 3. freeze R at S so no write lands in [S, Rt) from here on
//! 4. copy [S, Rt) and allocate the new cluster, range and node ids from the meta range
//! 5. start the new group on the same hosts, seeded with the right descriptor and data
//! 6. commit [L, S) on R's group, dropping [S, Rt) and releasing the freeze
//! 7. write both meta entries (inside step 6 when R is the meta range)
//!
//! Any failure before step 6 unfreezes R. Both halves are published right after
//! step 6; a failed step 7 is retried in the background with conditional writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use raft::{Consensus, RaftError, StateMachine};
use rk_core::command::decode_outcome;
use rk_core::keys::{self, printable};
use rk_core::{
    BatchBuilder, BatchCmd, BatchResponse, ClusterId, Error, FileRecord, Header, NodeDescriptor,
    NodeId, RangeDescriptor, RangeReplica, ReplicaDescriptor, Request, Result,
};
use storage::{EngineFactory, EngineId, StoreError};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::gossip::{GossipManager, GossipNetwork, MembershipEvent};
use crate::rangecache::RangeCache;
use crate::registry::NodeRegistry;
use crate::replica::{RangeTracker, Replica};
use crate::sender::Sender;
use crate::transport::{ApiClient, LocalTransport, StartClusterRequest, Transport};

/// Time-bounded lock on one range's administrative operations
struct Lease {
    token: u64,
    expires: Instant,
}

/// Releases the lease on drop
struct LeaseGuard<'a> {
    store: &'a Store,
    range_id: u64,
    token: u64,
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        self.store.release_lease(self.range_id, self.token);
    }
}

/// Shared collaborators of a store
#[derive(Clone)]
pub struct StoreDeps {
    pub consensus: Arc<dyn Consensus>,
    pub engines: Arc<dyn EngineFactory>,
    pub transport: Arc<LocalTransport>,
    pub gossip: GossipNetwork,
}

pub struct Store {
    config: Config,
    node: NodeDescriptor,
    consensus: Arc<dyn Consensus>,
    engines: Arc<dyn EngineFactory>,
    transport: Arc<LocalTransport>,
    gossip: Arc<GossipManager>,
    registry: Arc<NodeRegistry>,
    cache: Arc<RangeCache>,
    sender: Sender,
    /// cluster_id -> local replica
    replicas: RwLock<HashMap<ClusterId, Arc<Replica>>>,
    /// cluster_id -> descriptor served by the local replica
    ranges: RwLock<HashMap<ClusterId, RangeDescriptor>>,
    leases: Mutex<HashMap<u64, Lease>>,
    this: Weak<Store>,
}

impl Store {
    pub fn new(config: Config, deps: StoreDeps) -> Arc<Self> {
        let node = NodeDescriptor {
            nhid: config.node.nhid.clone(),
            raft_address: config.node.raft_address.clone(),
            rpc_address: config.node.rpc_address.clone(),
        };
        let gossip = deps.gossip.join(node.nhid.clone());
        let registry = Arc::new(NodeRegistry::new());
        let cache = Arc::new(RangeCache::new());
        let transport: Arc<dyn Transport> = deps.transport.clone();
        let sender = Sender::new(
            config.sender.clone(),
            registry.clone(),
            cache.clone(),
            transport,
            gossip.clone(),
        );
        Arc::new_cyclic(|this| Store {
            config,
            node,
            consensus: deps.consensus,
            engines: deps.engines,
            transport: deps.transport,
            gossip,
            registry,
            cache,
            sender,
            replicas: RwLock::new(HashMap::new()),
            ranges: RwLock::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    pub fn nhid(&self) -> &str {
        &self.node.nhid
    }

    pub fn node(&self) -> &NodeDescriptor {
        &self.node
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn range_cache(&self) -> &Arc<RangeCache> {
        &self.cache
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Join the fleet and reopen every replica retained for this host
    pub async fn start(&self) -> Result<()> {
        let endpoint: Weak<dyn ApiClient> = self.this.clone();
        self.transport.register(&self.node.rpc_address, endpoint);
        self.gossip.add_listener(self.registry.clone());
        self.gossip.add_listener(self.cache.clone());
        self.registry.add_node(self.node.clone());
        self.gossip
            .broadcast(MembershipEvent::NodeJoined(self.node.clone()));

        for id in self.engines.list(&self.node.nhid) {
            if self.consensus.has_cluster(id.cluster_id) {
                continue;
            }
            match self
                .start_replica(id.cluster_id, id.node_id, BTreeMap::new(), false)
                .await
            {
                Ok(replica) => debug!(
                    "{}: reopened c{}n{} at index {}",
                    self.node.nhid,
                    id.cluster_id,
                    id.node_id,
                    replica.applied_index()
                ),
                Err(e) => warn!("{}: cannot reopen {}: {}", self.node.nhid, id, e),
            }
        }
        info!(
            "store {} started with {} replicas",
            self.node.nhid,
            self.replicas.read().len()
        );
        Ok(())
    }

    /// Stop every local replica and leave the fleet. Engines are retained.
    pub async fn stop(&self) {
        let clusters: Vec<ClusterId> = self.replicas.read().keys().copied().collect();
        for cluster_id in clusters {
            if let Err(e) = self.consensus.stop_cluster(cluster_id).await {
                debug!("{}: stop cluster {}: {}", self.node.nhid, cluster_id, e);
            }
        }
        self.replicas.write().clear();
        self.ranges.write().clear();
        self.transport.unregister(&self.node.rpc_address);
        self.gossip.broadcast(MembershipEvent::NodeLeft {
            nhid: self.node.nhid.clone(),
        });
        self.gossip.leave();
        info!("store {} stopped", self.node.nhid);
    }

    fn engine_id(&self, cluster_id: ClusterId, node_id: NodeId) -> EngineId {
        EngineId {
            nhid: self.node.nhid.clone(),
            cluster_id,
            node_id,
        }
    }

    /// Open the engine, start the member and record the placement
    async fn start_replica(
        &self,
        cluster_id: ClusterId,
        node_id: NodeId,
        initial_members: BTreeMap<NodeId, String>,
        join: bool,
    ) -> Result<Arc<Replica>> {
        let engine = self.engines.open(&self.engine_id(cluster_id, node_id))?;
        let tracker: Weak<dyn RangeTracker> = self.this.clone();
        let replica = Arc::new(Replica::new(cluster_id, node_id, engine, Some(tracker)));
        self.consensus
            .start_cluster(cluster_id, node_id, initial_members, join, replica.clone())
            .await?;

        self.replicas.write().insert(cluster_id, replica.clone());
        let placed = ReplicaDescriptor::new(cluster_id, node_id);
        self.registry.add_replica(placed, self.node.nhid.clone());
        self.gossip.broadcast(MembershipEvent::ReplicaPlaced {
            replica: placed,
            nhid: self.node.nhid.clone(),
        });
        Ok(replica)
    }

    /// Make a descriptor discoverable fleet-wide
    fn publish(&self, rd: &RangeDescriptor) {
        self.cache.update(rd.clone());
        self.gossip
            .broadcast(MembershipEvent::RangeChanged(rd.clone()));
    }

    // ------------------------------------------------------------------
    // Range table
    // ------------------------------------------------------------------

    pub fn add_range(&self, rd: RangeDescriptor) {
        let Some(cluster_id) = rd.cluster_id() else {
            warn!("{}: ignoring range without replicas: {}", self.node.nhid, rd);
            return;
        };
        debug!("{}: range table add {}", self.node.nhid, rd);
        self.ranges.write().insert(cluster_id, rd);
    }

    pub fn remove_range(&self, rd: &RangeDescriptor) {
        if let Some(cluster_id) = rd.cluster_id() {
            let mut ranges = self.ranges.write();
            if ranges.get(&cluster_id).map(|r| r.range_id) == Some(rd.range_id) {
                ranges.remove(&cluster_id);
            }
        }
    }

    /// Descriptor served by the local member of `cluster_id`
    pub fn get_range(&self, cluster_id: ClusterId) -> Option<RangeDescriptor> {
        self.ranges.read().get(&cluster_id).cloned()
    }

    pub fn get_replica(&self, cluster_id: ClusterId) -> Result<Arc<Replica>> {
        self.replicas
            .read()
            .get(&cluster_id)
            .cloned()
            .ok_or_else(|| {
                Error::RangeNotFound(format!(
                    "cluster {} not hosted on {}",
                    cluster_id, self.node.nhid
                ))
            })
    }

    /// Local replica addressed by a request header
    fn replica_for(&self, header: &Header) -> Result<Arc<Replica>> {
        let replica = self.get_replica(header.replica.cluster_id)?;
        if replica.node_id() != header.replica.node_id {
            return Err(Error::RangeNotFound(format!(
                "c{}n{} not hosted on {}",
                header.replica.cluster_id, header.replica.node_id, self.node.nhid
            )));
        }
        Ok(replica)
    }

    /// Every local replica with the range it serves, ordered by key
    pub fn list_cluster(&self) -> Vec<RangeReplica> {
        let mut out: Vec<RangeReplica> = self
            .replicas
            .read()
            .values()
            .filter_map(|replica| {
                replica.descriptor().map(|range| RangeReplica {
                    range,
                    replica: replica.replica_descriptor(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.range.span_cmp(&b.range));
        out
    }

    // ------------------------------------------------------------------
    // Consensus helpers
    // ------------------------------------------------------------------

    async fn propose_local(&self, cluster_id: ClusterId, batch: &BatchCmd) -> Result<BatchResponse> {
        let out = self
            .consensus
            .propose(
                cluster_id,
                Bytes::from(batch.encode()?),
                self.config.raft.propose_timeout(),
            )
            .await?;
        decode_outcome(&out)
    }

    /// Current local descriptor of `rd`'s group, checked against the caller's generation
    fn current_descriptor(&self, rd: &RangeDescriptor) -> Result<(Arc<Replica>, RangeDescriptor)> {
        let cluster_id = rd
            .cluster_id()
            .ok_or_else(|| Error::InvalidArgument(format!("{} has no replicas", rd)))?;
        let replica = self.get_replica(cluster_id)?;
        let current = replica
            .descriptor()
            .ok_or_else(|| Error::RangeNotFound(format!("cluster {} uninitialized", cluster_id)))?;
        if current.range_id != rd.range_id {
            return Err(Error::RangeNotFound(format!(
                "cluster {} serves range {}, not {}",
                cluster_id, current.range_id, rd.range_id
            )));
        }
        if current.generation != rd.generation {
            return Err(Error::RangeGenerationMismatch {
                range_id: rd.range_id,
                requested: rd.generation,
                current: current.generation,
            });
        }
        Ok((replica, current))
    }

    fn acquire_lease(&self, range_id: u64) -> Result<LeaseGuard<'_>> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if let Some(lease) = leases.get(&range_id) {
            if lease.expires > now {
                return Err(Error::RangeBusy { range_id });
            }
            warn!(
                "{}: lease {} on range {} expired",
                self.node.nhid, lease.token, range_id
            );
        }
        let token = rand::random::<u64>();
        leases.insert(
            range_id,
            Lease {
                token,
                expires: now + self.config.split.lease_timeout(),
            },
        );
        Ok(LeaseGuard {
            store: self,
            range_id,
            token,
        })
    }

    fn release_lease(&self, range_id: u64, token: u64) {
        let mut leases = self.leases.lock();
        if leases.get(&range_id).map(|l| l.token) == Some(token) {
            leases.remove(&range_id);
        }
    }

    /// Persist `updated` on its own group and in the meta range
    async fn commit_descriptor(
        &self,
        replica: &Replica,
        current: &RangeDescriptor,
        updated: &RangeDescriptor,
    ) -> Result<()> {
        let header = Header::new(current, replica.replica_descriptor());
        let mut builder = BatchBuilder::new()
            .set_header(header)
            .add(Request::UpdateDescriptor {
                descriptor: updated.clone(),
            });
        if current.is_meta_range() {
            builder = builder.add(Request::direct_write(
                keys::range_meta_key(&updated.right),
                updated.encode()?,
            ));
        }
        self.propose_local(replica.cluster_id(), &builder.build())
            .await?;
        if !current.is_meta_range() {
            self.write_meta(&[updated]).await?;
        }
        Ok(())
    }

    async fn write_meta(&self, descriptors: &[&RangeDescriptor]) -> Result<()> {
        let Some(first) = descriptors.first() else {
            return Ok(());
        };
        let mut builder = BatchBuilder::new();
        for rd in descriptors {
            builder = builder.add(Request::direct_write(
                keys::range_meta_key(&rd.right),
                rd.encode()?,
            ));
        }
        self.sender
            .sync_propose(&keys::range_meta_key(&first.right), builder.build())
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Voters of `cluster_id` as seen by consensus
    pub async fn get_cluster_membership(
        &self,
        cluster_id: ClusterId,
    ) -> Result<Vec<ReplicaDescriptor>> {
        let membership = self.consensus.membership(cluster_id).await?;
        Ok(membership
            .voters
            .keys()
            .map(|node_id| ReplicaDescriptor::new(cluster_id, *node_id))
            .collect())
    }

    /// Add a member on `node`. Returns the updated descriptor.
    pub async fn add_cluster_node(
        &self,
        rd: &RangeDescriptor,
        node: &NodeDescriptor,
    ) -> Result<RangeDescriptor> {
        let _lease = self.acquire_lease(rd.range_id)?;
        let (replica, current) = self.current_descriptor(rd)?;
        let cluster_id = replica.cluster_id();

        // A voter already placed on the host is left over from an earlier attempt
        let membership = self.consensus.membership(cluster_id).await?;
        let existing = membership
            .voters
            .iter()
            .find(|(_, nhid)| **nhid == node.nhid)
            .map(|(node_id, _)| *node_id);
        let node_id = match existing {
            Some(node_id) if current.replica(node_id).is_some() => {
                return Err(Error::InvalidArgument(format!(
                    "{} already hosts c{}n{}",
                    node.nhid, cluster_id, node_id
                )));
            }
            Some(node_id) => {
                info!(
                    "{}: resuming addition of c{}n{} on {}",
                    self.node.nhid, cluster_id, node_id, node.nhid
                );
                node_id
            }
            None => {
                let node_id = self.sender.increment(keys::LAST_NODE_ID_KEY, 1).await?;
                self.consensus
                    .add_voter(
                        cluster_id,
                        node_id,
                        node.nhid.clone(),
                        self.config.raft.config_change_timeout(),
                    )
                    .await?;
                info!(
                    "{}: added c{}n{} on {}",
                    self.node.nhid, cluster_id, node_id, node.nhid
                );
                node_id
            }
        };

        let client = self.transport.client(&node.rpc_address)?;
        client
            .start_cluster(StartClusterRequest {
                cluster_id,
                node_id,
                initial_members: BTreeMap::new(),
                join: true,
                batch: None,
            })
            .await?;

        let mut replicas = current.replicas.clone();
        replicas.push(ReplicaDescriptor::new(cluster_id, node_id));
        let updated = current.with_replicas(replicas);
        self.commit_descriptor(&replica, &current, &updated).await?;
        Ok(updated)
    }

    /// Remove member `node_id` and reclaim its data. Returns the updated descriptor.
    pub async fn remove_cluster_node(
        &self,
        rd: &RangeDescriptor,
        node_id: NodeId,
    ) -> Result<RangeDescriptor> {
        let _lease = self.acquire_lease(rd.range_id)?;
        let (replica, current) = self.current_descriptor(rd)?;
        let cluster_id = replica.cluster_id();
        if current.replica(node_id).is_none() {
            return Err(Error::InvalidArgument(format!(
                "node {} is not a member of {}",
                node_id, current
            )));
        }
        if node_id == replica.node_id() {
            return Err(Error::InvalidArgument(format!(
                "c{}n{} is the local replica; remove it from another member",
                cluster_id, node_id
            )));
        }
        let removed = ReplicaDescriptor::new(cluster_id, node_id);
        let host = self.registry.resolve(&removed).ok();

        self.consensus
            .remove_voter(
                cluster_id,
                node_id,
                self.config.raft.config_change_timeout(),
            )
            .await?;
        info!("{}: removed c{}n{}", self.node.nhid, cluster_id, node_id);

        let replicas = current
            .replicas
            .iter()
            .copied()
            .filter(|r| r.node_id != node_id)
            .collect();
        let updated = current.with_replicas(replicas);
        self.commit_descriptor(&replica, &current, &updated).await?;

        match host {
            Some(host) => {
                let reclaim = match self.transport.client(&host.rpc_address) {
                    Ok(client) => client.remove_data(cluster_id, node_id).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = reclaim {
                    warn!(
                        "{}: c{}n{} data on {} not reclaimed: {}",
                        self.node.nhid, cluster_id, node_id, host.nhid, e
                    );
                }
            }
            None => warn!(
                "{}: host of c{}n{} unknown, data not reclaimed",
                self.node.nhid, cluster_id, node_id
            ),
        }
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Split
    // ------------------------------------------------------------------

    /// Median stored key above both `left` and the unsplittable prefix
    fn choose_split_key(replica: &Replica, rd: &RangeDescriptor) -> Result<Vec<u8>> {
        let floor = [keys::UNSPLITTABLE_MAX_BYTE];
        let start = if rd.left.as_slice() > floor.as_slice() {
            rd.left.as_slice()
        } else {
            floor.as_slice()
        };
        let candidates: Vec<Vec<u8>> = replica
            .data_keys(start, &rd.right)?
            .into_iter()
            .filter(|k| *k > rd.left)
            .collect();
        if candidates.is_empty() {
            return Err(Error::EmptyRangeSplitRejected {
                range_id: rd.range_id,
            });
        }
        Ok(candidates[candidates.len() / 2].clone())
    }

    /// Split `rd` in two at its median key. Returns the left and right descriptors.
    pub async fn split_cluster(
        &self,
        rd: &RangeDescriptor,
    ) -> Result<(RangeDescriptor, RangeDescriptor)> {
        let _lease = self.acquire_lease(rd.range_id)?;
        let (replica, _) = self.current_descriptor(rd)?;
        let cluster_id = replica.cluster_id();

        // Catch up with the group before looking at local data
        self.consensus
            .read_index(cluster_id, self.config.raft.read_timeout())
            .await?;
        let (replica, current) = self.current_descriptor(rd)?;
        let split_key = Self::choose_split_key(&replica, &current)?;
        let header = Header::new(&current, replica.replica_descriptor());
        info!(
            "{}: splitting {} at {}",
            self.node.nhid,
            current,
            printable(&split_key)
        );

        let freeze = BatchBuilder::new()
            .set_header(header)
            .add(Request::FreezeRange {
                split_key: split_key.clone(),
            })
            .build();
        self.propose_local(cluster_id, &freeze).await?;

        let (left, right) = match self
            .split_frozen(&replica, &current, header, &split_key)
            .await
        {
            Ok(halves) => halves,
            Err(e) => {
                warn!(
                    "{}: split of {} failed, unfreezing: {}",
                    self.node.nhid, current, e
                );
                let unfreeze = BatchBuilder::new()
                    .set_header(header)
                    .add(Request::UnfreezeRange)
                    .build();
                if let Err(unfreeze_err) = self.propose_local(cluster_id, &unfreeze).await {
                    error!(
                        "{}: range {} left frozen: {}",
                        self.node.nhid, current.range_id, unfreeze_err
                    );
                }
                return Err(e);
            }
        };

        // Both halves are routable from here even if the meta write lags
        self.publish(&left);
        self.publish(&right);
        if !current.is_meta_range() {
            if let Err(e) = self.write_meta(&[&left, &right]).await {
                warn!(
                    "{}: meta entries for split of {} deferred: {}",
                    self.node.nhid, current, e
                );
                self.spawn_meta_repair(vec![left.clone(), right.clone()]);
            }
        }
        info!("{}: split {} into {} and {}", self.node.nhid, current, left, right);
        Ok((left, right))
    }

    /// Keep writing `descriptors` into the meta range until it holds them or newer
    fn spawn_meta_repair(&self, descriptors: Vec<RangeDescriptor>) {
        let this = self.this.clone();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                let Some(store) = this.upgrade() else {
                    return;
                };
                match store.repair_meta(&descriptors).await {
                    Ok(()) => {
                        info!("{}: meta entries repaired", store.node.nhid);
                        return;
                    }
                    Err(e) => debug!(
                        "{}: meta repair attempt {} failed: {}",
                        store.node.nhid, attempt, e
                    ),
                }
                let backoff = store.config.sender.backoff(attempt);
                drop(store);
                tokio::time::sleep(backoff).await;
                attempt = attempt.saturating_add(1);
            }
        });
    }

    /// Conditional meta writes that never replace a newer generation
    async fn repair_meta(&self, descriptors: &[RangeDescriptor]) -> Result<()> {
        for rd in descriptors {
            let key = keys::range_meta_key(&rd.right);
            let existing = self.sender.get(&key).await?;
            if let Some(buf) = &existing {
                if RangeDescriptor::decode(buf)?.generation >= rd.generation {
                    continue;
                }
            }
            let batch = BatchBuilder::new()
                .add(Request::CompareAndSet {
                    key: key.clone(),
                    expected: existing,
                    value: rd.encode()?,
                })
                .build();
            self.sender.sync_propose(&key, batch).await?;
        }
        Ok(())
    }

    /// Steps after the freeze, up to and including the commit on the old group
    async fn split_frozen(
        &self,
        replica: &Replica,
        current: &RangeDescriptor,
        header: Header,
        split_key: &[u8],
    ) -> Result<(RangeDescriptor, RangeDescriptor)> {
        let cluster_id = replica.cluster_id();
        self.consensus
            .read_index(cluster_id, self.config.raft.read_timeout())
            .await?;
        let data = replica.scan(&header, split_key, &current.right, 0)?;

        let n = current.replicas.len() as u64;
        let ids = BatchBuilder::new()
            .add(Request::increment(keys::LAST_CLUSTER_ID_KEY, 1))
            .add(Request::increment(keys::LAST_RANGE_ID_KEY, 1))
            .add(Request::increment(keys::LAST_NODE_ID_KEY, n))
            .build();
        let resp = self
            .sender
            .sync_propose(keys::LAST_CLUSTER_ID_KEY, ids)
            .await?;
        let new_cluster_id = resp.incremented(0)?;
        let new_range_id = resp.incremented(1)?;
        let first_node_id = resp.incremented(2)? + 1 - n;

        // Same hosts, fresh node ids in the same order
        let mut members = BTreeMap::new();
        let mut placements = Vec::with_capacity(current.replicas.len());
        for (i, old) in current.replicas.iter().enumerate() {
            let host = self.registry.resolve(old)?;
            let node_id = first_node_id + i as u64;
            members.insert(node_id, host.nhid.clone());
            placements.push((node_id, host));
        }
        let right = RangeDescriptor::new(
            new_range_id,
            split_key.to_vec(),
            current.right.clone(),
            current.generation + 1,
            members
                .keys()
                .map(|node_id| ReplicaDescriptor::new(new_cluster_id, *node_id))
                .collect(),
        );
        let left = current.with_bounds(
            current.left.clone(),
            split_key.to_vec(),
            current.generation + 1,
        );

        let mut seed = BatchBuilder::new().add(Request::direct_write(
            keys::LOCAL_RANGE_KEY,
            right.encode()?,
        ));
        for (key, value) in data {
            seed = seed.add(Request::DirectWrite { key, value });
        }
        let seed = seed.build();
        for (node_id, host) in &placements {
            let client = self.transport.client(&host.rpc_address)?;
            client
                .start_cluster(StartClusterRequest {
                    cluster_id: new_cluster_id,
                    node_id: *node_id,
                    initial_members: members.clone(),
                    join: false,
                    batch: Some(seed.clone()),
                })
                .await?;
        }

        let mut commit = BatchBuilder::new()
            .set_header(header)
            .add(Request::SplitCommit {
                left: left.clone(),
                right: right.clone(),
            });
        if current.is_meta_range() {
            commit = commit
                .add(Request::direct_write(
                    keys::range_meta_key(&left.right),
                    left.encode()?,
                ))
                .add(Request::direct_write(
                    keys::range_meta_key(&right.right),
                    right.encode()?,
                ));
        }
        if let Err(e) = self.propose_local(cluster_id, &commit.build()).await {
            warn!(
                "{}: cluster {} orphaned by failed split commit",
                self.node.nhid, new_cluster_id
            );
            return Err(e);
        }
        Ok((left, right))
    }
}

impl RangeTracker for Store {
    fn on_range_changed(
        &self,
        replica: ReplicaDescriptor,
        previous: Option<RangeDescriptor>,
        current: RangeDescriptor,
    ) {
        debug!(
            "{}: c{}n{} descriptor {}",
            self.node.nhid, replica.cluster_id, replica.node_id, current
        );
        if let Some(previous) = &previous {
            if previous.range_id != current.range_id {
                self.remove_range(previous);
            }
        }
        self.add_range(current.clone());
        // A brand new range is published by whoever created it
        if previous.is_some() {
            self.publish(&current);
        }
    }
}

#[async_trait]
impl ApiClient for Store {
    async fn start_cluster(&self, req: StartClusterRequest) -> Result<()> {
        if self.consensus.has_cluster(req.cluster_id) {
            debug!(
                "{}: cluster {} already running",
                self.node.nhid, req.cluster_id
            );
            return Ok(());
        }
        let proposer = req.initial_members.keys().next_back().copied();
        let replica = self
            .start_replica(
                req.cluster_id,
                req.node_id,
                req.initial_members,
                req.join,
            )
            .await?;

        let Some(batch) = req.batch else {
            return Ok(());
        };
        if req.join || proposer != Some(req.node_id) {
            return Ok(());
        }
        if replica.applied_index() > 0 {
            debug!(
                "{}: cluster {} already initialized",
                self.node.nhid, req.cluster_id
            );
            return Ok(());
        }
        self.propose_local(req.cluster_id, &batch).await?;
        if let Some(rd) = replica.descriptor() {
            info!("{}: initialized {}", self.node.nhid, rd);
            // A split's right half stays unrouted until the commit on the old group
            if rd.is_meta_range() {
                self.publish(&rd);
            }
        }
        Ok(())
    }

    async fn remove_data(&self, cluster_id: ClusterId, node_id: NodeId) -> Result<()> {
        let replica = {
            let mut replicas = self.replicas.write();
            match replicas.get(&cluster_id) {
                Some(replica) if replica.node_id() == node_id => replicas.remove(&cluster_id),
                _ => None,
            }
        };
        if let Some(replica) = &replica {
            replica.mark_removed();
            if let Some(rd) = replica.descriptor() {
                self.remove_range(&rd);
            }
        }
        match self.consensus.stop_cluster(cluster_id).await {
            Ok(()) | Err(RaftError::ClusterNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        match self.engines.destroy(&self.engine_id(cluster_id, node_id)) {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let removed = ReplicaDescriptor::new(cluster_id, node_id);
        self.registry.remove_replica(&removed);
        self.gossip
            .broadcast(MembershipEvent::ReplicaRemoved { replica: removed });
        info!(
            "{}: removed data of c{}n{}",
            self.node.nhid, cluster_id, node_id
        );
        Ok(())
    }

    async fn sync_propose(&self, header: Header, batch: BatchCmd) -> Result<BatchResponse> {
        let replica = self.replica_for(&header)?;
        let batch = batch.with_header(header);
        self.propose_local(replica.cluster_id(), &batch).await
    }

    async fn sync_read(&self, header: Header, batch: BatchCmd) -> Result<BatchResponse> {
        let replica = self.replica_for(&header)?;
        self.consensus
            .read_index(replica.cluster_id(), self.config.raft.read_timeout())
            .await?;
        replica.read_batch(&header, &batch)
    }

    async fn write_record(&self, header: Header, record: FileRecord, data: Bytes) -> Result<()> {
        let replica = self.replica_for(&header)?;
        let mut writer = replica.record_writer(&header, &record)?;
        writer.write(&data);
        writer.close()
    }

    async fn read_record(
        &self,
        header: Header,
        record: FileRecord,
        offset: u64,
        limit: u64,
    ) -> Result<Bytes> {
        let replica = self.replica_for(&header)?;
        Ok(replica
            .record_reader(&header, &record, offset, limit)?
            .into_bytes())
    }
}
