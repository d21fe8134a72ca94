//! In-process multi-group consensus
//!
//! Every node host of a fleet is attached to one shared [`LocalRaftHub`]. A group keeps a
//! single ordered log; a proposal is appended once and applied to every running member in
//! log order while the group lock is held, so apply is strictly sequential per group.
//! The leader is the lowest running voter and proposals need a running majority.
//! Members that start late catch up from a leader snapshot followed by log replay.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cluster_config::ClusterConfig;
use crate::error::{ApplyError, RaftError, RaftResult};
use crate::traits::{Consensus, StateMachine};
use crate::types::{ClusterId, Membership, Nhid, NodeId};

/// Poll interval while waiting for a group to regain quorum
const QUORUM_RETRY_INTERVAL: Duration = Duration::from_millis(5);

struct Member {
    nhid: Nhid,
    state_machine: Arc<dyn StateMachine>,
}

#[derive(Default)]
struct GroupState {
    config: ClusterConfig,
    /// Entry `i` has log index `i + 1`
    log: Vec<Bytes>,
    members: BTreeMap<NodeId, Member>,
}

impl GroupState {
    fn running(&self) -> BTreeSet<NodeId> {
        self.members
            .keys()
            .copied()
            .filter(|id| self.config.contains(*id))
            .collect()
    }

    fn leader(&self) -> Option<NodeId> {
        self.config.leader(&self.running())
    }

    fn last_index(&self) -> u64 {
        self.log.len() as u64
    }
}

struct Group {
    cluster_id: ClusterId,
    state: Mutex<GroupState>,
}

impl Group {
    /// Lock the group once it has a leader, or fail with `NotReady` at the deadline
    async fn wait_for_leader(
        &self,
        deadline: Instant,
    ) -> RaftResult<tokio::sync::MutexGuard<'_, GroupState>> {
        loop {
            let state = self.state.lock().await;
            if state.leader().is_some() {
                return Ok(state);
            }
            drop(state);
            if Instant::now() >= deadline {
                return Err(RaftError::NotReady(self.cluster_id));
            }
            tokio::time::sleep(QUORUM_RETRY_INTERVAL).await;
        }
    }
}

/// Apply log entries up to `target` on one member, returning the result of `target`
async fn apply_through(
    cluster_id: ClusterId,
    node_id: NodeId,
    member: &Member,
    log: &[Bytes],
    target: u64,
) -> RaftResult<Option<Bytes>> {
    let mut last = None;
    let mut next = member.state_machine.applied_index() + 1;
    while next <= target {
        let entry = &log[(next - 1) as usize];
        let result = member.state_machine.apply(next, entry).await.map_err(|e| {
            error!(
                "cluster {} node {} failed to apply index {}: {}",
                cluster_id, node_id, next, e
            );
            RaftError::Apply(e)
        })?;
        if next == target {
            last = Some(result);
        }
        next += 1;
    }
    Ok(last)
}

#[derive(Default)]
struct HubInner {
    groups: RwLock<HashMap<ClusterId, Arc<Group>>>,
    /// nhid -> (cluster_id -> local node_id)
    placements: RwLock<HashMap<Nhid, HashMap<ClusterId, NodeId>>>,
}

impl HubInner {
    fn group(&self, cluster_id: ClusterId) -> RaftResult<Arc<Group>> {
        self.groups
            .read()
            .get(&cluster_id)
            .cloned()
            .ok_or(RaftError::ClusterNotFound(cluster_id))
    }

    fn group_or_create(&self, cluster_id: ClusterId) -> Arc<Group> {
        self.groups
            .write()
            .entry(cluster_id)
            .or_insert_with(|| {
                Arc::new(Group {
                    cluster_id,
                    state: Mutex::new(GroupState::default()),
                })
            })
            .clone()
    }

    fn local_node(&self, nhid: &str, cluster_id: ClusterId) -> Option<NodeId> {
        self.placements
            .read()
            .get(nhid)
            .and_then(|clusters| clusters.get(&cluster_id).copied())
    }

    fn mark_running(&self, nhid: &str, cluster_id: ClusterId, node_id: NodeId) {
        self.placements
            .write()
            .entry(nhid.to_string())
            .or_default()
            .insert(cluster_id, node_id);
    }

    fn mark_stopped(&self, nhid: &str, cluster_id: ClusterId) {
        if let Some(clusters) = self.placements.write().get_mut(nhid) {
            clusters.remove(&cluster_id);
        }
    }

    /// Drop a member from its group and stop its state machine
    async fn evict(&self, cluster_id: ClusterId, node_id: NodeId, member: Member) {
        self.mark_stopped(&member.nhid, cluster_id);
        member.state_machine.close().await;
        debug!("cluster {} node {} stopped", cluster_id, node_id);
    }

    async fn propose(
        &self,
        group: Arc<Group>,
        command: Bytes,
        deadline: Instant,
    ) -> RaftResult<Bytes> {
        loop {
            {
                let mut state = group.state.lock().await;
                if let Some(leader) = state.leader() {
                    return self.append_and_apply(&group, &mut state, leader, command).await;
                }
            }
            if Instant::now() >= deadline {
                return Err(RaftError::NotReady(group.cluster_id));
            }
            tokio::time::sleep(QUORUM_RETRY_INTERVAL).await;
        }
    }

    async fn append_and_apply(
        &self,
        group: &Group,
        state: &mut GroupState,
        leader: NodeId,
        command: Bytes,
    ) -> RaftResult<Bytes> {
        state.log.push(command);
        let index = state.last_index();

        let mut leader_result = None;
        let mut failed = Vec::new();
        {
            let GroupState { log, members, .. } = &*state;
            for (node_id, member) in members.iter() {
                match apply_through(group.cluster_id, *node_id, member, log, index).await {
                    Ok(result) if *node_id == leader => leader_result = Some(result),
                    Ok(_) => {}
                    Err(e) => failed.push((*node_id, e)),
                }
            }
        }

        let mut leader_error = None;
        for (node_id, err) in failed {
            if let Some(member) = state.members.remove(&node_id) {
                warn!(
                    "cluster {} node {} removed from service after apply failure",
                    group.cluster_id, node_id
                );
                self.evict(group.cluster_id, node_id, member).await;
            }
            if node_id == leader {
                leader_error = Some(err);
            }
        }
        if let Some(err) = leader_error {
            return Err(err);
        }

        leader_result.flatten().ok_or_else(|| {
            RaftError::Apply(ApplyError::internal_err(format!(
                "no result for index {}",
                index
            )))
        })
    }
}

/// Shared registry of all groups in one process
#[derive(Clone, Default)]
pub struct LocalRaftHub {
    inner: Arc<HubInner>,
}

impl LocalRaftHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a node host attached to this hub
    pub fn host(&self, nhid: impl Into<Nhid>) -> Arc<NodeHost> {
        Arc::new(NodeHost {
            nhid: nhid.into(),
            hub: self.inner.clone(),
            closed: AtomicBool::new(false),
        })
    }

    /// Index of the last entry in a group's log
    pub async fn last_index(&self, cluster_id: ClusterId) -> RaftResult<u64> {
        let group = self.inner.group(cluster_id)?;
        let state = group.state.lock().await;
        Ok(state.last_index())
    }

    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        let mut ids: Vec<_> = self.inner.groups.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// One process's view of the hub
pub struct NodeHost {
    nhid: Nhid,
    hub: Arc<HubInner>,
    closed: AtomicBool,
}

impl NodeHost {
    fn check_open(&self) -> RaftResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RaftError::Closed);
        }
        Ok(())
    }

    fn require_local(&self, cluster_id: ClusterId) -> RaftResult<(Arc<Group>, NodeId)> {
        self.check_open()?;
        let node_id = self
            .hub
            .local_node(&self.nhid, cluster_id)
            .ok_or(RaftError::ClusterNotFound(cluster_id))?;
        Ok((self.hub.group(cluster_id)?, node_id))
    }

    /// Clusters with a running member on this host
    pub fn local_clusters(&self) -> Vec<(ClusterId, NodeId)> {
        let mut out: Vec<_> = self
            .hub
            .placements
            .read()
            .get(&self.nhid)
            .map(|clusters| clusters.iter().map(|(c, n)| (*c, *n)).collect())
            .unwrap_or_default();
        out.sort_unstable();
        out
    }

    /// Stop every local member and refuse further requests
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for (cluster_id, _) in self.local_clusters() {
            if let Err(e) = self.stop_member(cluster_id).await {
                warn!("failed to stop cluster {} on {}: {}", cluster_id, self.nhid, e);
            }
        }
        info!("node host {} closed", self.nhid);
    }

    async fn stop_member(&self, cluster_id: ClusterId) -> RaftResult<()> {
        let node_id = self
            .hub
            .local_node(&self.nhid, cluster_id)
            .ok_or(RaftError::ClusterNotFound(cluster_id))?;
        let group = self.hub.group(cluster_id)?;
        let mut state = group.state.lock().await;
        if let Some(member) = state.members.remove(&node_id) {
            self.hub.evict(cluster_id, node_id, member).await;
        } else {
            self.hub.mark_stopped(&self.nhid, cluster_id);
        }
        Ok(())
    }
}

#[async_trait]
impl Consensus for NodeHost {
    fn nhid(&self) -> &str {
        &self.nhid
    }

    async fn start_cluster(
        &self,
        cluster_id: ClusterId,
        node_id: NodeId,
        initial_members: BTreeMap<NodeId, Nhid>,
        join: bool,
        state_machine: Arc<dyn StateMachine>,
    ) -> RaftResult<()> {
        self.check_open()?;
        if self.hub.local_node(&self.nhid, cluster_id).is_some() {
            return Err(RaftError::ClusterAlreadyExists(cluster_id));
        }

        let group = self.hub.group_or_create(cluster_id);
        let mut state = group.state.lock().await;

        if join {
            match state.config.voters.get(&node_id) {
                Some(host) if *host == self.nhid => {}
                _ => return Err(RaftError::NodeNotMember { cluster_id, node_id }),
            }
        } else if state.config.is_empty() {
            if initial_members.get(&node_id) != Some(&self.nhid) {
                return Err(RaftError::InvalidMembership(format!(
                    "initial members of cluster {} do not place node {} on {}",
                    cluster_id, node_id, self.nhid
                )));
            }
            state.config = ClusterConfig::simple(initial_members);
        } else if !state.config.contains(node_id) {
            return Err(RaftError::NodeNotMember { cluster_id, node_id });
        }

        let applied = state_machine.open().await?;
        let last_index = state.last_index();
        if applied > last_index {
            warn!(
                "cluster {} node {} applied index {} is ahead of the log ({})",
                cluster_id, node_id, applied, last_index
            );
        }

        // A fresh member restores from a donor snapshot before replaying the tail
        if applied == 0 && last_index > 0 {
            let leader = state.leader();
            let donor = leader
                .and_then(|id| state.members.get(&id))
                .or_else(|| state.members.values().next());
            if let Some(donor) = donor {
                let index = donor.state_machine.applied_index();
                if index > 0 {
                    let data = donor.state_machine.snapshot().await?;
                    state_machine.restore(index, &data).await?;
                    debug!(
                        "cluster {} node {} restored snapshot at index {} ({} bytes)",
                        cluster_id,
                        node_id,
                        index,
                        data.len()
                    );
                }
            }
        }

        let member = Member {
            nhid: self.nhid.clone(),
            state_machine,
        };
        apply_through(cluster_id, node_id, &member, &state.log, last_index).await?;

        state.members.insert(node_id, member);
        self.hub.mark_running(&self.nhid, cluster_id, node_id);
        info!(
            "cluster {} node {} started on {} (join: {}, applied: {})",
            cluster_id, node_id, self.nhid, join, last_index
        );
        Ok(())
    }

    async fn stop_cluster(&self, cluster_id: ClusterId) -> RaftResult<()> {
        self.stop_member(cluster_id).await
    }

    async fn propose(
        &self,
        cluster_id: ClusterId,
        command: Bytes,
        timeout: Duration,
    ) -> RaftResult<Bytes> {
        let (group, _) = self.require_local(cluster_id)?;
        let deadline = Instant::now() + timeout;
        let hub = self.hub.clone();
        // The proposal keeps running if the caller stops waiting
        let handle = tokio::spawn(async move { hub.propose(group, command, deadline).await });
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!("proposal task for cluster {} failed: {}", cluster_id, e);
                Err(RaftError::Closed)
            }
            Err(_) => Err(RaftError::Timeout),
        }
    }

    async fn read_index(&self, cluster_id: ClusterId, timeout: Duration) -> RaftResult<u64> {
        let (group, node_id) = self.require_local(cluster_id)?;
        let deadline = Instant::now() + timeout;
        let state = group.wait_for_leader(deadline).await?;
        let index = state.last_index();
        let member = state
            .members
            .get(&node_id)
            .ok_or(RaftError::ClusterNotFound(cluster_id))?;
        apply_through(cluster_id, node_id, member, &state.log, index).await?;
        Ok(index)
    }

    async fn add_voter(
        &self,
        cluster_id: ClusterId,
        node_id: NodeId,
        nhid: Nhid,
        timeout: Duration,
    ) -> RaftResult<()> {
        let (group, _) = self.require_local(cluster_id)?;
        let deadline = Instant::now() + timeout;
        let mut state = group.wait_for_leader(deadline).await?;
        if state.config.add_voter(cluster_id, node_id, nhid.clone())? {
            info!(
                "cluster {} added voter {} on {} (epoch {})",
                cluster_id, node_id, nhid, state.config.epoch
            );
        }
        Ok(())
    }

    async fn remove_voter(
        &self,
        cluster_id: ClusterId,
        node_id: NodeId,
        timeout: Duration,
    ) -> RaftResult<()> {
        let (group, _) = self.require_local(cluster_id)?;
        let deadline = Instant::now() + timeout;
        let mut state = group.wait_for_leader(deadline).await?;
        if state.config.remove_voter(cluster_id, node_id)? {
            info!(
                "cluster {} removed voter {} (epoch {})",
                cluster_id, node_id, state.config.epoch
            );
        }
        if let Some(member) = state.members.remove(&node_id) {
            self.hub.evict(cluster_id, node_id, member).await;
        }
        Ok(())
    }

    async fn membership(&self, cluster_id: ClusterId) -> RaftResult<Membership> {
        self.check_open()?;
        let group = self.hub.group(cluster_id)?;
        let state = group.state.lock().await;
        Ok(Membership {
            cluster_id,
            voters: state.config.voters.clone(),
            leader: state.leader(),
            config_epoch: state.config.epoch,
        })
    }

    fn has_cluster(&self, cluster_id: ClusterId) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.hub.local_node(&self.nhid, cluster_id).is_some()
    }
}
