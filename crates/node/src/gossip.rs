//! In-process membership feed
//!
//! Every node host joins one [`GossipNetwork`] through its own [`GossipManager`].
//! Events are applied to the network's shared state and then delivered to every
//! listener of every live manager. A listener added late first receives a replay of
//! the current state, so it converges without having seen the original events.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rk_core::{NodeDescriptor, RangeDescriptor, ReplicaDescriptor};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    NodeJoined(NodeDescriptor),
    NodeLeft { nhid: String },
    ReplicaPlaced {
        replica: ReplicaDescriptor,
        nhid: String,
    },
    ReplicaRemoved { replica: ReplicaDescriptor },
    RangeChanged(RangeDescriptor),
}

/// Receives membership events
pub trait MembershipListener: Send + Sync {
    fn on_event(&self, event: &MembershipEvent);
}

/// Point-in-time view of the gossiped state
#[derive(Debug, Clone, Default)]
pub struct GossipSnapshot {
    pub nodes: BTreeMap<String, NodeDescriptor>,
    pub replicas: BTreeMap<ReplicaDescriptor, String>,
    pub ranges: BTreeMap<u64, RangeDescriptor>,
}

impl GossipSnapshot {
    fn apply(&mut self, event: &MembershipEvent) {
        match event {
            MembershipEvent::NodeJoined(node) => {
                self.nodes.insert(node.nhid.clone(), node.clone());
            }
            MembershipEvent::NodeLeft { nhid } => {
                self.nodes.remove(nhid);
            }
            MembershipEvent::ReplicaPlaced { replica, nhid } => {
                self.replicas.insert(*replica, nhid.clone());
            }
            MembershipEvent::ReplicaRemoved { replica } => {
                self.replicas.remove(replica);
            }
            MembershipEvent::RangeChanged(rd) => {
                let newer = self
                    .ranges
                    .get(&rd.range_id)
                    .map_or(true, |known| known.generation <= rd.generation);
                if newer {
                    self.ranges.insert(rd.range_id, rd.clone());
                }
            }
        }
    }

    /// Events that rebuild this state from scratch
    pub fn events(&self) -> Vec<MembershipEvent> {
        let nodes = self.nodes.values().cloned().map(MembershipEvent::NodeJoined);
        let replicas = self
            .replicas
            .iter()
            .map(|(replica, nhid)| MembershipEvent::ReplicaPlaced {
                replica: *replica,
                nhid: nhid.clone(),
            });
        let ranges = self.ranges.values().cloned().map(MembershipEvent::RangeChanged);
        nodes.chain(replicas).chain(ranges).collect()
    }
}

#[derive(Default)]
struct NetworkInner {
    state: RwLock<GossipSnapshot>,
    members: RwLock<HashMap<String, Weak<GossipManager>>>,
}

/// Shared broadcast domain
#[derive(Clone, Default)]
pub struct GossipNetwork {
    inner: Arc<NetworkInner>,
}

impl GossipNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a manager for `nhid`
    pub fn join(&self, nhid: impl Into<String>) -> Arc<GossipManager> {
        let nhid = nhid.into();
        let manager = Arc::new(GossipManager {
            nhid: nhid.clone(),
            network: self.clone(),
            listeners: RwLock::new(Vec::new()),
        });
        self.inner
            .members
            .write()
            .insert(nhid, Arc::downgrade(&manager));
        manager
    }

    pub fn snapshot(&self) -> GossipSnapshot {
        self.inner.state.read().clone()
    }

    fn publish(&self, event: MembershipEvent) {
        self.inner.state.write().apply(&event);
        let managers: Vec<Arc<GossipManager>> = {
            let mut members = self.inner.members.write();
            members.retain(|_, m| m.strong_count() > 0);
            members.values().filter_map(Weak::upgrade).collect()
        };
        for manager in managers {
            manager.deliver(&event);
        }
    }

    fn detach(&self, nhid: &str) {
        self.inner.members.write().remove(nhid);
    }
}

/// One host's handle on the network
pub struct GossipManager {
    nhid: String,
    network: GossipNetwork,
    listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,
}

impl GossipManager {
    pub fn nhid(&self) -> &str {
        &self.nhid
    }

    /// Register a listener and replay the current state to it
    pub fn add_listener(&self, listener: Arc<dyn MembershipListener>) {
        for event in self.network.snapshot().events() {
            listener.on_event(&event);
        }
        self.listeners.write().push(listener);
    }

    pub fn broadcast(&self, event: MembershipEvent) {
        debug!("{} gossips {:?}", self.nhid, event);
        self.network.publish(event);
    }

    pub fn snapshot(&self) -> GossipSnapshot {
        self.network.snapshot()
    }

    /// Announce departure and stop receiving events
    pub fn leave(&self) {
        self.network.detach(&self.nhid);
        self.network.publish(MembershipEvent::NodeLeft {
            nhid: self.nhid.clone(),
        });
        self.listeners.write().clear();
    }

    fn deliver(&self, event: &MembershipEvent) {
        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in listeners {
            listener.on_event(event);
        }
    }
}
