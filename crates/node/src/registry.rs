//! Node registry
//!
//! Best-effort directory from replica to node host addresses, fed by gossip.
//! It may be briefly stale; an unresolved replica surfaces as `NodeUnknown` and the
//! caller refreshes from the gossip snapshot before giving up.

use std::collections::HashMap;

use parking_lot::RwLock;
use rk_core::{Error, NodeDescriptor, ReplicaDescriptor, Result};
use tracing::{debug, info};

use crate::gossip::{GossipSnapshot, MembershipEvent, MembershipListener};

#[derive(Default)]
pub struct NodeRegistry {
    /// nhid -> addresses
    nodes: RwLock<HashMap<String, NodeDescriptor>>,
    /// replica -> nhid
    replicas: RwLock<HashMap<ReplicaDescriptor, String>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node: NodeDescriptor) {
        debug!("registry: node {} at {}", node.nhid, node.rpc_address);
        self.nodes.write().insert(node.nhid.clone(), node);
    }

    pub fn remove_node(&self, nhid: &str) {
        if self.nodes.write().remove(nhid).is_some() {
            info!("registry: node {} left", nhid);
        }
    }

    pub fn add_replica(&self, replica: ReplicaDescriptor, nhid: impl Into<String>) {
        self.replicas.write().insert(replica, nhid.into());
    }

    pub fn remove_replica(&self, replica: &ReplicaDescriptor) {
        self.replicas.write().remove(replica);
    }

    pub fn nhid_of(&self, replica: &ReplicaDescriptor) -> Option<String> {
        self.replicas.read().get(replica).cloned()
    }

    pub fn node(&self, nhid: &str) -> Option<NodeDescriptor> {
        self.nodes.read().get(nhid).cloned()
    }

    /// Addresses (raft and rpc) of the host running `replica`
    pub fn resolve(&self, replica: &ReplicaDescriptor) -> Result<NodeDescriptor> {
        self.nhid_of(replica)
            .and_then(|nhid| self.node(&nhid))
            .ok_or(Error::NodeUnknown {
                cluster_id: replica.cluster_id,
                node_id: replica.node_id,
            })
    }

    /// Snapshot of known hosts, sorted by nhid
    pub fn nodes(&self) -> Vec<NodeDescriptor> {
        let mut nodes: Vec<_> = self.nodes.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.nhid.cmp(&b.nhid));
        nodes
    }

    /// Merge entries from a gossip snapshot
    pub fn refresh(&self, snapshot: &GossipSnapshot) {
        {
            let mut nodes = self.nodes.write();
            for (nhid, node) in &snapshot.nodes {
                nodes.insert(nhid.clone(), node.clone());
            }
        }
        let mut replicas = self.replicas.write();
        for (replica, nhid) in &snapshot.replicas {
            replicas.insert(*replica, nhid.clone());
        }
    }

    pub fn on_membership_change(&self, event: &MembershipEvent) {
        match event {
            MembershipEvent::NodeJoined(node) => self.add_node(node.clone()),
            MembershipEvent::NodeLeft { nhid } => self.remove_node(nhid),
            MembershipEvent::ReplicaPlaced { replica, nhid } => {
                self.add_replica(*replica, nhid.clone())
            }
            MembershipEvent::ReplicaRemoved { replica } => self.remove_replica(replica),
            MembershipEvent::RangeChanged(_) => {}
        }
    }
}

impl MembershipListener for NodeRegistry {
    fn on_event(&self, event: &MembershipEvent) {
        self.on_membership_change(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(nhid: &str) -> NodeDescriptor {
        NodeDescriptor {
            nhid: nhid.to_string(),
            raft_address: format!("{}:1", nhid),
            rpc_address: format!("{}:2", nhid),
        }
    }

    #[test]
    fn test_resolve() {
        let registry = NodeRegistry::new();
        let replica = ReplicaDescriptor::new(1, 2);
        assert_eq!(
            registry.resolve(&replica),
            Err(Error::NodeUnknown {
                cluster_id: 1,
                node_id: 2
            })
        );

        registry.add_replica(replica, "nh2");
        // Placement alone is not enough without addresses
        assert!(registry.resolve(&replica).is_err());

        registry.add_node(node("nh2"));
        assert_eq!(registry.resolve(&replica).unwrap().rpc_address, "nh2:2");

        registry.remove_node("nh2");
        assert!(registry.resolve(&replica).is_err());
    }

    #[test]
    fn test_events_and_refresh() {
        let registry = NodeRegistry::new();
        registry.on_event(&MembershipEvent::NodeJoined(node("a")));
        registry.on_event(&MembershipEvent::ReplicaPlaced {
            replica: ReplicaDescriptor::new(3, 1),
            nhid: "a".to_string(),
        });
        assert!(registry.resolve(&ReplicaDescriptor::new(3, 1)).is_ok());
        registry.on_event(&MembershipEvent::ReplicaRemoved {
            replica: ReplicaDescriptor::new(3, 1),
        });
        assert!(registry.resolve(&ReplicaDescriptor::new(3, 1)).is_err());

        let mut snapshot = GossipSnapshot::default();
        snapshot.nodes.insert("b".to_string(), node("b"));
        snapshot
            .replicas
            .insert(ReplicaDescriptor::new(4, 4), "b".to_string());
        registry.refresh(&snapshot);
        assert_eq!(registry.nodes().len(), 2);
        assert_eq!(
            registry.resolve(&ReplicaDescriptor::new(4, 4)).unwrap().nhid,
            "b"
        );
    }
}
