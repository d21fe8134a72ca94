use std::cmp::Ordering;
use std::fmt;

use raft::{ClusterId, NodeId};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{Error, Result};
use crate::keys::{self, printable};

/// One member of a range's raft group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    /// Raft group id
    pub cluster_id: ClusterId,
    /// Replica id within the group
    pub node_id: NodeId,
}

impl ReplicaDescriptor {
    pub fn new(cluster_id: ClusterId, node_id: NodeId) -> Self {
        Self {
            cluster_id,
            node_id,
        }
    }
}

/// Ownership of the key interval `[left, right)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    /// Stable identity; a split allocates a fresh id for the right half
    pub range_id: u64,
    /// Inclusive start key
    pub left: Vec<u8>,
    /// Exclusive end key
    pub right: Vec<u8>,
    /// Bumped on every membership or boundary change
    pub generation: u64,
    /// Members of the owning raft group, ordered by node id
    pub replicas: Vec<ReplicaDescriptor>,
}

impl RangeDescriptor {
    pub fn new(
        range_id: u64,
        left: Vec<u8>,
        right: Vec<u8>,
        generation: u64,
        mut replicas: Vec<ReplicaDescriptor>,
    ) -> Self {
        replicas.sort();
        Self {
            range_id,
            left,
            right,
            generation,
            replicas,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        codec::encode(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        codec::decode(data)
    }

    /// Raft group of this range
    pub fn cluster_id(&self) -> Option<ClusterId> {
        self.replicas.first().map(|r| r.cluster_id)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.left.as_slice() <= key && key < self.right.as_slice()
    }

    pub fn overlaps(&self, other: &RangeDescriptor) -> bool {
        self.left < other.right && other.left < self.right
    }

    /// The range holding meta and system keys
    pub fn is_meta_range(&self) -> bool {
        self.contains_key(&[keys::META_PREFIX])
    }

    pub fn replica(&self, node_id: NodeId) -> Option<&ReplicaDescriptor> {
        self.replicas.iter().find(|r| r.node_id == node_id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.replicas.iter().map(|r| r.node_id)
    }

    /// Copy with new boundaries and generation, same group
    pub fn with_bounds(&self, left: Vec<u8>, right: Vec<u8>, generation: u64) -> Self {
        Self {
            range_id: self.range_id,
            left,
            right,
            generation,
            replicas: self.replicas.clone(),
        }
    }

    /// Copy with a different replica set and the generation bumped
    pub fn with_replicas(&self, replicas: Vec<ReplicaDescriptor>) -> Self {
        Self::new(
            self.range_id,
            self.left.clone(),
            self.right.clone(),
            self.generation + 1,
            replicas,
        )
    }

    /// Order by `(left, right)`
    pub fn span_cmp(&self, other: &RangeDescriptor) -> Ordering {
        self.left
            .cmp(&other.left)
            .then_with(|| self.right.cmp(&other.right))
    }

    pub fn validate(&self) -> Result<()> {
        if self.left >= self.right {
            return Err(Error::InvalidArgument(format!(
                "range {} has empty span [{}, {})",
                self.range_id,
                printable(&self.left),
                printable(&self.right)
            )));
        }
        let cluster_id = self.cluster_id().ok_or_else(|| {
            Error::InvalidArgument(format!("range {} has no replicas", self.range_id))
        })?;
        if self.replicas.iter().any(|r| r.cluster_id != cluster_id) {
            return Err(Error::InvalidArgument(format!(
                "range {} spans more than one cluster",
                self.range_id
            )));
        }
        Ok(())
    }
}

impl fmt::Display for RangeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "range {} [{}, {}) gen {}",
            self.range_id,
            printable(&self.left),
            printable(&self.right),
            self.generation
        )
    }
}

/// Check that the descriptors tile `[MIN_BYTE, MAX_BYTE)` with no gap or overlap
pub fn check_partition(ranges: &[RangeDescriptor]) -> Result<()> {
    let mut sorted: Vec<&RangeDescriptor> = ranges.iter().collect();
    sorted.sort_by(|a, b| a.span_cmp(b));

    let mut expected_left = keys::min_key();
    for rd in sorted {
        rd.validate()?;
        if rd.left != expected_left {
            return Err(Error::InvalidArgument(format!(
                "{} does not start at {}",
                rd,
                printable(&expected_left)
            )));
        }
        expected_left = rd.right.clone();
    }
    if expected_left != keys::max_key() {
        return Err(Error::InvalidArgument(format!(
            "keyspace ends at {}",
            printable(&expected_left)
        )));
    }
    Ok(())
}

/// Addresses of one node host
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub nhid: String,
    pub raft_address: String,
    pub rpc_address: String,
}

/// Routing header attached to every request served by a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub range_id: u64,
    pub generation: u64,
    /// Target replica
    pub replica: ReplicaDescriptor,
}

impl Header {
    pub fn new(rd: &RangeDescriptor, replica: ReplicaDescriptor) -> Self {
        Self {
            range_id: rd.range_id,
            generation: rd.generation,
            replica,
        }
    }
}

/// A local replica and the range it serves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeReplica {
    pub range: RangeDescriptor,
    pub replica: ReplicaDescriptor,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rd(range_id: u64, left: &[u8], right: &[u8]) -> RangeDescriptor {
        RangeDescriptor::new(
            range_id,
            left.to_vec(),
            right.to_vec(),
            1,
            vec![
                ReplicaDescriptor::new(range_id, 2),
                ReplicaDescriptor::new(range_id, 1),
            ],
        )
    }

    #[test]
    fn test_contains_and_overlap() {
        let a = rd(1, &[keys::MIN_BYTE], b"m");
        let b = rd(2, b"m", &[keys::MAX_BYTE]);
        assert!(a.contains_key(b"a"));
        assert!(!a.contains_key(b"m"));
        assert!(b.contains_key(b"m"));
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&rd(3, b"l", b"n")));
        assert!(a.is_meta_range());
        assert!(!b.is_meta_range());
    }

    #[test]
    fn test_replicas_sorted_and_cluster_id() {
        let a = rd(4, b"a", b"b");
        assert_eq!(a.replicas[0].node_id, 1);
        assert_eq!(a.cluster_id(), Some(4));
        let bumped = a.with_replicas(vec![ReplicaDescriptor::new(4, 3)]);
        assert_eq!(bumped.generation, 2);
        assert_eq!(bumped.node_ids().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_encode_decode() {
        let a = rd(1, &[keys::MIN_BYTE], &[keys::MAX_BYTE]);
        let bytes = a.encode().unwrap();
        assert_eq!(RangeDescriptor::decode(&bytes).unwrap(), a);
        assert!(RangeDescriptor::decode(b"\xff\xff").is_err());
    }

    #[test]
    fn test_validate() {
        assert!(rd(1, b"b", b"a").validate().is_err());
        let mut mixed = rd(1, b"a", b"b");
        mixed.replicas.push(ReplicaDescriptor::new(9, 9));
        assert!(mixed.validate().is_err());
    }

    #[test]
    fn test_check_partition() {
        let full = vec![
            rd(2, b"m", &[keys::MAX_BYTE]),
            rd(1, &[keys::MIN_BYTE], b"m"),
        ];
        assert!(check_partition(&full).is_ok());

        let gap = vec![rd(1, &[keys::MIN_BYTE], b"k"), rd(2, b"m", &[keys::MAX_BYTE])];
        assert!(check_partition(&gap).is_err());

        let short = vec![rd(1, &[keys::MIN_BYTE], b"m")];
        assert!(check_partition(&short).is_err());
    }
}
