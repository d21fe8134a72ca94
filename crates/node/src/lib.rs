//! rangekv - range-sharded, raft-replicated key/value and blob store
//!
//! The keyspace is partitioned into ranges; each range is served by its own raft
//! group. A meta range maps right boundaries to range descriptors and holds the
//! global id counters. Ranges split at their median key into independent groups.

pub mod bootstrap;
pub mod config;
pub mod gossip;
pub mod rangecache;
pub mod registry;
pub mod replica;
pub mod sender;
pub mod store;
pub mod transport;

pub use config::{Config, ConfigError};
pub use gossip::{GossipManager, GossipNetwork, MembershipEvent, MembershipListener};
pub use rangecache::RangeCache;
pub use registry::NodeRegistry;
pub use replica::{RangeTracker, RecordReader, RecordWriter, Replica, ReplicaState};
pub use sender::Sender;
pub use store::{Store, StoreDeps};
pub use transport::{ApiClient, LocalTransport, PeerHeader, StartClusterRequest, Transport};
