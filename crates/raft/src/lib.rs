//! Multi-group consensus contract
//!
//! A node host runs many independent raft groups ("clusters"). Each local member of a
//! group owns a [`StateMachine`] that receives committed commands in strict log order.
//! Callers drive groups through the [`Consensus`] trait:
//! - propose a command and wait for its applied result
//! - read-index for linearizable reads
//! - add/remove voters
//!
//! [`local`] provides an in-process implementation backed by a shared hub.

pub mod cluster_config;
pub mod error;
pub mod local;
pub mod traits;
pub mod types;

pub use cluster_config::ClusterConfig;
pub use error::{ApplyError, RaftError, RaftResult};
pub use local::{LocalRaftHub, NodeHost};
pub use traits::{ApplyResult, Consensus, StateMachine};
pub use types::{ClusterId, Command, Membership, Nhid, NodeId};
