//! Core range model
//!
//! Shared by every node component:
//! - Keyspace layout (local, meta and system prefixes)
//! - Range/replica/node descriptors
//! - Batch commands proposed to a range's raft group
//! - Content-addressed file records
//! - The error taxonomy carried across the apply boundary

pub mod codec;
pub mod command;
pub mod descriptor;
pub mod error;
pub mod keys;
pub mod record;

// Re-export commonly used types
pub use command::{ApplyOutcome, BatchBuilder, BatchCmd, BatchResponse, Request, Response};
pub use descriptor::{Header, NodeDescriptor, RangeDescriptor, RangeReplica, ReplicaDescriptor};
pub use error::{Error, Result};
pub use record::{Digest, FileRecord, StoredRecord};

pub use raft::{ClusterId, NodeId};
