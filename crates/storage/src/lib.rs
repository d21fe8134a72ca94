//! Ordered local key/value engine used inside each replica
//!
//! - `Engine`: point get, bounded range scan, atomic batch write
//! - `EngineFactory`: per-(host, cluster, node) engine lifecycle
//! - `memory`: BTreeMap-backed implementation

pub mod memory;
pub mod traits;

pub use memory::{MemoryEngine, MemoryEngineFactory};
pub use traits::{Engine, EngineFactory, EngineId, StoreError, StoreResult, WriteBatch, WriteOp};
