//! Engine trait definitions

use std::sync::Arc;

use bytes::Bytes;

// ============================================================================
// Error Types
// ============================================================================

/// Engine error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Engine was closed or destroyed
    Closed,
    /// No engine exists for the given id
    NotFound(EngineId),
    /// Invalid argument
    InvalidArgument(String),
    /// Internal error
    Internal(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Closed => write!(f, "engine closed"),
            StoreError::NotFound(id) => write!(f, "engine not found: {}", id),
            StoreError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            StoreError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Batches
// ============================================================================

/// Single mutation inside a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Bytes, value: Bytes },
    Delete { key: Bytes },
    /// Delete every key in `[start, end)`
    DeleteRange { start: Bytes, end: Bytes },
}

/// Ordered set of mutations applied atomically
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> &mut Self {
        self.ops.push(WriteOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<Bytes>) -> &mut Self {
        self.ops.push(WriteOp::Delete { key: key.into() });
        self
    }

    pub fn delete_range(&mut self, start: impl Into<Bytes>, end: impl Into<Bytes>) -> &mut Self {
        self.ops.push(WriteOp::DeleteRange {
            start: start.into(),
            end: end.into(),
        });
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Sorted byte-string key/value engine
pub trait Engine: Send + Sync {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Bytes>>;

    /// Keys in `[start, end)` in ascending order.
    /// An empty `end` means unbounded; `limit == 0` means no limit.
    fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> StoreResult<Vec<(Bytes, Bytes)>>;

    /// Apply every operation of the batch or none of them
    fn write(&self, batch: &WriteBatch) -> StoreResult<()>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Identity of one replica's engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId {
    pub nhid: String,
    pub cluster_id: u64,
    pub node_id: u64,
}

impl std::fmt::Display for EngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/c{}n{}", self.nhid, self.cluster_id, self.node_id)
    }
}

/// Opens, lists and destroys replica engines of a host
pub trait EngineFactory: Send + Sync {
    /// Open (or create) the engine. Reopening returns the retained state.
    fn open(&self, id: &EngineId) -> StoreResult<Arc<dyn Engine>>;

    /// Drop the engine and its data
    fn destroy(&self, id: &EngineId) -> StoreResult<()>;

    /// Engines retained for a host, sorted
    fn list(&self, nhid: &str) -> Vec<EngineId>;
}
