use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use raft::{ApplyError, ApplyResult, RaftError, RaftResult, StateMachine};
use serde::{Deserialize, Serialize};
use tracing::debug;

// --- Business Command Definitions ---
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
    /// Makes apply fail, to exercise the fatal path
    Poison,
}

impl KvCommand {
    pub fn encode(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).expect("Failed to serialize KvCommand"))
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SnapshotData {
    index: u64,
    data: BTreeMap<String, String>,
}

/// In-memory KV state machine; the returned bytes are the previous value of the key
#[derive(Clone, Default)]
pub struct TestStateMachine {
    pub name: String,
    data: Arc<RwLock<BTreeMap<String, String>>>,
    applied: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl TestStateMachine {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn get_value(&self, key: &str) -> Option<String> {
        self.data.read().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateMachine for TestStateMachine {
    async fn open(&self) -> RaftResult<u64> {
        self.closed.store(false, Ordering::SeqCst);
        Ok(self.applied.load(Ordering::SeqCst))
    }

    async fn apply(&self, index: u64, command: &[u8]) -> ApplyResult<Bytes> {
        let cmd = KvCommand::decode(command).map_err(|e| ApplyError::InvalidCommand {
            index,
            reason: e.to_string(),
        })?;
        debug!("{} applying index {}: {:?}", self.name, index, cmd);
        let previous = match cmd {
            KvCommand::Set { key, value } => self.data.write().unwrap().insert(key, value),
            KvCommand::Delete { key } => self.data.write().unwrap().remove(&key),
            KvCommand::Poison => return Err(ApplyError::internal_err("poisoned")),
        };
        self.applied.store(index, Ordering::SeqCst);
        Ok(Bytes::from(previous.unwrap_or_default()))
    }

    fn applied_index(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    async fn snapshot(&self) -> RaftResult<Bytes> {
        let snapshot = SnapshotData {
            index: self.applied_index(),
            data: self.data.read().unwrap().clone(),
        };
        serde_json::to_vec(&snapshot)
            .map(Bytes::from)
            .map_err(|e| RaftError::Snapshot(e.to_string()))
    }

    async fn restore(&self, index: u64, data: &[u8]) -> RaftResult<()> {
        let snapshot: SnapshotData =
            serde_json::from_slice(data).map_err(|e| RaftError::Snapshot(e.to_string()))?;
        *self.data.write().unwrap() = snapshot.data;
        self.applied.store(index, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
