//! In-memory engine
//!
//! BTreeMap-based ordered storage. The factory keeps engines alive across
//! close/reopen so a restarted replica finds its previous state.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use crate::traits::{Engine, EngineFactory, EngineId, StoreError, StoreResult, WriteBatch, WriteOp};

#[derive(Default)]
pub struct MemoryEngine {
    data: RwLock<BTreeMap<Bytes, Bytes>>,
    closed: AtomicBool,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

fn upper_bound(end: &[u8]) -> Bound<&[u8]> {
    if end.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(end)
    }
}

impl Engine for MemoryEngine {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Bytes>> {
        self.check_open()?;
        Ok(self.data.read().get(key).cloned())
    }

    fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> StoreResult<Vec<(Bytes, Bytes)>> {
        self.check_open()?;
        if !end.is_empty() && start >= end {
            return Ok(Vec::new());
        }
        let data = self.data.read();
        let iter = data
            .range::<[u8], _>((Bound::Included(start), upper_bound(end)))
            .map(|(k, v)| (k.clone(), v.clone()));
        Ok(if limit == 0 {
            iter.collect()
        } else {
            iter.take(limit).collect()
        })
    }

    fn write(&self, batch: &WriteBatch) -> StoreResult<()> {
        self.check_open()?;
        for op in batch.ops() {
            if let WriteOp::DeleteRange { start, end } = op {
                if !end.is_empty() && start > end {
                    return Err(StoreError::InvalidArgument(format!(
                        "delete range start {:?} > end {:?}",
                        start, end
                    )));
                }
            }
        }

        let mut data = self.data.write();
        for op in batch.ops() {
            match op {
                WriteOp::Put { key, value } => {
                    data.insert(key.clone(), value.clone());
                }
                WriteOp::Delete { key } => {
                    data.remove(key);
                }
                WriteOp::DeleteRange { start, end } => {
                    let doomed: Vec<Bytes> = data
                        .range::<[u8], _>((Bound::Included(&start[..]), upper_bound(end)))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        data.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Factory retaining every engine until it is destroyed
#[derive(Default, Clone)]
pub struct MemoryEngineFactory {
    engines: Arc<RwLock<HashMap<EngineId, Arc<MemoryEngine>>>>,
}

impl MemoryEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EngineFactory for MemoryEngineFactory {
    fn open(&self, id: &EngineId) -> StoreResult<Arc<dyn Engine>> {
        let mut engines = self.engines.write();
        let engine = engines
            .entry(id.clone())
            .or_insert_with(|| {
                debug!("creating engine {}", id);
                Arc::new(MemoryEngine::new())
            })
            .clone();
        engine.reopen();
        Ok(engine)
    }

    fn destroy(&self, id: &EngineId) -> StoreResult<()> {
        match self.engines.write().remove(id) {
            Some(engine) => {
                engine.close();
                debug!("destroyed engine {}", id);
                Ok(())
            }
            None => Err(StoreError::NotFound(id.clone())),
        }
    }

    fn list(&self, nhid: &str) -> Vec<EngineId> {
        let mut ids: Vec<_> = self
            .engines
            .read()
            .keys()
            .filter(|id| id.nhid == nhid)
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
