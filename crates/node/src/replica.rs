//! Replica state machine
//!
//! One `Replica` per local member of a range's raft group. It applies committed
//! batches to its own engine, serves local reads, stages and serves record bytes,
//! and reports descriptor changes to the owning store.
//!
//! Every applied batch persists `LAST_APPLIED_INDEX_KEY` in the same engine write as
//! its effects, so the applied index and the data never disagree after a restart.
//! Business rejections (stale generation, key outside the range, frozen split half)
//! abort the batch but are still recorded as the result of that index; only engine
//! failures are fatal.

use std::collections::BTreeMap;
use std::io::Read;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use raft::{ApplyError, ApplyResult, RaftError, RaftResult, StateMachine};
use rk_core::command::encode_outcome;
use rk_core::keys::{self, printable};
use rk_core::{
    codec, ApplyOutcome, BatchCmd, BatchResponse, Error, FileRecord, Header, RangeDescriptor,
    ReplicaDescriptor, Request, Response, Result, StoredRecord,
};
use storage::{Engine, WriteBatch};
use tracing::{debug, error, info, warn};

/// Replica lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Opened, no descriptor applied yet
    Uninitialized,
    Active,
    /// Removed from its group; data is no longer authoritative
    Removed,
    Closed,
}

/// Receives descriptor changes produced by applied commands
pub trait RangeTracker: Send + Sync {
    fn on_range_changed(
        &self,
        replica: ReplicaDescriptor,
        previous: Option<RangeDescriptor>,
        current: RangeDescriptor,
    );
}

/// Writes of one batch, visible to later requests of the same batch
struct PendingWrites<'a> {
    engine: &'a dyn Engine,
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    deleted_ranges: Vec<(Vec<u8>, Vec<u8>)>,
    batch: WriteBatch,
}

impl<'a> PendingWrites<'a> {
    fn new(engine: &'a dyn Engine) -> Self {
        Self {
            engine,
            overlay: BTreeMap::new(),
            deleted_ranges: Vec::new(),
            batch: WriteBatch::new(),
        }
    }

    fn in_deleted_range(&self, key: &[u8]) -> bool {
        self.deleted_ranges
            .iter()
            .any(|(start, end)| start.as_slice() <= key && key < end.as_slice())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.overlay.get(key) {
            return Ok(value.clone());
        }
        if self.in_deleted_range(key) {
            return Ok(None);
        }
        Ok(self.engine.get(key)?.map(|v| v.to_vec()))
    }

    fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .engine
            .scan(start, end, 0)?
            .into_iter()
            .filter(|(k, _)| !self.in_deleted_range(k))
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end)
        };
        for (key, value) in self
            .overlay
            .range::<[u8], _>((Bound::Included(start), upper))
        {
            match value {
                Some(v) => merged.insert(key.clone(), v.clone()),
                None => merged.remove(key),
            };
        }
        let iter = merged.into_iter();
        Ok(if limit == 0 {
            iter.collect()
        } else {
            iter.take(limit).collect()
        })
    }

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.batch.put(key.clone(), value.clone());
        self.overlay.insert(key, Some(value));
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.batch.delete(key.clone());
        self.overlay.insert(key, None);
    }

    fn delete_range(&mut self, start: Vec<u8>, end: Vec<u8>) {
        self.batch.delete_range(start.clone(), end.clone());
        self.overlay
            .retain(|k, _| !(start.as_slice() <= k.as_slice() && k.as_slice() < end.as_slice()));
        self.deleted_ranges.push((start, end));
    }
}

/// Replica-level state a batch may change
#[derive(Clone)]
struct RangeState {
    descriptor: Option<RangeDescriptor>,
    split_key: Option<Vec<u8>>,
}

impl RangeState {
    fn range_id(&self) -> u64 {
        self.descriptor.as_ref().map_or(0, |rd| rd.range_id)
    }

    fn check_header(&self, cluster_id: u64, header: &Header) -> Result<()> {
        let rd = self.descriptor.as_ref().ok_or_else(|| {
            Error::RangeNotFound(format!("cluster {} has no descriptor", cluster_id))
        })?;
        if header.range_id != rd.range_id {
            return Err(Error::RangeNotFound(format!(
                "cluster {} serves range {}, not {}",
                cluster_id, rd.range_id, header.range_id
            )));
        }
        if header.generation != rd.generation {
            return Err(Error::RangeGenerationMismatch {
                range_id: rd.range_id,
                requested: header.generation,
                current: rd.generation,
            });
        }
        Ok(())
    }

    fn check_owned(&self, key: &[u8]) -> Result<()> {
        if keys::is_local_key(key) {
            return Ok(());
        }
        match &self.descriptor {
            Some(rd) if rd.contains_key(key) => Ok(()),
            Some(rd) => Err(Error::KeyOutOfRange {
                key: key.to_vec(),
                range_id: rd.range_id,
            }),
            None => Err(Error::RangeNotFound("replica has no descriptor".to_string())),
        }
    }

    /// Local keys change only through administrative requests, except the
    /// descriptor written by the headerless seed batch of an empty replica
    fn check_client_write(&self, key: &[u8], headerless: bool) -> Result<()> {
        if !keys::is_local_key(key) {
            return Ok(());
        }
        if headerless && self.descriptor.is_none() && key == keys::LOCAL_RANGE_KEY {
            return Ok(());
        }
        Err(Error::InvalidArgument(format!(
            "{} is private to the replica",
            printable(key)
        )))
    }

    fn check_writable(&self, key: &[u8]) -> Result<()> {
        self.check_owned(key)?;
        if keys::is_local_key(key) {
            return Ok(());
        }
        match &self.split_key {
            Some(split_key) if key >= split_key.as_slice() => Err(Error::RangeSplitting {
                range_id: self.range_id(),
            }),
            _ => Ok(()),
        }
    }

    fn current(&self) -> Result<&RangeDescriptor> {
        self.descriptor
            .as_ref()
            .ok_or_else(|| Error::RangeNotFound("replica has no descriptor".to_string()))
    }
}

pub struct Replica {
    cluster_id: u64,
    node_id: u64,
    engine: Arc<dyn Engine>,
    state: RwLock<ReplicaState>,
    applied_index: AtomicU64,
    range: RwLock<RangeState>,
    tracker: Option<Weak<dyn RangeTracker>>,
}

impl Replica {
    pub fn new(
        cluster_id: u64,
        node_id: u64,
        engine: Arc<dyn Engine>,
        tracker: Option<Weak<dyn RangeTracker>>,
    ) -> Self {
        Self {
            cluster_id,
            node_id,
            engine,
            state: RwLock::new(ReplicaState::Uninitialized),
            applied_index: AtomicU64::new(0),
            range: RwLock::new(RangeState {
                descriptor: None,
                split_key: None,
            }),
            tracker,
        }
    }

    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn replica_descriptor(&self) -> ReplicaDescriptor {
        ReplicaDescriptor::new(self.cluster_id, self.node_id)
    }

    pub fn state(&self) -> ReplicaState {
        *self.state.read()
    }

    pub fn descriptor(&self) -> Option<RangeDescriptor> {
        self.range.read().descriptor.clone()
    }

    /// Pending split key while a split is in flight
    pub fn split_key(&self) -> Option<Vec<u8>> {
        self.range.read().split_key.clone()
    }

    /// Direct engine access for inspection in tests and diagnostics
    pub fn testing_engine(&self) -> Arc<dyn Engine> {
        self.engine.clone()
    }

    pub fn mark_removed(&self) {
        *self.state.write() = ReplicaState::Removed;
        info!("c{}n{}: removed", self.cluster_id, self.node_id);
    }

    fn check_serving(&self) -> Result<()> {
        match self.state() {
            ReplicaState::Active => Ok(()),
            state => Err(Error::Unavailable(format!(
                "c{}n{} is {:?}",
                self.cluster_id, self.node_id, state
            ))),
        }
    }

    /// Load the persisted descriptor, freeze marker and applied index
    fn load(&self) -> Result<u64> {
        let applied = match self.engine.get(keys::LAST_APPLIED_INDEX_KEY)? {
            Some(buf) => keys::decode_u64(&buf)?,
            None => 0,
        };
        let descriptor = match self.engine.get(keys::LOCAL_RANGE_KEY)? {
            Some(buf) => Some(RangeDescriptor::decode(&buf)?),
            None => None,
        };
        let split_key = self.engine.get(keys::SPLIT_FREEZE_KEY)?.map(|b| b.to_vec());

        let previous = {
            let mut range = self.range.write();
            let previous = range.descriptor.take();
            range.descriptor = descriptor.clone();
            range.split_key = split_key;
            previous
        };
        self.applied_index.store(applied, Ordering::SeqCst);
        {
            let mut state = self.state.write();
            if *state != ReplicaState::Removed {
                *state = if descriptor.is_some() {
                    ReplicaState::Active
                } else {
                    ReplicaState::Uninitialized
                };
            }
        }
        if let Some(current) = descriptor {
            if previous.as_ref() != Some(&current) {
                self.notify(previous, current);
            }
        }
        Ok(applied)
    }

    fn notify(&self, previous: Option<RangeDescriptor>, current: RangeDescriptor) {
        if let Some(tracker) = self.tracker.as_ref().and_then(Weak::upgrade) {
            tracker.on_range_changed(self.replica_descriptor(), previous, current);
        }
    }

    // ------------------------------------------------------------------
    // Apply
    // ------------------------------------------------------------------

    fn apply_request(
        &self,
        request: &Request,
        headerless: bool,
        writes: &mut PendingWrites<'_>,
        range: &mut RangeState,
    ) -> Result<Response> {
        match request {
            Request::DirectWrite { key, value } => {
                range.check_client_write(key, headerless)?;
                range.check_writable(key)?;
                if key.as_slice() == keys::LOCAL_RANGE_KEY {
                    let rd = RangeDescriptor::decode(value)?;
                    rd.validate()?;
                    range.descriptor = Some(rd);
                }
                writes.put(key.clone(), value.clone());
                Ok(Response::Written)
            }
            Request::DirectRead { key } => {
                range.check_owned(key)?;
                Ok(Response::Value(writes.get(key)?))
            }
            Request::DirectDelete { key } => {
                range.check_client_write(key, headerless)?;
                range.check_writable(key)?;
                writes.delete(key.clone());
                Ok(Response::Deleted)
            }
            Request::Increment { key, delta } => {
                range.check_client_write(key, headerless)?;
                range.check_writable(key)?;
                let current = match writes.get(key)? {
                    Some(buf) => keys::decode_u64(&buf)?,
                    None => 0,
                };
                let next = current.checked_add(*delta).ok_or_else(|| {
                    Error::InvalidArgument(format!("counter {} overflows", printable(key)))
                })?;
                writes.put(key.clone(), keys::encode_u64(next));
                Ok(Response::Incremented(next))
            }
            Request::CompareAndSet {
                key,
                expected,
                value,
            } => {
                range.check_client_write(key, headerless)?;
                range.check_writable(key)?;
                let current = writes.get(key)?;
                if current != *expected {
                    return Err(Error::ConditionFailed(format!(
                        "value of {} changed",
                        printable(key)
                    )));
                }
                writes.put(key.clone(), value.clone());
                Ok(Response::Swapped)
            }
            Request::Scan { start, end, limit } => {
                Ok(Response::Scanned(self.scan_owned(writes, range, start, end, *limit)?))
            }
            Request::FileWrite { record } => {
                let key = record.metadata_key()?;
                range.check_writable(&key)?;
                let staging_key = keys::staging_key(&key);
                let staged = writes
                    .get(&staging_key)?
                    .filter(|data| record.digest.matches(data));
                let data = match staged {
                    Some(data) => Some(data),
                    // A rewrite keeps previously committed bytes
                    None => match writes.get(&key)? {
                        Some(buf) => StoredRecord::decode(&buf)?.data,
                        None => None,
                    },
                };
                if data.is_none() {
                    warn!(
                        "c{}n{}: registering {} without staged bytes",
                        self.cluster_id,
                        self.node_id,
                        printable(&key)
                    );
                }
                let stored = StoredRecord {
                    record: record.clone(),
                    data,
                };
                writes.put(key, stored.encode()?);
                writes.delete(staging_key);
                Ok(Response::FileWritten)
            }
            Request::FreezeRange { split_key } => {
                let rd = range.current()?;
                if !(rd.left < *split_key && *split_key < rd.right)
                    || keys::is_unsplittable(split_key)
                {
                    return Err(Error::InvalidArgument(format!(
                        "split key {} not inside {}",
                        printable(split_key),
                        rd
                    )));
                }
                match &range.split_key {
                    Some(existing) if existing == split_key => {}
                    Some(_) => {
                        return Err(Error::RangeBusy {
                            range_id: rd.range_id,
                        })
                    }
                    None => {}
                }
                range.split_key = Some(split_key.clone());
                writes.put(keys::SPLIT_FREEZE_KEY.to_vec(), split_key.clone());
                Ok(Response::Frozen)
            }
            Request::UnfreezeRange => {
                range.split_key = None;
                writes.delete(keys::SPLIT_FREEZE_KEY.to_vec());
                Ok(Response::Unfrozen)
            }
            Request::SplitCommit { left, right } => {
                let rd = range.current()?;
                let valid = left.range_id == rd.range_id
                    && left.left == rd.left
                    && right.right == rd.right
                    && left.right == right.left
                    && rd.left < left.right
                    && left.right < rd.right
                    && left.generation == rd.generation + 1
                    && right.generation == rd.generation + 1
                    && left.replicas == rd.replicas
                    && right.range_id != rd.range_id;
                if !valid {
                    return Err(Error::InvalidArgument(format!(
                        "split of {} into {} and {} is inconsistent",
                        rd, left, right
                    )));
                }
                if let Some(split_key) = &range.split_key {
                    if *split_key != left.right {
                        return Err(Error::RangeBusy {
                            range_id: rd.range_id,
                        });
                    }
                }
                writes.delete_range(left.right.clone(), rd.right.clone());
                writes.put(keys::LOCAL_RANGE_KEY.to_vec(), left.encode()?);
                writes.delete(keys::SPLIT_FREEZE_KEY.to_vec());
                range.descriptor = Some(left.clone());
                range.split_key = None;
                Ok(Response::SplitCommitted)
            }
            Request::UpdateDescriptor { descriptor } => {
                let rd = range.current()?;
                if descriptor.range_id != rd.range_id
                    || descriptor.left != rd.left
                    || descriptor.right != rd.right
                    || descriptor.generation <= rd.generation
                {
                    return Err(Error::InvalidArgument(format!(
                        "cannot replace {} with {}",
                        rd, descriptor
                    )));
                }
                descriptor.validate()?;
                writes.put(keys::LOCAL_RANGE_KEY.to_vec(), descriptor.encode()?);
                range.descriptor = Some(descriptor.clone());
                Ok(Response::DescriptorUpdated)
            }
        }
    }

    /// Scan clamped to the range, hiding local keys unless asked for them
    fn scan_owned(
        &self,
        writes: &PendingWrites<'_>,
        range: &RangeState,
        start: &[u8],
        end: &[u8],
        limit: u64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        range.check_owned(start)?;
        let local = keys::is_local_key(start);
        let end = match (&range.descriptor, local) {
            (Some(rd), false) if end.is_empty() || end > rd.right.as_slice() => rd.right.clone(),
            _ => end.to_vec(),
        };
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let mut kvs = writes.scan(start, &end, 0)?;
        if !local {
            kvs.retain(|(k, _)| !keys::is_local_key(k));
        }
        if limit > 0 {
            kvs.truncate(limit);
        }
        Ok(kvs)
    }

    /// Apply one batch. Returns the outcome plus the engine batch to persist.
    fn apply_batch(
        &self,
        index: u64,
        batch: &BatchCmd,
        range: &mut RangeState,
    ) -> ApplyResult<(ApplyOutcome, WriteBatch)> {
        let mut writes = PendingWrites::new(self.engine.as_ref());
        let mut scratch = range.clone();

        let outcome = (|| -> ApplyOutcome {
            if let Some(header) = &batch.header {
                scratch.check_header(self.cluster_id, header)?;
            }
            let mut responses = Vec::with_capacity(batch.requests.len());
            for request in &batch.requests {
                responses.push(self.apply_request(
                    request,
                    batch.header.is_none(),
                    &mut writes,
                    &mut scratch,
                )?);
            }
            Ok(BatchResponse { responses })
        })();

        let mut engine_batch = match &outcome {
            Ok(_) => {
                *range = scratch;
                writes.batch
            }
            Err(Error::Storage(msg)) => {
                return Err(ApplyError::Storage(msg.clone()));
            }
            Err(e) => {
                debug!(
                    "c{}n{}: index {} rejected: {}",
                    self.cluster_id, self.node_id, index, e
                );
                WriteBatch::new()
            }
        };
        engine_batch.put(
            keys::LAST_APPLIED_INDEX_KEY.to_vec(),
            keys::encode_u64(index),
        );
        Ok((outcome, engine_batch))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    fn read_state(&self, header: &Header) -> Result<RangeState> {
        self.check_serving()?;
        let range = self.range.read().clone();
        range.check_header(self.cluster_id, header)?;
        Ok(range)
    }

    /// Local, possibly stale point read
    pub fn read(&self, header: &Header, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let range = self.read_state(header)?;
        range.check_owned(key)?;
        Ok(self.engine.get(key)?.map(|v| v.to_vec()))
    }

    /// Local, possibly stale range scan of `[start, end)` clamped to the range
    pub fn scan(
        &self,
        header: &Header,
        start: &[u8],
        end: &[u8],
        limit: u64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let range = self.read_state(header)?;
        let writes = PendingWrites::new(self.engine.as_ref());
        self.scan_owned(&writes, &range, start, end, limit)
    }

    /// Evaluate a read-only batch against local state
    pub fn read_batch(&self, header: &Header, batch: &BatchCmd) -> Result<BatchResponse> {
        if !batch.is_read_only() {
            return Err(Error::InvalidArgument(
                "read batch contains writes".to_string(),
            ));
        }
        let range = self.read_state(header)?;
        let writes = PendingWrites::new(self.engine.as_ref());
        let mut responses = Vec::with_capacity(batch.requests.len());
        for request in &batch.requests {
            let response = match request {
                Request::DirectRead { key } => {
                    range.check_owned(key)?;
                    Response::Value(writes.get(key)?)
                }
                Request::Scan { start, end, limit } => {
                    Response::Scanned(self.scan_owned(&writes, &range, start, end, *limit)?)
                }
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "{:?} is not a read",
                        other
                    )))
                }
            };
            responses.push(response);
        }
        Ok(BatchResponse { responses })
    }

    /// All user keys currently stored in `[start, end)`, for split planning
    pub fn data_keys(&self, start: &[u8], end: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .engine
            .scan(start, end, 0)?
            .into_iter()
            .map(|(k, _)| k.to_vec())
            .filter(|k| !keys::is_local_key(k))
            .collect())
    }

    /// Start staging a record's bytes on this replica
    pub fn record_writer(&self, header: &Header, record: &FileRecord) -> Result<RecordWriter> {
        let key = record.metadata_key()?;
        let range = self.read_state(header)?;
        range.check_writable(&key)?;
        Ok(RecordWriter {
            engine: self.engine.clone(),
            record: record.clone(),
            staging_key: keys::staging_key(&key),
            buf: Vec::with_capacity(record.digest.size_bytes as usize),
        })
    }

    /// Read `limit` bytes (0 = to end) of a registered record from `offset`
    pub fn record_reader(
        &self,
        header: &Header,
        record: &FileRecord,
        offset: u64,
        limit: u64,
    ) -> Result<RecordReader> {
        let key = record.metadata_key()?;
        let range = self.read_state(header)?;
        range.check_owned(&key)?;
        let not_found = || Error::RecordNotFound(printable(&key));
        let stored = match self.engine.get(&key)? {
            Some(buf) => StoredRecord::decode(&buf)?,
            None => return Err(not_found()),
        };
        let data = stored.data.ok_or_else(not_found)?;
        let len = data.len() as u64;
        if offset > len {
            return Err(Error::InvalidArgument(format!(
                "offset {} beyond record size {}",
                offset, len
            )));
        }
        let end = if limit == 0 {
            len
        } else {
            offset.saturating_add(limit).min(len)
        };
        Ok(RecordReader {
            data: Bytes::from(data).slice(offset as usize..end as usize),
            pos: 0,
        })
    }

    fn snapshot_entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .engine
            .scan(&[], &[], 0)?
            .into_iter()
            .filter(|(k, _)| {
                k.as_ref() != keys::LAST_APPLIED_INDEX_KEY && !k.starts_with(keys::STAGING_PREFIX)
            })
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect())
    }

    fn restore_entries(&self, index: u64, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let mut batch = WriteBatch::new();
        for (key, _) in self.engine.scan(&[], &[], 0)? {
            if !key.starts_with(keys::STAGING_PREFIX) {
                batch.delete(key);
            }
        }
        for (key, value) in entries {
            batch.put(key, value);
        }
        batch.put(
            keys::LAST_APPLIED_INDEX_KEY.to_vec(),
            keys::encode_u64(index),
        );
        self.engine.write(&batch)?;
        self.load()?;
        Ok(())
    }
}

#[async_trait]
impl StateMachine for Replica {
    async fn open(&self) -> RaftResult<u64> {
        let applied = self
            .load()
            .map_err(|e| RaftError::Apply(ApplyError::Storage(e.to_string())))?;
        debug!(
            "c{}n{}: opened at index {}",
            self.cluster_id, self.node_id, applied
        );
        Ok(applied)
    }

    async fn apply(&self, index: u64, command: &[u8]) -> ApplyResult<Bytes> {
        if self.engine.is_closed() {
            return Err(ApplyError::Storage(format!(
                "c{}n{}: engine closed",
                self.cluster_id, self.node_id
            )));
        }

        let (outcome, previous, current) = match BatchCmd::decode(command) {
            Ok(batch) => {
                let mut range = self.range.read().clone();
                let previous = range.descriptor.clone();
                let (outcome, engine_batch) = self.apply_batch(index, &batch, &mut range)?;
                self.engine.write(&engine_batch).map_err(|e| {
                    error!(
                        "c{}n{}: engine write failed at index {}: {}",
                        self.cluster_id, self.node_id, index, e
                    );
                    ApplyError::Storage(e.to_string())
                })?;
                let current = range.descriptor.clone();
                *self.range.write() = range;
                (outcome, previous, current)
            }
            Err(e) => {
                warn!(
                    "c{}n{}: undecodable command at index {}: {}",
                    self.cluster_id, self.node_id, index, e
                );
                let mut batch = WriteBatch::new();
                batch.put(
                    keys::LAST_APPLIED_INDEX_KEY.to_vec(),
                    keys::encode_u64(index),
                );
                self.engine
                    .write(&batch)
                    .map_err(|e| ApplyError::Storage(e.to_string()))?;
                (Err(e), None, None)
            }
        };
        self.applied_index.store(index, Ordering::SeqCst);

        if let Some(current) = current {
            {
                let mut state = self.state.write();
                if *state == ReplicaState::Uninitialized {
                    *state = ReplicaState::Active;
                }
            }
            if previous.as_ref() != Some(&current) {
                info!(
                    "c{}n{}: now serving {}",
                    self.cluster_id, self.node_id, current
                );
                self.notify(previous, current);
            }
        }

        encode_outcome(&outcome)
            .map(Bytes::from)
            .map_err(|e| ApplyError::internal_err(e.to_string()))
    }

    fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::SeqCst)
    }

    async fn snapshot(&self) -> RaftResult<Bytes> {
        let entries = self
            .snapshot_entries()
            .map_err(|e| RaftError::Snapshot(e.to_string()))?;
        codec::encode(&entries)
            .map(Bytes::from)
            .map_err(|e| RaftError::Snapshot(e.to_string()))
    }

    async fn restore(&self, index: u64, data: &[u8]) -> RaftResult<()> {
        let entries: Vec<(Vec<u8>, Vec<u8>)> =
            codec::decode(data).map_err(|e| RaftError::Snapshot(e.to_string()))?;
        info!(
            "c{}n{}: restoring {} entries at index {}",
            self.cluster_id,
            self.node_id,
            entries.len(),
            index
        );
        self.restore_entries(index, entries)
            .map_err(|e| RaftError::Snapshot(e.to_string()))
    }

    async fn close(&self) {
        {
            let mut state = self.state.write();
            if *state != ReplicaState::Removed {
                *state = ReplicaState::Closed;
            }
        }
        self.engine.close();
        debug!("c{}n{}: closed", self.cluster_id, self.node_id);
    }
}

/// Buffers record bytes and stages them on `close`
pub struct RecordWriter {
    engine: Arc<dyn Engine>,
    record: FileRecord,
    staging_key: Vec<u8>,
    buf: Vec<u8>,
}

impl RecordWriter {
    pub fn write(&mut self, chunk: &[u8]) -> usize {
        self.buf.extend_from_slice(chunk);
        chunk.len()
    }

    /// Verify the digest and stage the bytes
    pub fn close(self) -> Result<()> {
        if !self.record.digest.matches(&self.buf) {
            return Err(Error::InvalidArgument(format!(
                "bytes do not match digest {}",
                self.record.digest.hash
            )));
        }
        let mut batch = WriteBatch::new();
        batch.put(self.staging_key, self.buf);
        self.engine.write(&batch)?;
        Ok(())
    }
}

/// Byte range of a committed record
pub struct RecordReader {
    data: Bytes,
    pos: usize,
}

impl RecordReader {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining bytes
    pub fn into_bytes(self) -> Bytes {
        self.data.slice(self.pos..)
    }
}

impl Read for RecordReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = &self.data[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}
