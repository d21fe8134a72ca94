//! Batch commands
//!
//! A [`BatchCmd`] is the only payload ever proposed to a range's raft group. Its
//! requests apply atomically and produce one [`Response`] each, in order.

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::descriptor::{Header, RangeDescriptor};
use crate::error::{Error, Result};
use crate::record::FileRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    DirectWrite {
        key: Vec<u8>,
        value: Vec<u8>,
    },
    DirectRead {
        key: Vec<u8>,
    },
    DirectDelete {
        key: Vec<u8>,
    },
    /// Add `delta` to a u64 LE counter (missing counts as zero)
    Increment {
        key: Vec<u8>,
        delta: u64,
    },
    /// Write `value` only if the current value equals `expected` (`None` = absent)
    CompareAndSet {
        key: Vec<u8>,
        expected: Option<Vec<u8>>,
        value: Vec<u8>,
    },
    /// Keys in `[start, end)`; `limit == 0` means unbounded
    Scan {
        start: Vec<u8>,
        end: Vec<u8>,
        limit: u64,
    },
    /// Register a record whose bytes were staged on the replicas
    FileWrite {
        record: FileRecord,
    },
    /// Reject writes at or above `split_key` until the split commits or aborts
    FreezeRange {
        split_key: Vec<u8>,
    },
    UnfreezeRange,
    /// Shrink this range to `left` and hand `right` to its new group
    SplitCommit {
        left: RangeDescriptor,
        right: RangeDescriptor,
    },
    /// Replace this range's descriptor (membership changes)
    UpdateDescriptor {
        descriptor: RangeDescriptor,
    },
}

impl Request {
    pub fn direct_write(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Request::DirectWrite {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn direct_read(key: impl Into<Vec<u8>>) -> Self {
        Request::DirectRead { key: key.into() }
    }

    pub fn increment(key: impl Into<Vec<u8>>, delta: u64) -> Self {
        Request::Increment {
            key: key.into(),
            delta,
        }
    }

    pub fn scan(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>, limit: u64) -> Self {
        Request::Scan {
            start: start.into(),
            end: end.into(),
            limit,
        }
    }

    /// Whether applying the request leaves the engine untouched
    pub fn is_read_only(&self) -> bool {
        matches!(self, Request::DirectRead { .. } | Request::Scan { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Written,
    Deleted,
    Value(Option<Vec<u8>>),
    Incremented(u64),
    Swapped,
    Scanned(Vec<(Vec<u8>, Vec<u8>)>),
    FileWritten,
    Frozen,
    Unfrozen,
    SplitCommitted,
    DescriptorUpdated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCmd {
    /// Absent only for bootstrap and split seed batches
    pub header: Option<Header>,
    pub requests: Vec<Request>,
}

impl BatchCmd {
    pub fn encode(&self) -> Result<Vec<u8>> {
        codec::encode(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        codec::decode(data)
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.header = Some(header);
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.requests.iter().all(Request::is_read_only)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub responses: Vec<Response>,
}

impl BatchResponse {
    fn get(&self, i: usize) -> Result<&Response> {
        self.responses.get(i).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "response {} of {} requested",
                i,
                self.responses.len()
            ))
        })
    }

    fn unexpected(i: usize, response: &Response) -> Error {
        Error::InvalidArgument(format!("unexpected response {}: {:?}", i, response))
    }

    pub fn value(&self, i: usize) -> Result<Option<Vec<u8>>> {
        match self.get(i)? {
            Response::Value(v) => Ok(v.clone()),
            other => Err(Self::unexpected(i, other)),
        }
    }

    pub fn incremented(&self, i: usize) -> Result<u64> {
        match self.get(i)? {
            Response::Incremented(v) => Ok(*v),
            other => Err(Self::unexpected(i, other)),
        }
    }

    pub fn scanned(&self, i: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        match self.get(i)? {
            Response::Scanned(kvs) => Ok(kvs.clone()),
            other => Err(Self::unexpected(i, other)),
        }
    }
}

/// Result of applying one batch, as recorded in the raft result
pub type ApplyOutcome = Result<BatchResponse>;

pub fn encode_outcome(outcome: &ApplyOutcome) -> Result<Vec<u8>> {
    codec::encode(outcome)
}

pub fn decode_outcome(data: &[u8]) -> Result<BatchResponse> {
    let outcome: ApplyOutcome = codec::decode(data)?;
    outcome
}

/// Fluent batch assembly
#[derive(Debug, Clone, Default)]
pub struct BatchBuilder {
    header: Option<Header>,
    requests: Vec<Request>,
}

impl BatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, request: Request) -> Self {
        self.requests.push(request);
        self
    }

    pub fn set_header(mut self, header: Header) -> Self {
        self.header = Some(header);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn build(self) -> BatchCmd {
        BatchCmd {
            header: self.header,
            requests: self.requests,
        }
    }

    pub fn encode(self) -> Result<Vec<u8>> {
        self.build().encode()
    }
}
