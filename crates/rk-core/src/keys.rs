//! Keyspace layout
//!
//! ```text
//! 0x00               MIN_BYTE, left edge of the keyspace
//! 0x01 ...           local keys, private to one replica
//! 0x02 ++ right      meta entries: descriptor of the range ending at `right`
//! 0x03 ...           system keys (global id counters)
//! 0x04 ..            user data; split points are always chosen here
//! 0xff               MAX_BYTE, right edge of the keyspace
//! ```

use crate::error::{Error, Result};

pub const MIN_BYTE: u8 = 0x00;
pub const MAX_BYTE: u8 = 0xff;

pub const LOCAL_PREFIX: u8 = 0x01;
pub const META_PREFIX: u8 = 0x02;
pub const SYSTEM_PREFIX: u8 = 0x03;
/// Keys below this byte never become split points
pub const UNSPLITTABLE_MAX_BYTE: u8 = 0x04;

/// This replica's own range descriptor
pub const LOCAL_RANGE_KEY: &[u8] = b"\x01range";
/// Raft index of the last applied entry, u64 little-endian
pub const LAST_APPLIED_INDEX_KEY: &[u8] = b"\x01lastAppliedIndex";
/// Split key of an in-flight split
pub const SPLIT_FREEZE_KEY: &[u8] = b"\x01splitFreeze";
/// Record bytes staged ahead of their metadata write
pub const STAGING_PREFIX: &[u8] = b"\x01staging/";

pub const LAST_CLUSTER_ID_KEY: &[u8] = b"\x03lastClusterID";
pub const LAST_NODE_ID_KEY: &[u8] = b"\x03lastNodeID";
pub const LAST_RANGE_ID_KEY: &[u8] = b"\x03lastRangeID";

pub fn min_key() -> Vec<u8> {
    vec![MIN_BYTE]
}

pub fn max_key() -> Vec<u8> {
    vec![MAX_BYTE]
}

pub fn range_meta_key(right: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(right.len() + 1);
    key.push(META_PREFIX);
    key.extend_from_slice(right);
    key
}

/// Smallest key strictly greater than `key`
pub fn key_successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

/// Start of the meta scan that finds the owner of `key`: the first entry whose
/// right boundary is strictly greater than `key`
pub fn meta_lookup_start(key: &[u8]) -> Vec<u8> {
    range_meta_key(&key_successor(key))
}

/// Exclusive end of all meta entries
pub fn meta_keys_end() -> Vec<u8> {
    vec![META_PREFIX + 1]
}

pub fn is_local_key(key: &[u8]) -> bool {
    key.first() == Some(&LOCAL_PREFIX)
}

pub fn is_meta_key(key: &[u8]) -> bool {
    key.first() == Some(&META_PREFIX)
}

/// Keys owned by the meta range no matter how the rest of the keyspace is split
pub fn is_unsplittable(key: &[u8]) -> bool {
    key < [UNSPLITTABLE_MAX_BYTE].as_slice()
}

pub fn staging_key(record_key: &[u8]) -> Vec<u8> {
    let mut key = STAGING_PREFIX.to_vec();
    key.extend_from_slice(record_key);
    key
}

pub fn encode_u64(value: u64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn decode_u64(data: &[u8]) -> Result<u64> {
    let buf: [u8; 8] = data
        .try_into()
        .map_err(|_| Error::Codec(format!("expected 8 bytes for u64, got {}", data.len())))?;
    Ok(u64::from_le_bytes(buf))
}

/// Printable form of a binary key for logs and errors
pub fn printable(key: &[u8]) -> String {
    key.escape_ascii().to_string()
}
