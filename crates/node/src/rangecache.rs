//! Range cache
//!
//! Eventually-consistent map from key to owning `RangeDescriptor`, keyed by right
//! boundary so a lookup is a single ordered seek. Cached entries never overlap: an
//! update evicts every overlapping entry unless one of them is newer, in which case
//! the update is stale and dropped. Correctness never depends on the cache; routers
//! invalidate on routing errors and re-resolve through the meta range.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use parking_lot::RwLock;
use rk_core::{RangeDescriptor, ReplicaDescriptor};
use tracing::debug;

use crate::gossip::{MembershipEvent, MembershipListener};

#[derive(Default)]
struct CacheInner {
    /// right boundary -> descriptor
    by_right: BTreeMap<Vec<u8>, RangeDescriptor>,
    /// range_id -> last known leader
    leaders: HashMap<u64, ReplicaDescriptor>,
    meta: Option<RangeDescriptor>,
}

impl CacheInner {
    fn overlapping(&self, rd: &RangeDescriptor) -> Vec<&RangeDescriptor> {
        self.by_right
            .range::<[u8], _>((Bound::Excluded(rd.left.as_slice()), Bound::Unbounded))
            .map(|(_, cached)| cached)
            .take_while(|cached| cached.left < rd.right)
            .collect()
    }
}

#[derive(Default)]
pub struct RangeCache {
    inner: RwLock<CacheInner>,
}

impl RangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owner of `key`, if cached
    pub fn lookup(&self, key: &[u8]) -> Option<RangeDescriptor> {
        let inner = self.inner.read();
        inner
            .by_right
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(_, rd)| rd)
            .filter(|rd| rd.left.as_slice() <= key)
            .cloned()
    }

    /// Insert or replace. Returns false when a cached overlapping entry is newer.
    pub fn update(&self, rd: RangeDescriptor) -> bool {
        let mut inner = self.inner.write();

        if rd.is_meta_range() {
            let newer = inner
                .meta
                .as_ref()
                .map_or(true, |meta| meta.generation <= rd.generation);
            if newer {
                inner.meta = Some(rd.clone());
            }
        }

        let overlapping = inner.overlapping(&rd);
        if overlapping.iter().any(|cached| cached.generation > rd.generation) {
            debug!("range cache: ignoring stale {}", rd);
            return false;
        }
        if overlapping.len() == 1 && *overlapping[0] == rd {
            return true;
        }

        let evicted: Vec<(Vec<u8>, u64, u64)> = overlapping
            .iter()
            .map(|cached| (cached.right.clone(), cached.range_id, cached.generation))
            .collect();
        for (right, range_id, generation) in evicted {
            inner.by_right.remove(&right);
            if range_id != rd.range_id || generation != rd.generation {
                inner.leaders.remove(&range_id);
            }
        }
        debug!("range cache: caching {}", rd);
        inner.by_right.insert(rd.right.clone(), rd);
        true
    }

    /// Drop the entry for `range_id`
    pub fn invalidate(&self, range_id: u64) {
        let mut inner = self.inner.write();
        inner.by_right.retain(|_, rd| rd.range_id != range_id);
        inner.leaders.remove(&range_id);
        debug!("range cache: invalidated range {}", range_id);
    }

    /// Drop the entry covering `key`
    pub fn invalidate_key(&self, key: &[u8]) {
        if let Some(rd) = self.lookup(key) {
            self.invalidate(rd.range_id);
        }
    }

    pub fn set_leader(&self, range_id: u64, replica: ReplicaDescriptor) {
        self.inner.write().leaders.insert(range_id, replica);
    }

    pub fn leader(&self, range_id: u64) -> Option<ReplicaDescriptor> {
        self.inner.read().leaders.get(&range_id).copied()
    }

    pub fn clear_leader(&self, range_id: u64) {
        self.inner.write().leaders.remove(&range_id);
    }

    /// Descriptor of the range holding the meta keys
    pub fn meta_range(&self) -> Option<RangeDescriptor> {
        self.inner.read().meta.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_right.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_right.is_empty()
    }

    /// All cached descriptors ordered by key
    pub fn descriptors(&self) -> Vec<RangeDescriptor> {
        self.inner.read().by_right.values().cloned().collect()
    }
}

impl MembershipListener for RangeCache {
    fn on_event(&self, event: &MembershipEvent) {
        if let MembershipEvent::RangeChanged(rd) = event {
            self.update(rd.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rk_core::keys;

    fn rd(range_id: u64, left: &[u8], right: &[u8], generation: u64) -> RangeDescriptor {
        RangeDescriptor::new(
            range_id,
            left.to_vec(),
            right.to_vec(),
            generation,
            vec![ReplicaDescriptor::new(range_id, 1)],
        )
    }

    #[test]
    fn test_lookup_boundaries() {
        let cache = RangeCache::new();
        cache.update(rd(1, &[keys::MIN_BYTE], b"m", 1));
        cache.update(rd(2, b"p", &[keys::MAX_BYTE], 1));

        assert_eq!(cache.lookup(b"a").unwrap().range_id, 1);
        assert_eq!(cache.lookup(b"m"), None);
        assert_eq!(cache.lookup(b"o"), None);
        assert_eq!(cache.lookup(b"p").unwrap().range_id, 2);
        assert_eq!(cache.lookup(b"zz").unwrap().range_id, 2);
    }

    #[test]
    fn test_split_replaces_parent() {
        let cache = RangeCache::new();
        cache.update(rd(1, &[keys::MIN_BYTE], &[keys::MAX_BYTE], 1));
        cache.set_leader(1, ReplicaDescriptor::new(1, 1));

        assert!(cache.update(rd(2, b"m", &[keys::MAX_BYTE], 2)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(b"a"), None);
        assert_eq!(cache.leader(1), None);

        assert!(cache.update(rd(1, &[keys::MIN_BYTE], b"m", 2)));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup(b"a").unwrap().generation, 2);
    }

    #[test]
    fn test_stale_update_rejected() {
        let cache = RangeCache::new();
        cache.update(rd(1, &[keys::MIN_BYTE], b"m", 2));
        assert!(!cache.update(rd(1, &[keys::MIN_BYTE], &[keys::MAX_BYTE], 1)));
        assert_eq!(cache.lookup(b"a").unwrap().right, b"m".to_vec());
        assert_eq!(cache.lookup(b"x"), None);
    }

    #[test]
    fn test_invalidate() {
        let cache = RangeCache::new();
        cache.update(rd(1, &[keys::MIN_BYTE], b"m", 1));
        cache.update(rd(2, b"m", &[keys::MAX_BYTE], 1));
        cache.invalidate_key(b"q");
        assert_eq!(cache.lookup(b"q"), None);
        assert!(cache.lookup(b"a").is_some());
        cache.invalidate(1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_meta_pointer_survives_invalidation() {
        let cache = RangeCache::new();
        let meta = rd(1, &[keys::MIN_BYTE], &[keys::MAX_BYTE], 1);
        cache.on_event(&MembershipEvent::RangeChanged(meta.clone()));
        assert_eq!(cache.meta_range(), Some(meta.clone()));
        cache.invalidate(1);
        assert_eq!(cache.meta_range(), Some(meta));

        let newer = rd(1, &[keys::MIN_BYTE], b"m", 2);
        cache.update(newer.clone());
        assert_eq!(cache.meta_range(), Some(newer));
    }
}
