//! Extent cache — a small cache of raw compressed extent bytes, separate
//! from the page cache (§4.5 step 1).
//!
//! The original implementation this engine is modeled on reuses the page
//! cache's type for this, encoding `start_time_s = extent_block`; per the
//! spec's own open question, this crate gives the extent cache a
//! dedicated, independently-sized type instead (see `DESIGN.md`).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::Section;
use crate::storage::DatafileId;

/// `(section, datafile_id, extent_offset)`.
pub type ExtentCacheKey = (Section, DatafileId, u64);

struct Inner {
    entries: HashMap<ExtentCacheKey, Arc<Vec<u8>>>,
    lru: VecDeque<ExtentCacheKey>,
    bytes: usize,
}

/// Keyed, size-bounded LRU cache of raw (already-CRC-verified) extent
/// bytes, so a second concurrent query for the same extent skips the
/// disk read even if its `EPDL` was dispatched independently.
pub struct ExtentCache {
    inner: Mutex<Inner>,
    target_bytes: usize,
}

impl ExtentCache {
    pub fn new(target_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                lru: VecDeque::new(),
                bytes: 0,
            }),
            target_bytes,
        }
    }

    pub fn get(&self, key: &ExtentCacheKey) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.inner.lock();
        let hit = inner.entries.get(key).cloned();
        if hit.is_some() {
            if let Some(pos) = inner.lru.iter().position(|k| k == key) {
                inner.lru.remove(pos);
            }
            inner.lru.push_back(*key);
        }
        hit
    }

    pub fn insert(&self, key: ExtentCacheKey, bytes: Arc<Vec<u8>>) {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&key) {
            return;
        }
        inner.bytes += bytes.len();
        inner.entries.insert(key, bytes);
        inner.lru.push_back(key);
        while inner.bytes > self.target_bytes {
            let Some(victim) = inner.lru.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.entries.remove(&victim) {
                inner.bytes -= evicted.len();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_when_over_budget() {
        let cache = ExtentCache::new(100);
        cache.insert((Section::tier(0), 1, 0), Arc::new(vec![0u8; 60]));
        cache.insert((Section::tier(0), 1, 64), Arc::new(vec![0u8; 60]));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&(Section::tier(0), 1, 0)).is_none());
        assert!(cache.get(&(Section::tier(0), 1, 64)).is_some());
    }

    #[test]
    fn hit_reuses_bytes_without_reinsertion() {
        let cache = ExtentCache::new(1024);
        let key = (Section::tier(0), 1, 0);
        cache.insert(key, Arc::new(vec![1, 2, 3]));
        let a = cache.get(&key).unwrap();
        let b = cache.get(&key).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
