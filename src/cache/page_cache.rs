//! Page Cache (`PGC`, C2) — a keyed cache with hot/dirty/clean states,
//! reference counting, a flush queue, and size-bounded eviction.
//!
//! ```text
//!         add_hot                flush_batch              evict
//!  none ─────────► HOT ──set_clean──► DIRTY ──written──► CLEAN ───► (freed)
//!                   │                                    ▲
//!                   └──────── hot_to_dirty ───────────────┘
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::common::{MetricUuid, Section, TimestampS};

/// `(section, metric_id, start_time_s)` — the page cache's keyspace.
pub type PageCacheKey = (Section, MetricUuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    Hot = 0,
    Dirty = 1,
    Clean = 2,
    Evicted = 3,
}

impl PageState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PageState::Hot,
            1 => PageState::Dirty,
            2 => PageState::Clean,
            _ => PageState::Evicted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Exact,
    First,
    Next,
    Closest,
}

/// A single page cache entry. The cache owns the allocation; callers hold
/// acquired references via the `refcount`. `data` is the opaque,
/// per-type-codec-encoded payload (the [`crate::page::Page`]'s bytes).
pub struct PageCacheEntry {
    pub metric: MetricUuid,
    pub section: Section,
    pub start_time_s: TimestampS,
    end_time_s: AtomicI64,
    pub update_every_s: u32,
    pub page_type: crate::common::PageType,
    state: AtomicU8,
    refcount: AtomicU32,
    size_bytes: AtomicUsize,
    entries: AtomicU32,
    pub data: RwLock<Vec<u8>>,
    io_errors: AtomicU32,
}

impl PageCacheEntry {
    #[allow(clippy::too_many_arguments)]
    fn new(
        metric: MetricUuid,
        section: Section,
        start_time_s: TimestampS,
        end_time_s: TimestampS,
        update_every_s: u32,
        page_type: crate::common::PageType,
        data: Vec<u8>,
        entries: u32,
        state: PageState,
    ) -> Arc<Self> {
        let size_bytes = data.len();
        Arc::new(Self {
            metric,
            section,
            start_time_s,
            end_time_s: AtomicI64::new(end_time_s),
            update_every_s,
            page_type,
            state: AtomicU8::new(state as u8),
            // Starts at 0, not 1: the cache's own slot in `buckets` is not
            // a reference. `add_and_acquire`'s `entry.acquire()` below is
            // what gives the caller its one reference; once released,
            // refcount legitimately reaches 0 and `evict_to_target` can
            // reclaim the page.
            refcount: AtomicU32::new(0),
            size_bytes: AtomicUsize::new(size_bytes),
            entries: AtomicU32::new(entries),
            data: RwLock::new(data),
            io_errors: AtomicU32::new(0),
        })
    }

    pub fn entries(&self) -> u32 {
        self.entries.load(Ordering::Acquire)
    }

    pub fn end_time_s(&self) -> TimestampS {
        self.end_time_s.load(Ordering::Acquire)
    }

    /// Monotonically grows the end time while HOT, as the collector
    /// appends samples.
    pub fn set_end_time(&self, t: TimestampS) {
        let mut cur = self.end_time_s.load(Ordering::Acquire);
        while t > cur {
            match self.end_time_s.compare_exchange_weak(
                cur,
                t,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn state(&self) -> PageState {
        PageState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: PageState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes.load(Ordering::Acquire)
    }

    pub fn set_size_bytes(&self, n: usize) {
        self.size_bytes.store(n, Ordering::Release);
    }

    fn acquire(self: &Arc<Self>) -> Arc<Self> {
        self.refcount.fetch_add(1, Ordering::AcqRel);
        Arc::clone(self)
    }

    pub fn record_io_error(&self) -> u32 {
        self.io_errors.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[derive(Default)]
pub struct PageCacheStats {
    pub cache_collisions: AtomicU64,
    pub evictions: AtomicU64,
    pub insertions: AtomicU64,
}

/// The page cache. Readers never block readers of distinct keys: each
/// `(section, metric)` bucket has its own lock around a small
/// `BTreeMap<start_time_s, _>`, so contention is scoped to one metric.
pub struct PageCache {
    buckets: DashMap<PageCacheKey, Mutex<BTreeMap<TimestampS, Arc<PageCacheEntry>>>>,
    clean_bytes: AtomicUsize,
    dirty_bytes: AtomicUsize,
    target_clean_bytes: usize,
    flush_queue: Mutex<VecDeque<Arc<PageCacheEntry>>>,
    pub stats: PageCacheStats,
}

impl PageCache {
    pub fn new(target_bytes: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            clean_bytes: AtomicUsize::new(0),
            dirty_bytes: AtomicUsize::new(0),
            target_clean_bytes: target_bytes,
            flush_queue: Mutex::new(VecDeque::new()),
            stats: PageCacheStats::default(),
        }
    }

    /// Atomically inserts or returns the existing page at `(section,
    /// metric, start_time_s)`. Either way the caller holds one reference.
    #[allow(clippy::too_many_arguments)]
    pub fn add_and_acquire(
        &self,
        section: Section,
        metric: MetricUuid,
        start_time_s: TimestampS,
        end_time_s: TimestampS,
        update_every_s: u32,
        page_type: crate::common::PageType,
        data: Vec<u8>,
        entries: u32,
        state: PageState,
    ) -> (Arc<PageCacheEntry>, bool) {
        let bucket = self
            .buckets
            .entry((section, metric))
            .or_insert_with(|| Mutex::new(BTreeMap::new()));
        let mut map = bucket.lock();
        if let Some(existing) = map.get(&start_time_s) {
            self.stats.cache_collisions.fetch_add(1, Ordering::Relaxed);
            return (existing.acquire(), false);
        }
        let entry = PageCacheEntry::new(
            metric,
            section,
            start_time_s,
            end_time_s,
            update_every_s,
            page_type,
            data,
            entries,
            state,
        );
        self.account_insert(&entry);
        map.insert(start_time_s, Arc::clone(&entry));
        self.stats.insertions.fetch_add(1, Ordering::Relaxed);
        (entry.acquire(), true)
    }

    pub fn get_and_acquire(
        &self,
        section: Section,
        metric: MetricUuid,
        start_time_s: TimestampS,
        mode: SearchMode,
    ) -> Option<Arc<PageCacheEntry>> {
        let bucket = self.buckets.get(&(section, metric))?;
        let map = bucket.lock();
        let found = match mode {
            SearchMode::Exact => map.get(&start_time_s).cloned(),
            SearchMode::First => map.values().next().cloned(),
            SearchMode::Next => map
                .range((std::ops::Bound::Excluded(start_time_s), std::ops::Bound::Unbounded))
                .next()
                .map(|(_, v)| v.clone()),
            SearchMode::Closest => {
                let before = map.range(..=start_time_s).next_back();
                let after = map.range(start_time_s..).next();
                match (before, after) {
                    (Some((bt, bv)), Some((at, av))) => {
                        if (start_time_s - bt).abs() <= (at - start_time_s).abs() {
                            Some(bv.clone())
                        } else {
                            Some(av.clone())
                        }
                    }
                    (Some((_, bv)), None) => Some(bv.clone()),
                    (None, Some((_, av))) => Some(av.clone()),
                    (None, None) => None,
                }
            }
        };
        found.map(|e| e.acquire())
    }

    /// Drops one reference. If it was the last and the page is EVICTED,
    /// its data is freed (dropping the last `Arc`).
    /// All non-evicted pages for `(section, metric)` whose span overlaps
    /// `[after, before]`, for the engine's synchronous load path. Unlike
    /// [`Self::get_and_acquire`] this does not bump refcounts — callers
    /// only read `data`/`entries` through the returned `Arc`s and drop
    /// them, they do not hold a long-lived acquisition.
    pub fn pages_in_range(
        &self,
        section: Section,
        metric: MetricUuid,
        after: TimestampS,
        before: TimestampS,
    ) -> Vec<Arc<PageCacheEntry>> {
        let Some(bucket) = self.buckets.get(&(section, metric)) else {
            return Vec::new();
        };
        let map = bucket.lock();
        map.values()
            .filter(|e| e.state() != PageState::Evicted && e.start_time_s <= before && e.end_time_s() >= after)
            .cloned()
            .collect()
    }

    pub fn release(&self, page: Arc<PageCacheEntry>) {
        let prev = page.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "page cache refcount underflow");
        // Dropping `page` here releases this call's strong reference; if
        // the page was already removed from the bucket map (EVICTED) and
        // this was the last outstanding acquisition, the entry's
        // allocation is freed when the Arc's strong count hits zero.
    }

    /// HOT -> DIRTY, releasing the caller's reference.
    pub fn hot_to_dirty_and_release(&self, page: Arc<PageCacheEntry>) {
        debug_assert_eq!(page.state(), PageState::Hot);
        page.set_state(PageState::Dirty);
        self.dirty_bytes.fetch_add(page.size_bytes(), Ordering::AcqRel);
        self.flush_queue.lock().push_back(Arc::clone(&page));
        self.release(page);
    }

    /// For pages found to be empty: either mark CLEAN-then-evicted, or
    /// just release the caller's reference.
    pub fn page_to_clean_evict_or_release(&self, page: Arc<PageCacheEntry>, evict: bool) {
        if evict {
            self.transition_to_clean(&page);
            self.evict_one(&page);
        }
        self.release(page);
    }

    /// DIRTY -> CLEAN, after a successful write to the datafile.
    pub fn mark_written(&self, page: &Arc<PageCacheEntry>) {
        debug_assert_eq!(page.state(), PageState::Dirty);
        self.dirty_bytes.fetch_sub(page.size_bytes(), Ordering::AcqRel);
        self.transition_to_clean(page);
    }

    fn transition_to_clean(&self, page: &Arc<PageCacheEntry>) {
        page.set_state(PageState::Clean);
        self.clean_bytes.fetch_add(page.size_bytes(), Ordering::AcqRel);
    }

    fn account_insert(&self, entry: &Arc<PageCacheEntry>) {
        match entry.state() {
            PageState::Clean => {
                self.clean_bytes.fetch_add(entry.size_bytes(), Ordering::AcqRel);
            }
            PageState::Dirty => {
                self.dirty_bytes.fetch_add(entry.size_bytes(), Ordering::AcqRel);
            }
            _ => {}
        }
    }

    /// Drains the flush queue in batches of at most `max` pages whose
    /// state is still DIRTY (some may have been re-flushed already).
    pub fn drain_flush_batch(&self, max: usize) -> Vec<Arc<PageCacheEntry>> {
        let mut queue = self.flush_queue.lock();
        let mut out = Vec::with_capacity(max.min(queue.len()));
        while out.len() < max {
            match queue.pop_front() {
                Some(p) if p.state() == PageState::Dirty => out.push(p),
                Some(_) => continue,
                None => break,
            }
        }
        out
    }

    pub fn requeue_for_flush(&self, pages: impl IntoIterator<Item = Arc<PageCacheEntry>>) {
        let mut queue = self.flush_queue.lock();
        for p in pages {
            queue.push_back(p);
        }
    }

    pub fn clean_bytes(&self) -> usize {
        self.clean_bytes.load(Ordering::Acquire)
    }

    pub fn dirty_bytes(&self) -> usize {
        self.dirty_bytes.load(Ordering::Acquire)
    }

    /// Evicts CLEAN pages until `clean_bytes <= target`. Never touches
    /// DIRTY pages directly — those only leave via the flush path.
    /// Returns the number of pages evicted.
    pub fn evict_to_target(&self) -> usize {
        let mut evicted = 0;
        for bucket in self.buckets.iter() {
            if self.clean_bytes() <= self.target_clean_bytes {
                break;
            }
            let mut map = bucket.value().lock();
            let victims: Vec<TimestampS> = map
                .iter()
                .filter(|(_, e)| e.state() == PageState::Clean && e.refcount() == 0)
                .map(|(t, _)| *t)
                .collect();
            for t in victims {
                if self.clean_bytes() <= self.target_clean_bytes {
                    break;
                }
                if let Some(entry) = map.remove(&t) {
                    self.evict_one(&entry);
                    evicted += 1;
                }
            }
        }
        evicted
    }

    fn evict_one(&self, entry: &Arc<PageCacheEntry>) {
        self.clean_bytes.fetch_sub(entry.size_bytes(), Ordering::AcqRel);
        entry.set_state(PageState::Evicted);
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PageType;

    fn metric() -> MetricUuid {
        MetricUuid::new_v4()
    }

    #[test]
    fn add_and_acquire_reports_collision_on_same_key() {
        let cache = PageCache::new(1 << 20);
        let m = metric();
        let (p1, added1) = cache.add_and_acquire(
            Section::tier(0),
            m,
            1000,
            1059,
            1,
            PageType::Array32,
            vec![0u8; 240],
            60,
            PageState::Hot,
        );
        assert!(added1);
        let (p2, added2) = cache.add_and_acquire(
            Section::tier(0),
            m,
            1000,
            1059,
            1,
            PageType::Array32,
            vec![0u8; 240],
            60,
            PageState::Hot,
        );
        assert!(!added2);
        assert_eq!(p1.start_time_s, p2.start_time_s);
        assert_eq!(cache.stats.cache_collisions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn hot_to_dirty_to_clean_transitions() {
        let cache = PageCache::new(1 << 20);
        let m = metric();
        let (p, _) = cache.add_and_acquire(
            Section::tier(0),
            m,
            1000,
            1059,
            1,
            PageType::Array32,
            vec![0u8; 240],
            60,
            PageState::Hot,
        );
        cache.hot_to_dirty_and_release(Arc::clone(&p));
        assert_eq!(p.state(), PageState::Dirty);
        assert_eq!(cache.dirty_bytes(), 240);

        let batch = cache.drain_flush_batch(10);
        assert_eq!(batch.len(), 1);
        cache.mark_written(&batch[0]);
        assert_eq!(batch[0].state(), PageState::Clean);
        assert_eq!(cache.clean_bytes(), 240);
    }

    #[test]
    fn eviction_never_touches_dirty_pages() {
        let cache = PageCache::new(0);
        let m = metric();
        let (p, _) = cache.add_and_acquire(
            Section::tier(0),
            m,
            1000,
            1059,
            1,
            PageType::Array32,
            vec![0u8; 240],
            60,
            PageState::Dirty,
        );
        cache.release(p);
        let evicted = cache.evict_to_target();
        assert_eq!(evicted, 0);
        assert_eq!(cache.dirty_bytes(), 240);
    }

    #[test]
    fn search_modes_find_expected_entries() {
        let cache = PageCache::new(1 << 20);
        let m = metric();
        for start in [1000, 2000, 3000] {
            let (p, _) = cache.add_and_acquire(
                Section::tier(0),
                m,
                start,
                start + 59,
                1,
                PageType::Array32,
                vec![0u8; 240],
                60,
                PageState::Clean,
            );
            cache.release(p);
        }
        let exact = cache
            .get_and_acquire(Section::tier(0), m, 2000, SearchMode::Exact)
            .unwrap();
        assert_eq!(exact.start_time_s, 2000);

        let first = cache
            .get_and_acquire(Section::tier(0), m, 0, SearchMode::First)
            .unwrap();
        assert_eq!(first.start_time_s, 1000);

        let next = cache
            .get_and_acquire(Section::tier(0), m, 1000, SearchMode::Next)
            .unwrap();
        assert_eq!(next.start_time_s, 2000);

        let closest = cache
            .get_and_acquire(Section::tier(0), m, 2600, SearchMode::Closest)
            .unwrap();
        assert_eq!(closest.start_time_s, 3000);
    }
}
