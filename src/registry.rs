//! Metric Registry (`MRG`, C3) — acquire/release handles for metrics
//! keyed by `(section, uuid)`, plus retention recalculation (§4.8).

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::common::{MetricUuid, Section, TimestampS};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::storage::journal_v2::JournalV2;

/// A reference-counted metric entry. `first_time_s <= last_time_s`
/// whenever retention is non-zero (§3 invariant); `update_every_s > 0`
/// once the metric has ever been collected.
pub struct MetricMeta {
    pub id: u64,
    pub uuid: MetricUuid,
    pub section: Section,
    first_time_s: AtomicI64,
    hot_latest_time_s: AtomicI64,
    clean_latest_time_s: AtomicI64,
    update_every_s: AtomicU32,
    refcount: AtomicU32,
}

impl MetricMeta {
    pub fn first_time_s(&self) -> TimestampS {
        self.first_time_s.load(Ordering::Acquire)
    }

    pub fn last_time_s(&self) -> TimestampS {
        self.hot_latest_time_s
            .load(Ordering::Acquire)
            .max(self.clean_latest_time_s.load(Ordering::Acquire))
    }

    pub fn update_every_s(&self) -> u32 {
        self.update_every_s.load(Ordering::Acquire)
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn set_update_every(&self, u: u32) {
        self.update_every_s.store(u, Ordering::Release);
    }

    /// Only ever moves `first_time_s` forward (ages the front of
    /// retention), never backward.
    pub fn set_first_time_s_if_bigger(&self, t: TimestampS) {
        let mut cur = self.first_time_s.load(Ordering::Acquire);
        while t > cur {
            match self
                .first_time_s
                .compare_exchange_weak(cur, t, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    fn bump_if_bigger(field: &AtomicI64, t: TimestampS) {
        let mut cur = field.load(Ordering::Acquire);
        while t > cur {
            match field.compare_exchange_weak(cur, t, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn set_hot_latest_time_s(&self, t: TimestampS) {
        Self::bump_if_bigger(&self.hot_latest_time_s, t);
    }

    pub fn set_clean_latest_time_s(&self, t: TimestampS) {
        Self::bump_if_bigger(&self.clean_latest_time_s, t);
    }

    pub fn has_zero_disk_retention(&self) -> bool {
        self.clean_latest_time_s.load(Ordering::Acquire) == 0
            && self.first_time_s.load(Ordering::Acquire) == 0
    }
}

/// Maps `(section, uuid) -> metric`, handing out refcounted handles.
pub struct MetricRegistry {
    by_key: DashMap<(Section, MetricUuid), Arc<MetricMeta>>,
    by_id: DashMap<u64, (Section, MetricUuid)>,
    next_id: AtomicU64,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self {
            by_key: DashMap::new(),
            by_id: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Gets-or-creates the metric and bumps its refcount.
    pub fn acquire_by_uuid(&self, section: Section, uuid: MetricUuid) -> Arc<MetricMeta> {
        if let Some(existing) = self.by_key.get(&(section, uuid)) {
            existing.refcount.fetch_add(1, Ordering::AcqRel);
            return Arc::clone(existing.value());
        }
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let meta = Arc::new(MetricMeta {
            id,
            uuid,
            section,
            first_time_s: AtomicI64::new(0),
            hot_latest_time_s: AtomicI64::new(0),
            clean_latest_time_s: AtomicI64::new(0),
            update_every_s: AtomicU32::new(0),
            refcount: AtomicU32::new(1),
        });
        self.by_key.insert((section, uuid), Arc::clone(&meta));
        self.by_id.insert(id, (section, uuid));
        meta
    }

    pub fn acquire_by_id(&self, id: u64) -> Option<Arc<MetricMeta>> {
        let key = *self.by_id.get(&id)?;
        let entry = self.by_key.get(&key)?;
        entry.refcount.fetch_add(1, Ordering::AcqRel);
        Some(Arc::clone(entry.value()))
    }

    pub fn release(&self, meta: &Arc<MetricMeta>) {
        meta.refcount.fetch_sub(1, Ordering::AcqRel);
    }

    /// Releases and, if the refcount has reached zero and the metric has
    /// zero on-disk retention, removes it from the registry entirely.
    pub fn release_and_delete(&self, meta: Arc<MetricMeta>) {
        let remaining = meta.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && meta.has_zero_disk_retention() {
            self.by_key.remove(&(meta.section, meta.uuid));
            self.by_id.remove(&meta.id);
        }
    }

    pub fn lookup(&self, section: Section, uuid: MetricUuid) -> Option<Arc<MetricMeta>> {
        self.by_key.get(&(section, uuid)).map(|e| Arc::clone(e.value()))
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A minimal view of the open cache (`(section, metric, start_time) ->
/// (datafile, offset, length)`) that retention recalculation consults as
/// a last resort, per §4.8 step 3.
pub trait OpenCacheLookup {
    fn earliest_start_s(&self, section: Section, metric: MetricUuid) -> Option<TimestampS>;
}

/// Recomputes `first_time_s` for every metric in a datafile about to be
/// deleted, per §4.8.
///
/// For each metric, scans the *remaining* (non-doomed) datafiles' journal
/// v2 indexes in order and takes the earliest `delta_start_s +
/// journal_start_s` found, stopping early once a metric has been found in
/// `retention_scan_max_datafiles` datafiles or accumulated more than
/// `retention_scan_max_pages` pages (both tunable, per the spec's own
/// open question about these being heuristic constants).
pub fn recalculate_retention(
    registry: &MetricRegistry,
    section: Section,
    doomed_journal: &JournalV2,
    remaining_journals: &[&JournalV2],
    open_cache: &dyn OpenCacheLookup,
    config: &EngineConfig,
) -> Result<()> {
    for uuid in doomed_journal.metrics.keys() {
        let meta = match registry.lookup(section, *uuid) {
            Some(m) => m,
            None => continue,
        };

        let mut best: Option<TimestampS> = None;
        let mut datafiles_matched = 0u32;
        let mut pages_seen = 0u32;

        for journal in remaining_journals {
            if datafiles_matched >= config.retention_scan_max_datafiles
                || pages_seen >= config.retention_scan_max_pages
            {
                break;
            }
            if let Some(entries) = journal.metrics.get(uuid) {
                if entries.is_empty() {
                    continue;
                }
                datafiles_matched += 1;
                pages_seen += entries.len() as u32;
                if let Some(earliest) = journal.earliest_start_s(uuid) {
                    best = Some(best.map_or(earliest, |b| b.min(earliest)));
                }
            }
        }

        if best.is_none() {
            best = open_cache.earliest_start_s(section, *uuid);
        }

        match best {
            Some(t) => meta.set_first_time_s_if_bigger(t),
            None => {
                // Zero on-disk and zero open-cache retention. If also
                // unreferenced, drop the metric entirely.
                if meta.refcount() <= 1 {
                    registry.release_and_delete(Arc::clone(&meta));
                    continue;
                }
            }
        }
        registry.release(&meta);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_get_or_create_then_release_is_idempotent() {
        let registry = MetricRegistry::new();
        let uuid = MetricUuid::new_v4();
        let section = Section::tier(0);
        let h1 = registry.acquire_by_uuid(section, uuid);
        let h2 = registry.acquire_by_uuid(section, uuid);
        assert_eq!(h1.uuid, h2.uuid);
        assert_eq!(h1.refcount(), 2);
        registry.release(&h1);
        registry.release(&h2);
        assert_eq!(registry.lookup(section, uuid).unwrap().refcount(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn first_last_time_invariant_holds_after_updates() {
        let registry = MetricRegistry::new();
        let uuid = MetricUuid::new_v4();
        let section = Section::tier(0);
        let h = registry.acquire_by_uuid(section, uuid);
        h.set_first_time_s_if_bigger(1000);
        h.set_hot_latest_time_s(1100);
        h.set_clean_latest_time_s(1050);
        assert!(h.first_time_s() <= h.last_time_s());
        assert_eq!(h.last_time_s(), 1100);
        // first_time never regresses
        h.set_first_time_s_if_bigger(500);
        assert_eq!(h.first_time_s(), 1000);
    }

    struct NoOpenCache;
    impl OpenCacheLookup for NoOpenCache {
        fn earliest_start_s(&self, _s: Section, _m: MetricUuid) -> Option<TimestampS> {
            None
        }
    }

    #[test]
    fn retention_recalculation_picks_earliest_remaining_datafile() {
        use crate::storage::extent::ExtentDescriptor;
        use crate::common::PageType;
        use crate::page::PageDescr;

        let registry = MetricRegistry::new();
        let section = Section::tier(0);
        let uuid = MetricUuid::new_v4();
        let h = registry.acquire_by_uuid(section, uuid);
        h.set_first_time_s_if_bigger(1000);
        registry.release(&h);

        let descr = |start: u64, end: u64| ExtentDescriptor {
            uuid,
            page_type: PageType::Array32,
            page_length: 240,
            start_time_ut: start,
            descr: PageDescr::Array { end_time_ut: end },
        };

        let doomed = JournalV2::build(1000, &[(0, vec![descr(1000, 1059)])]);
        let remaining = JournalV2::build(2000, &[(0, vec![descr(2000, 2059)])]);

        let config = EngineConfig::default();
        let cache = NoOpenCache;
        recalculate_retention(&registry, section, &doomed, &[&remaining], &cache, &config).unwrap();

        let meta = registry.lookup(section, uuid).unwrap();
        assert_eq!(meta.first_time_s(), 2000);
    }
}
