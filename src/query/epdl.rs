//! Extent Page Details List (`EPDL`, C8) — dedups concurrent readers of
//! the same on-disk extent into a single physical read, per-datafile.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::query::pdc::{PageRequest, Pdc};
use crate::storage::DatafileId;

/// Routing key: one extent read is identified by the datafile it lives in
/// and its byte offset within that datafile.
pub type ExtentKey = (DatafileId, u64);

/// One page request chained onto an `Epdl`, tagging which `Pdc` it came
/// from (needed to call back `note_page_resolved` on completion).
pub struct ChainedPageRequest {
    pub pdc: Arc<Pdc>,
    pub page: Arc<PageRequest>,
}

/// All the (possibly many) concurrent queries waiting on one physical
/// extent read.
pub struct Epdl {
    pub datafile_id: DatafileId,
    pub extent_offset: u64,
    pub extent_size: u32,
    priority: AtomicU8,
    chained: Mutex<Vec<ChainedPageRequest>>,
    dispatched: AtomicBool,
    merged_count: AtomicU32,
}

impl Epdl {
    fn new(datafile_id: DatafileId, extent_offset: u64, extent_size: u32, priority: u8) -> Arc<Self> {
        Arc::new(Self {
            datafile_id,
            extent_offset,
            extent_size,
            priority: AtomicU8::new(priority),
            chained: Mutex::new(Vec::new()),
            dispatched: AtomicBool::new(false),
            merged_count: AtomicU32::new(0),
        })
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Acquire)
    }

    /// Bumps this EPDL's effective priority if the incoming request wants
    /// a higher one (lower numeric value = higher priority, matching the
    /// page cache / opcode queue convention elsewhere in this crate).
    fn bump_priority(&self, incoming: u8) {
        let mut cur = self.priority.load(Ordering::Acquire);
        while incoming < cur {
            match self
                .priority
                .compare_exchange_weak(cur, incoming, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    fn push(&self, entry: ChainedPageRequest) {
        self.bump_priority(entry.pdc.priority());
        self.chained.lock().push(entry);
    }

    pub fn mark_dispatched(&self) -> bool {
        !self.dispatched.swap(true, Ordering::AcqRel)
    }

    pub fn merged_count(&self) -> u32 {
        self.merged_count.load(Ordering::Acquire)
    }

    /// True if every chained `Pdc` has requested cancellation; the worker
    /// should then skip the physical read entirely.
    pub fn all_cancelled(&self) -> bool {
        let chained = self.chained.lock();
        !chained.is_empty() && chained.iter().all(|c| c.pdc.should_stop())
    }

    pub fn chained_requests(&self) -> Vec<ChainedPageRequest> {
        let chained = self.chained.lock();
        chained
            .iter()
            .map(|c| ChainedPageRequest {
                pdc: Arc::clone(&c.pdc),
                page: Arc::clone(&c.page),
            })
            .collect()
    }

    /// Marks every chained page `FAILED | CANCELLED` and resolves their
    /// owning `Pdc`s, used when `all_cancelled` is true.
    pub fn fail_all_cancelled(&self) {
        for c in self.chained_requests() {
            c.page.complete_failed(true);
            c.pdc.note_page_resolved();
        }
    }
}

/// Buckets extent reads by `(datafile, offset)` so concurrent queries for
/// the same extent merge into one physical I/O.
pub struct EpdlRouter {
    inflight: DashMap<ExtentKey, Arc<Epdl>>,
    pages_load_extent_merged: AtomicU32,
}

impl EpdlRouter {
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
            pages_load_extent_merged: AtomicU32::new(0),
        }
    }

    pub fn pages_load_extent_merged(&self) -> u32 {
        self.pages_load_extent_merged.load(Ordering::Acquire)
    }

    /// Routes one page request to the `EPDL` for its extent, creating a
    /// fresh one if none is in flight. Returns the `Epdl` and whether it
    /// was newly created (the caller should only dispatch a physical read
    /// when `true`).
    pub fn route(
        &self,
        datafile_id: DatafileId,
        extent_offset: u64,
        extent_size: u32,
        pdc: Arc<Pdc>,
        page: Arc<PageRequest>,
    ) -> (Arc<Epdl>, bool) {
        let key = (datafile_id, extent_offset);
        let priority = pdc.priority();
        if let Some(existing) = self.inflight.get(&key) {
            let epdl = Arc::clone(existing.value());
            epdl.push(ChainedPageRequest { pdc, page });
            self.pages_load_extent_merged.fetch_add(1, Ordering::AcqRel);
            return (epdl, false);
        }
        let epdl = Epdl::new(datafile_id, extent_offset, extent_size, priority);
        epdl.push(ChainedPageRequest { pdc, page });
        self.inflight.insert(key, Arc::clone(&epdl));
        (epdl, true)
    }

    /// Removes the completed extent's entry so a future read re-dispatches.
    pub fn retire(&self, datafile_id: DatafileId, extent_offset: u64) {
        self.inflight.remove(&(datafile_id, extent_offset));
    }
}

impl Default for EpdlRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{MetricUuid, Section};
    use crate::registry::MetricRegistry;

    fn make_pdc(priority: u8) -> Arc<Pdc> {
        let registry = MetricRegistry::new();
        let metric = registry.acquire_by_uuid(Section::tier(0), MetricUuid::new_v4());
        Pdc::new(metric, priority)
    }

    #[test]
    fn second_query_for_same_extent_merges_instead_of_redispatching() {
        let router = EpdlRouter::new();
        let pdc1 = make_pdc(5);
        let page1 = PageRequest::new(MetricUuid::new_v4(), 1000);
        let (epdl1, is_new1) = router.route(1, 4096, 8192, pdc1, page1);
        assert!(is_new1);

        let pdc2 = make_pdc(5);
        let page2 = PageRequest::new(MetricUuid::new_v4(), 1060);
        let (epdl2, is_new2) = router.route(1, 4096, 8192, pdc2, page2);
        assert!(!is_new2);
        assert!(Arc::ptr_eq(&epdl1, &epdl2));
        assert_eq!(router.pages_load_extent_merged(), 1);
        assert_eq!(epdl1.chained_requests().len(), 2);
    }

    #[test]
    fn higher_priority_arrival_bumps_epdl_priority() {
        let router = EpdlRouter::new();
        let pdc1 = make_pdc(10);
        let page1 = PageRequest::new(MetricUuid::new_v4(), 1000);
        let (epdl, _) = router.route(1, 0, 8192, pdc1, page1);
        assert_eq!(epdl.priority(), 10);

        let pdc2 = make_pdc(2);
        let page2 = PageRequest::new(MetricUuid::new_v4(), 1060);
        router.route(1, 0, 8192, pdc2, page2);
        assert_eq!(epdl.priority(), 2);
    }

    #[test]
    fn all_cancelled_only_when_every_chained_pdc_stopped() {
        let router = EpdlRouter::new();
        let pdc1 = make_pdc(5);
        let page1 = PageRequest::new(MetricUuid::new_v4(), 1000);
        let (epdl, _) = router.route(1, 0, 8192, Arc::clone(&pdc1), page1);

        let pdc2 = make_pdc(5);
        let page2 = PageRequest::new(MetricUuid::new_v4(), 1060);
        router.route(1, 0, 8192, Arc::clone(&pdc2), page2);

        pdc1.request_stop();
        assert!(!epdl.all_cancelled());
        pdc2.request_stop();
        assert!(epdl.all_cancelled());
    }
}
