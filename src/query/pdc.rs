//! Page Details Control (`PDC`, C7) — one instance per query, listing
//! every page still needed from disk and carrying the cooperative
//! cancellation flag workers consult before dispatching a read.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::common::{MetricUuid, TimestampS};
use crate::registry::MetricMeta;

/// Lifecycle of one requested page, shared between the `PDC` that wants
/// it and the `EPDL` chain that will eventually deliver it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRequestState {
    Pending,
    Ready,
    Failed,
    FailedCancelled,
}

/// One page this query still needs, identified by `(metric, start_time)`.
pub struct PageRequest {
    pub metric: MetricUuid,
    pub start_time_s: TimestampS,
    state: AtomicU8,
    /// Filled in once the owning extent read completes; raw decoded page
    /// bytes plus its descriptor-derived shape. `None` while pending or on
    /// failure.
    result: Mutex<Option<Arc<Vec<u8>>>>,
    /// Entry count of the resolved page. Carried alongside `result`
    /// because the Gorilla tier can't derive it from byte length alone
    /// (see `PageDescr::Gorilla`).
    entries: AtomicU32,
}

impl PageRequest {
    pub fn new(metric: MetricUuid, start_time_s: TimestampS) -> Arc<Self> {
        Arc::new(Self {
            metric,
            start_time_s,
            state: AtomicU8::new(PageRequestState::Pending as u8),
            result: Mutex::new(None),
            entries: AtomicU32::new(0),
        })
    }

    pub fn state(&self) -> PageRequestState {
        match self.state.load(Ordering::Acquire) {
            0 => PageRequestState::Pending,
            1 => PageRequestState::Ready,
            2 => PageRequestState::Failed,
            _ => PageRequestState::FailedCancelled,
        }
    }

    pub fn complete_ready(&self, bytes: Arc<Vec<u8>>, entries: u32) {
        *self.result.lock() = Some(bytes);
        self.entries.store(entries, Ordering::Release);
        self.state.store(PageRequestState::Ready as u8, Ordering::Release);
    }

    pub fn entries(&self) -> u32 {
        self.entries.load(Ordering::Acquire)
    }

    pub fn complete_failed(&self, cancelled: bool) {
        let s = if cancelled {
            PageRequestState::FailedCancelled
        } else {
            PageRequestState::Failed
        };
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn take_result(&self) -> Option<Arc<Vec<u8>>> {
        self.result.lock().clone()
    }
}

/// Per-query page plan. Owns a reference into the metric registry so the
/// metric cannot be deleted while a query is in flight.
pub struct Pdc {
    pub metric: Arc<MetricMeta>,
    priority: AtomicU8,
    pub workers_should_stop: AtomicBool,
    pages: Mutex<Vec<Arc<PageRequest>>>,
    refcount: AtomicU32,
    prep_done: Notify,
    pages_done: Notify,
    prep_done_flag: AtomicBool,
    pages_done_flag: AtomicBool,
    pending_count: AtomicU32,
}

impl Pdc {
    pub fn new(metric: Arc<MetricMeta>, priority: u8) -> Arc<Self> {
        Arc::new(Self {
            metric,
            priority: AtomicU8::new(priority),
            workers_should_stop: AtomicBool::new(false),
            pages: Mutex::new(Vec::new()),
            refcount: AtomicU32::new(1),
            prep_done: Notify::new(),
            pages_done: Notify::new(),
            prep_done_flag: AtomicBool::new(false),
            pages_done_flag: AtomicBool::new(false),
            pending_count: AtomicU32::new(0),
        })
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Acquire)
    }

    pub fn acquire(self: &Arc<Self>) -> Arc<Self> {
        self.refcount.fetch_add(1, Ordering::AcqRel);
        Arc::clone(self)
    }

    pub fn release(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn request_stop(&self) {
        self.workers_should_stop.store(true, Ordering::Release);
    }

    pub fn should_stop(&self) -> bool {
        self.workers_should_stop.load(Ordering::Acquire)
    }

    /// Adds a page still to be fetched. Must be called before
    /// `mark_prep_done`.
    pub fn add_page_request(&self, req: Arc<PageRequest>) {
        self.pending_count.fetch_add(1, Ordering::AcqRel);
        self.pages.lock().push(req);
    }

    pub fn pages(&self) -> Vec<Arc<PageRequest>> {
        self.pages.lock().clone()
    }

    /// Signals that the page list is final — the planner/executor will
    /// add no more pages to this PDC.
    pub fn mark_prep_done(&self) {
        self.prep_done_flag.store(true, Ordering::Release);
        self.prep_done.notify_waiters();
    }

    pub async fn wait_prep_done(&self) {
        while !self.prep_done_flag.load(Ordering::Acquire) {
            self.prep_done.notified().await;
        }
    }

    /// Called by a worker once a page it owns transitions out of Pending.
    /// When every page has resolved, flips `pages_done`.
    pub fn note_page_resolved(&self) {
        let remaining = self.pending_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            self.pages_done_flag.store(true, Ordering::Release);
            self.pages_done.notify_waiters();
        }
    }

    pub async fn wait_pages_done(&self) {
        while !self.pages_done_flag.load(Ordering::Acquire) {
            self.pages_done.notified().await;
        }
    }

    pub fn all_pages_ready(&self) -> bool {
        self.pages
            .lock()
            .iter()
            .all(|p| p.state() == PageRequestState::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Section;
    use crate::registry::MetricRegistry;

    #[test]
    fn pending_count_reaches_zero_when_all_pages_resolve() {
        let registry = MetricRegistry::new();
        let metric = registry.acquire_by_uuid(Section::tier(0), MetricUuid::new_v4());
        let pdc = Pdc::new(metric, 5);
        let r1 = PageRequest::new(MetricUuid::new_v4(), 1000);
        let r2 = PageRequest::new(MetricUuid::new_v4(), 1060);
        pdc.add_page_request(Arc::clone(&r1));
        pdc.add_page_request(Arc::clone(&r2));
        pdc.mark_prep_done();
        assert!(!pdc.all_pages_ready());
        r1.complete_ready(Arc::new(vec![1, 2, 3]), 3);
        pdc.note_page_resolved();
        assert!(!pdc.pages_done_flag.load(Ordering::Acquire));
        r2.complete_failed(false);
        pdc.note_page_resolved();
        assert!(pdc.pages_done_flag.load(Ordering::Acquire));
    }

    #[test]
    fn stop_flag_is_observable_after_request() {
        let registry = MetricRegistry::new();
        let metric = registry.acquire_by_uuid(Section::tier(0), MetricUuid::new_v4());
        let pdc = Pdc::new(metric, 5);
        assert!(!pdc.should_stop());
        pdc.request_stop();
        assert!(pdc.should_stop());
    }
}
