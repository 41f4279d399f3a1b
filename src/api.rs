//! External API surface (§6.4): the handle-based contract collectors and
//! queriers drive. Modeled as methods on owned handle types rather than
//! opaque integer handles, but one-to-one with the named operations:
//! `metric_get_or_create`, `metric_release`, `store_metric_{init,next,
//! finalize}`, `load_metric_{init,next,finalize}`,
//! `metric_retention_by_uuid`, `tier_disk_space_used`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cache::page_cache::PageState;
use crate::codec::codec_for;
use crate::common::{MetricUuid, PageType, Point, PointFlags, Section, TimestampS, Tier1Value};
use crate::engine::opcode::PRIORITY_NORMAL;
use crate::engine::write_path::OpenCacheEntry;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::query::pdc::{PageRequest, PageRequestState, Pdc};
use crate::query::{plan_query, AverageReducer, OutputPoint, QueryExecutor, Reducer, ReducerFactory, SourcePoint, TierRetention};
use crate::registry::MetricMeta;
use crate::storage::extent::parse_extent;
use crate::validation::{validate_page, PageValidationInput};

/// How long a caller whose page request lost the EPDL race (someone else
/// is already fetching the same extent) sleeps between polls of its own
/// `PageRequest` state. `Pdc`'s own waiters are async (`tokio::sync::
/// Notify`); the synchronous `load_range` API can't await them, so it
/// polls instead.
const EPDL_WAIT_POLL_INTERVAL: Duration = Duration::from_micros(200);

/// One collected sample. Raw tiers carry a single float; downsampled
/// tiers carry the `{min, max, sum, count, anomaly_count}` aggregate
/// (§6.3) — exactly one variant is meaningful per `PageType`.
#[derive(Debug, Clone, Copy)]
pub enum SampleValue {
    Raw(f64),
    Aggregate(Tier1Value),
}

impl SampleValue {
    fn into_point(self, timestamp_s: TimestampS, flags: PointFlags) -> Point {
        match self {
            SampleValue::Raw(value) => Point {
                timestamp_s,
                value,
                tier1: None,
                flags,
            },
            SampleValue::Aggregate(t1) => Point {
                timestamp_s,
                value: t1.average(),
                tier1: Some(t1),
                flags,
            },
        }
    }
}

struct PendingPage {
    start_s: Option<TimestampS>,
    points: Vec<Point>,
}

/// `store_metric_init`'s return value: a live collection session for one
/// metric. Buffers points in memory and hands a full (or finalized
/// partial) page to the page cache as DIRTY, ready for the write path.
pub struct CollectHandle {
    metric: Arc<MetricMeta>,
    section: Section,
    page_type: PageType,
    update_every_s: u32,
    page_capacity_entries: u32,
    last_collected_s: AtomicI64,
    pending: Mutex<PendingPage>,
    #[allow(dead_code)]
    metrics_group: Option<String>,
}

impl CollectHandle {
    fn new(metric: Arc<MetricMeta>, page_type: PageType, update_every_s: u32, page_capacity_entries: u32, metrics_group: Option<String>) -> Self {
        let section = metric.section;
        Self {
            metric,
            section,
            page_type,
            update_every_s,
            page_capacity_entries: page_capacity_entries.max(1),
            last_collected_s: AtomicI64::new(0),
            pending: Mutex::new(PendingPage {
                start_s: None,
                points: Vec::new(),
            }),
            metrics_group,
        }
    }

    /// `store_metric_next`: appends one sample, rejecting non-advancing
    /// timestamps with `PastCollection` (§8 "Write with point_time <=
    /// last_point_time is refused").
    pub fn next(&self, engine: &Engine, time: TimestampS, value: SampleValue, flags: PointFlags) -> Result<()> {
        let last = self.last_collected_s.load(Ordering::Acquire);
        if last != 0 && time <= last {
            return Err(EngineError::PastCollection(format!(
                "metric {} collected at {time} <= last collection time {last}",
                self.metric.uuid
            )));
        }
        self.last_collected_s.store(time, Ordering::Release);

        if self.metric.first_time_s() == 0 {
            self.metric.set_first_time_s_if_bigger(time);
        }
        self.metric.set_hot_latest_time_s(time);

        let mut pending = self.pending.lock();
        if pending.start_s.is_none() {
            pending.start_s = Some(time);
        }
        pending.points.push(value.into_point(time, flags));

        if pending.points.len() as u32 >= self.page_capacity_entries {
            self.flush_page(engine, &mut pending)?;
        }
        Ok(())
    }

    /// `store_metric_finalize`: flushes any partial page and reports
    /// whether the metric can be torn down (no buffered, no on-disk
    /// retention, and nobody else holds a reference).
    pub fn finalize(self, engine: &Engine) -> Result<bool> {
        {
            let mut pending = self.pending.lock();
            if !pending.points.is_empty() {
                self.flush_page(engine, &mut pending)?;
            }
        }
        let can_delete = self.metric.refcount() <= 1 && self.metric.has_zero_disk_retention();
        engine.registry().release(&self.metric);
        Ok(can_delete)
    }

    fn flush_page(&self, engine: &Engine, pending: &mut PendingPage) -> Result<()> {
        let start_s = pending.start_s.expect("flush_page called with no buffered points");
        let end_s = pending.points.last().expect("flush_page called with no buffered points").timestamp_s;
        let codec = codec_for(self.page_type);
        let data = codec.encode(&pending.points, self.update_every_s)?;
        let entries = pending.points.len() as u32;

        let (page, _added) = engine.page_cache().add_and_acquire(
            self.section,
            self.metric.uuid,
            start_s,
            end_s,
            self.update_every_s,
            self.page_type,
            data,
            entries,
            PageState::Hot,
        );
        engine.page_cache().hot_to_dirty_and_release(page);

        pending.start_s = None;
        pending.points.clear();
        Ok(())
    }
}

/// `load_metric_init`'s return value: a pull-based cursor over the query
/// result. The full result is computed eagerly (the executor already
/// walks the whole plan set), so `next` simply drains it; repeated calls
/// past the end keep returning `None`, matching the idempotence the
/// spec requires.
pub struct LoadHandle {
    points: VecDeque<OutputPoint>,
}

impl LoadHandle {
    fn new(points: Vec<OutputPoint>) -> Self {
        Self {
            points: points.into(),
        }
    }

    /// `load_metric_next`.
    pub fn next(&mut self) -> Option<OutputPoint> {
        self.points.pop_front()
    }

    /// `load_metric_finalize`: nothing left to release once the result
    /// vector has been handed over; kept as an explicit call per the
    /// named API so a caller's teardown code has a matching symbol.
    pub fn finalize(self) {}
}

fn source_points_from(points: &[Point], update_every_s: u32) -> VecDeque<SourcePoint> {
    points
        .iter()
        .map(|p| SourcePoint {
            start_s: p.timestamp_s - update_every_s.max(1) as i64,
            end_s: p.timestamp_s,
            value: if p.is_empty() { f64::NAN } else { p.value },
            flags: p.flags,
        })
        .collect()
}

impl Engine {
    /// `metric_get_or_create`.
    pub fn metric_get_or_create(&self, tier: u8, uuid: MetricUuid) -> Arc<MetricMeta> {
        self.registry().acquire_by_uuid(Section::tier(tier), uuid)
    }

    /// `metric_release`.
    pub fn metric_release(&self, metric: Arc<MetricMeta>) {
        self.registry().release_and_delete(metric);
    }

    /// `metric_retention_by_uuid`.
    pub fn metric_retention_by_uuid(&self, tier: u8, uuid: MetricUuid) -> Option<(TimestampS, TimestampS)> {
        let meta = self.registry().lookup(Section::tier(tier), uuid)?;
        Some((meta.first_time_s(), meta.last_time_s()))
    }

    /// `store_metric_init`.
    pub fn store_metric_init(
        &self,
        metric: Arc<MetricMeta>,
        update_every_s: u32,
        metrics_group: Option<String>,
        page_capacity_entries: u32,
    ) -> Result<CollectHandle> {
        let page_type = self.page_type(metric.section.tier_id())?;
        metric.set_update_every(update_every_s);
        Ok(CollectHandle::new(metric, page_type, update_every_s, page_capacity_entries, metrics_group))
    }

    /// `load_metric_init`. `tier_pin` is the spec's `priority`-adjacent
    /// concept of pinning a tier; `points_wanted` drives the planner's
    /// tier-scoring heuristic.
    pub fn load_metric_init(&self, uuid: MetricUuid, after: TimestampS, before: TimestampS, points_wanted: u32, tier_pin: Option<u8>) -> Result<LoadHandle> {
        let points = self.load_range(uuid, after, before, points_wanted, tier_pin, &AverageReducerFactoryRef)?;
        Ok(LoadHandle::new(points))
    }

    /// Runs one query end to end: builds tier retention from the
    /// registry, plans it (C9), decodes each plan's source points from
    /// the page cache and/or open cache + datafiles, and drives the
    /// executor (C10). `reducer_factory` lets a caller swap in its own
    /// time-grouping reducer; this crate only ships [`AverageReducer`].
    pub fn load_range(
        &self,
        uuid: MetricUuid,
        after: TimestampS,
        before: TimestampS,
        points_wanted: u32,
        tier_pin: Option<u8>,
        reducer_factory: &dyn ReducerFactory,
    ) -> Result<Vec<OutputPoint>> {
        let mut tiers = Vec::new();
        for tier in self.configured_tiers() {
            let section = Section::tier(tier);
            if let Some(meta) = self.registry().lookup(section, uuid) {
                if meta.last_time_s() > 0 && meta.first_time_s() <= meta.last_time_s() {
                    tiers.push(TierRetention {
                        tier,
                        page_type: self.page_type(tier)?,
                        first_time_s: meta.first_time_s(),
                        last_time_s: meta.last_time_s(),
                        update_every_s: meta.update_every_s().max(1),
                    });
                }
            }
        }

        let plans = plan_query(&tiers, after, before, points_wanted, tier_pin);
        if plans.is_empty() {
            return Ok(Vec::new());
        }

        let mut sources = Vec::with_capacity(plans.len());
        for plan in &plans {
            sources.push(self.decode_plan_points(uuid, plan)?);
        }

        let view_update_every_s = tiers
            .iter()
            .map(|t| t.update_every_s)
            .min()
            .unwrap_or(1);

        let mut executor = QueryExecutor::new(plans, sources);
        let mut reducer = reducer_factory.create();
        Ok(executor.run(after, before, view_update_every_s, reducer.as_mut()))
    }

    fn decode_plan_points(&self, uuid: MetricUuid, plan: &crate::query::QueryPlan) -> Result<VecDeque<SourcePoint>> {
        let section = Section::tier(plan.tier);
        let update_every_s = self
            .registry()
            .lookup(section, uuid)
            .map(|m| m.update_every_s().max(1))
            .unwrap_or(1);

        let mut out = VecDeque::new();
        let mut covered: Vec<(TimestampS, TimestampS)> = Vec::new();

        for entry in self.page_cache().pages_in_range(section, uuid, plan.after, plan.before) {
            let codec = codec_for(entry.page_type);
            let data = entry.data.read().clone();
            let points = codec.decode(&data, entry.entries(), entry.start_time_s, entry.update_every_s)?;
            out.extend(source_points_from(&points, entry.update_every_s));
            covered.push((entry.start_time_s, entry.end_time_s()));
        }

        let disk_entries: Vec<(TimestampS, OpenCacheEntry)> = self
            .open_cache()
            .range(section, uuid, plan.after, plan.before)
            .into_iter()
            .filter(|(start, _)| !covered.iter().any(|(s, e)| *start >= *s && *start <= *e))
            .collect();

        if !disk_entries.is_empty() {
            let metric = self.metric_get_or_create(plan.tier, uuid);
            let pdc = Pdc::new(Arc::clone(&metric), PRIORITY_NORMAL);
            let pages: Vec<Arc<PageRequest>> = disk_entries.iter().map(|(start, _)| PageRequest::new(uuid, *start)).collect();
            for page in &pages {
                pdc.add_page_request(Arc::clone(page));
            }
            pdc.mark_prep_done();

            let mut fetch_err = None;
            for ((_, oc_entry), page) in disk_entries.iter().zip(pages.into_iter()) {
                match self.resolve_page_via_epdl(plan.tier, *oc_entry, &pdc, page, update_every_s) {
                    Ok(points) => out.extend(source_points_from(&points, update_every_s)),
                    Err(e) => {
                        fetch_err = Some(e);
                        break;
                    }
                }
            }
            self.registry().release(&metric);
            if let Some(e) = fetch_err {
                return Err(e);
            }
        }

        let mut ordered: Vec<SourcePoint> = out.into_iter().collect();
        ordered.sort_by_key(|p| p.start_s);
        ordered.dedup_by_key(|p| p.end_s);
        Ok(ordered.into())
    }

    /// Routes one disk page through the `EPDL` dedup table (§8 scenario
    /// 5): the first caller for a given extent performs the physical
    /// read (extent-cache first, then the datafile) and resolves every
    /// query chained onto it; later callers for the same extent just
    /// wait on their own `PageRequest`.
    fn resolve_page_via_epdl(&self, tier: u8, entry: OpenCacheEntry, pdc: &Arc<Pdc>, page: Arc<PageRequest>, update_every_s: u32) -> Result<Vec<Point>> {
        let (epdl, is_new) = self
            .epdl_router()
            .route(entry.datafile_id, entry.offset, entry.extent_size, Arc::clone(pdc), Arc::clone(&page));

        if is_new {
            let read_result = self.read_extent_pages(tier, entry);
            match &read_result {
                Ok(resolved) => {
                    for chained in epdl.chained_requests() {
                        match resolved.iter().find(|(m, s, ..)| *m == chained.page.metric && *s == chained.page.start_time_s) {
                            Some((_, _, bytes, entries)) => chained.page.complete_ready(Arc::clone(bytes), *entries),
                            None => chained.page.complete_failed(false),
                        }
                        chained.pdc.note_page_resolved();
                    }
                }
                Err(_) => {
                    for chained in epdl.chained_requests() {
                        chained.page.complete_failed(false);
                        chained.pdc.note_page_resolved();
                    }
                }
            }
            self.epdl_router().retire(entry.datafile_id, entry.offset);
            read_result?;
        } else {
            while page.state() == PageRequestState::Pending {
                std::thread::sleep(EPDL_WAIT_POLL_INTERVAL);
            }
        }

        match page.state() {
            PageRequestState::Ready => {
                let bytes = page.take_result().expect("a Ready page request always carries a result");
                let codec = codec_for(self.page_type(tier)?);
                codec.decode(&bytes, page.entries(), page.start_time_s, update_every_s)
            }
            _ => Err(EngineError::InvalidExtent(format!(
                "page for metric {} at {} could not be resolved from extent at offset {}",
                page.metric, page.start_time_s, entry.offset
            ))),
        }
    }

    /// Reads and parses the extent at `entry`'s offset (checking the
    /// extent cache before the datafile, populating it on a miss), then
    /// validates and returns every page in it, keyed by `(metric,
    /// start_time_s)`, so one physical read can resolve every chained
    /// `PageRequest` for it rather than just the page the caller asked
    /// for.
    fn read_extent_pages(&self, tier: u8, entry: OpenCacheEntry) -> Result<Vec<(MetricUuid, TimestampS, Arc<Vec<u8>>, u32)>> {
        let key = (Section::tier(tier), entry.datafile_id, entry.offset);
        let bytes = match self.extent_cache().get(&key) {
            Some(cached) => cached,
            None => {
                let datafile = self.datafile_by_id(tier, entry.datafile_id)?;
                let raw = Arc::new(datafile.read_at(entry.offset, entry.extent_size as usize)?);
                self.extent_cache().insert(key, Arc::clone(&raw));
                raw
            }
        };

        let parsed = parse_extent(&bytes)?;
        let raw_pages = parsed.decode_pages(&bytes)?;
        let mut out = Vec::with_capacity(parsed.descriptors.len());
        for (descr, raw) in parsed.descriptors.iter().zip(raw_pages.into_iter()) {
            let entries = descr.entries().unwrap_or_else(|| {
                descr
                    .page_type
                    .fixed_point_size()
                    .map(|sz| (raw.len() / sz) as u32)
                    .unwrap_or(0)
            });
            let Some(validated) = validate_page(PageValidationInput {
                start_s: descr.start_time_s(),
                end_s: descr.end_time_s(),
                update_every_s: None,
                length: descr.page_length as usize,
                page_type: Some(descr.page_type),
                entries,
                now_s: None,
                overwrite_zero_update_every: true,
                have_read_error: false,
            }) else {
                continue;
            };
            out.push((descr.uuid, descr.start_time_s(), Arc::new(raw), validated.entries));
        }
        Ok(out)
    }
}

struct AverageReducerFactoryRef;
impl ReducerFactory for AverageReducerFactoryRef {
    fn create(&self) -> Box<dyn Reducer> {
        Box::new(AverageReducer::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::common::PointFlags;
    use tempfile::tempdir;

    fn single_tier_config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            dbfiles_path: dir.to_string_lossy().into_owned(),
            page_capacity_entries: 10,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn single_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(vec![single_tier_config(dir.path())]).unwrap();
        let uuid = MetricUuid::new_v4();
        let metric = engine.metric_get_or_create(0, uuid);
        let collect = engine.store_metric_init(metric, 1, None, 4096).unwrap();

        for t in 1000..1060 {
            collect.next(&engine, t, SampleValue::Raw((t - 1000) as f64), PointFlags::empty()).unwrap();
        }
        collect.finalize(&engine).unwrap();

        let (first, last) = engine.metric_retention_by_uuid(0, uuid).unwrap();
        assert_eq!(first, 1000);
        assert_eq!(last, 1059);

        let mut load = engine.load_metric_init(uuid, 999, 1059, 60, None).unwrap();
        let mut values = Vec::new();
        while let Some(p) = load.next() {
            values.push(p.value);
        }
        assert_eq!(values.len(), 60);
        assert_eq!(values[0], 0.0);
        assert_eq!(values[59], 59.0);
    }

    #[test]
    fn page_rollover_produces_contiguous_load_after_flush() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(vec![single_tier_config(dir.path())]).unwrap();
        let uuid = MetricUuid::new_v4();
        let metric = engine.metric_get_or_create(0, uuid);
        let collect = engine.store_metric_init(metric, 1, None, 10).unwrap();

        for t in 1..=25 {
            collect.next(&engine, t, SampleValue::Raw(t as f64), PointFlags::empty()).unwrap();
        }
        collect.finalize(&engine).unwrap();
        engine.flush_tier(0, 64).unwrap();

        let mut load = engine.load_metric_init(uuid, 0, 25, 25, None).unwrap();
        let mut count = 0;
        while load.next().is_some() {
            count += 1;
        }
        assert_eq!(count, 25);
    }

    #[test]
    fn concurrent_queries_for_one_extent_merge_into_one_physical_read() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(vec![single_tier_config(dir.path())]).unwrap();
        let uuid = MetricUuid::new_v4();
        let metric = engine.metric_get_or_create(0, uuid);
        let collect = engine.store_metric_init(metric, 1, None, 10).unwrap();
        for t in 1..=10 {
            collect.next(&engine, t, SampleValue::Raw(t as f64), PointFlags::empty()).unwrap();
        }
        collect.finalize(&engine).unwrap();
        engine.flush_tier(0, 64).unwrap();

        let oc_entry = engine.open_cache().range(Section::tier(0), uuid, 1, 10)[0].1;

        let metric1 = engine.metric_get_or_create(0, uuid);
        let pdc1 = Pdc::new(Arc::clone(&metric1), PRIORITY_NORMAL);
        let page1 = PageRequest::new(uuid, 1);
        pdc1.add_page_request(Arc::clone(&page1));
        pdc1.mark_prep_done();

        let metric2 = engine.metric_get_or_create(0, uuid);
        let pdc2 = Pdc::new(Arc::clone(&metric2), PRIORITY_NORMAL);
        let page2 = PageRequest::new(uuid, 1);
        pdc2.add_page_request(Arc::clone(&page2));
        pdc2.mark_prep_done();

        // Both queries land on the same extent before either has read
        // anything — the second `route` call merges onto the first's EPDL
        // instead of dispatching its own read (§8 scenario 5).
        let (epdl, is_new1) = engine.epdl_router().route(oc_entry.datafile_id, oc_entry.offset, oc_entry.extent_size, Arc::clone(&pdc1), Arc::clone(&page1));
        assert!(is_new1);
        let (_, is_new2) = engine.epdl_router().route(oc_entry.datafile_id, oc_entry.offset, oc_entry.extent_size, Arc::clone(&pdc2), Arc::clone(&page2));
        assert!(!is_new2);
        assert_eq!(engine.epdl_router().pages_load_extent_merged(), 1);

        // The `is_new` caller performs the one physical read and resolves
        // every chained request from it.
        let resolved = engine.read_extent_pages(0, oc_entry).unwrap();
        for chained in epdl.chained_requests() {
            match resolved.iter().find(|(m, s, ..)| *m == chained.page.metric && *s == chained.page.start_time_s) {
                Some((_, _, bytes, entries)) => chained.page.complete_ready(Arc::clone(bytes), *entries),
                None => chained.page.complete_failed(false),
            }
            chained.pdc.note_page_resolved();
        }
        engine.epdl_router().retire(oc_entry.datafile_id, oc_entry.offset);

        assert_eq!(page1.state(), PageRequestState::Ready);
        assert_eq!(page2.state(), PageRequestState::Ready);
        let codec = codec_for(engine.page_type(0).unwrap());
        let bytes1 = page1.take_result().unwrap();
        let points1 = codec.decode(&bytes1, page1.entries(), page1.start_time_s, 1).unwrap();
        assert_eq!(points1.len(), 10);

        engine.registry().release(&metric1);
        engine.registry().release(&metric2);
    }

    #[test]
    fn duplicate_and_past_collection_are_refused() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(vec![single_tier_config(dir.path())]).unwrap();
        let uuid = MetricUuid::new_v4();
        let metric = engine.metric_get_or_create(0, uuid);
        let collect = engine.store_metric_init(metric, 1, None, 4096).unwrap();

        collect.next(&engine, 100, SampleValue::Raw(1.0), PointFlags::empty()).unwrap();
        assert!(collect.next(&engine, 100, SampleValue::Raw(2.0), PointFlags::empty()).is_err());
        assert!(collect.next(&engine, 99, SampleValue::Raw(3.0), PointFlags::empty()).is_err());

        collect.finalize(&engine).unwrap();
        let (_, last) = engine.metric_retention_by_uuid(0, uuid).unwrap();
        assert_eq!(last, 100);
    }
}
