//! Top-level orchestration: wires the registry, page cache, extent
//! cache, per-tier datafiles/journals, and the write path together
//! behind the §6.4 API surface (`crate::api`).

pub mod event_loop;
pub mod opcode;
pub mod write_path;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::cache::{ExtentCache, PageCache};
use crate::common::{MetricUuid, PageType, Section, TimestampS};
use crate::compression::CompressionAlgorithm;
use crate::config::EngineConfig;
use crate::engine::opcode::{Command, Opcode};
use crate::engine::event_loop::OpcodeHandler;
use crate::engine::write_path::{FlushOutcome, OpenCache, OpenCacheEntry};
use crate::error::{EngineError, Result};
use crate::registry::{self, MetricRegistry, OpenCacheLookup};
use crate::storage::datafile::{Datafile, DatafileId};
use crate::storage::extent::ExtentDescriptor;
use crate::storage::journal_v1::JournalV1;
use crate::storage::journal_v2::JournalV2;

/// A datafile rotates once it would exceed this many bytes, independent
/// of `EngineConfig::max_disk_space_bytes` (which bounds how much *total*
/// history a tier keeps, not any one file's size).
const DEFAULT_DATAFILE_SIZE_BYTES: u64 = 512 * 1024 * 1024;

/// Where a page landed on disk, indexed by `(section, metric)` so the
/// load path can range-scan it the same way the page cache does.
pub struct OpenCacheIndex {
    buckets: DashMap<(Section, MetricUuid), Mutex<BTreeMap<TimestampS, OpenCacheEntry>>>,
}

impl OpenCacheIndex {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Entries possibly overlapping `[after, before]`: everything keyed
    /// in that range, plus the one entry immediately before it (a page
    /// starting earlier can still extend into the requested window).
    pub fn range(&self, section: Section, metric: MetricUuid, after: TimestampS, before: TimestampS) -> Vec<(TimestampS, OpenCacheEntry)> {
        let Some(bucket) = self.buckets.get(&(section, metric)) else {
            return Vec::new();
        };
        let map = bucket.lock();
        let mut out = Vec::new();
        if let Some((&t, &e)) = map.range(..after).next_back() {
            out.push((t, e));
        }
        out.extend(map.range(after..=before).map(|(&t, &e)| (t, e)));
        out
    }
}

impl Default for OpenCacheIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenCache for OpenCacheIndex {
    fn promote(&self, section: Section, metric: MetricUuid, start_time_s: TimestampS, entry: OpenCacheEntry) {
        self.buckets
            .entry((section, metric))
            .or_insert_with(|| Mutex::new(BTreeMap::new()))
            .lock()
            .insert(start_time_s, entry);
    }
}

impl OpenCacheLookup for OpenCacheIndex {
    fn earliest_start_s(&self, section: Section, metric: MetricUuid) -> Option<TimestampS> {
        self.buckets.get(&(section, metric)).and_then(|b| b.lock().keys().next().copied())
    }
}

/// Per-tier datafile list and journals. One `TierState` per configured
/// `EngineConfig::tier`.
struct TierState {
    page_type: PageType,
    tier: u8,
    dbfiles_dir: PathBuf,
    max_datafile_size: u64,
    config: EngineConfig,
    datafiles: Mutex<Vec<Arc<Datafile>>>,
    journals: DashMap<DatafileId, Arc<JournalV1>>,
    journals_v2: DashMap<DatafileId, Arc<JournalV2>>,
    /// Extents written to the current datafile since it was opened,
    /// accumulated so the outgoing datafile can be sealed into a journal
    /// v2 index the moment it stops being written to (§4.7).
    pending_extents: Mutex<Vec<(u64, Vec<ExtentDescriptor>)>>,
    next_id: AtomicU32,
}

impl TierState {
    fn new(config: &EngineConfig, registry: &MetricRegistry, open_cache: &dyn OpenCacheLookup) -> Result<Self> {
        let dir = PathBuf::from(&config.dbfiles_path).join(format!("tier{}", config.tier));
        let state = Self {
            page_type: config.page_type,
            tier: config.tier,
            dbfiles_dir: dir,
            max_datafile_size: config.max_disk_space_bytes.min(DEFAULT_DATAFILE_SIZE_BYTES).max(4096),
            config: config.clone(),
            datafiles: Mutex::new(Vec::new()),
            journals: DashMap::new(),
            journals_v2: DashMap::new(),
            pending_extents: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
        };
        state.rotate(registry, open_cache)?;
        Ok(state)
    }

    /// Records the extent a just-completed flush wrote, so it's included
    /// when this datafile is eventually sealed.
    fn record_flush(&self, outcome: &FlushOutcome) {
        if let Some(offset) = outcome.extent_offset {
            if !outcome.descriptors.is_empty() {
                self.pending_extents.lock().push((offset, outcome.descriptors.clone()));
            }
        }
    }

    /// Builds and persists a journal v2 index for the datafile currently
    /// being rotated away from, then recomputes retention for every
    /// metric it holds against the journal v2 indexes already sealed
    /// (§4.7, §4.8). A no-op if nothing has been flushed to it yet.
    fn seal_current(&self, registry: &MetricRegistry, open_cache: &dyn OpenCacheLookup) -> Result<()> {
        let Some(outgoing_id) = self.datafiles.lock().last().map(|d| d.id) else {
            return Ok(());
        };
        let extents = std::mem::take(&mut *self.pending_extents.lock());
        if extents.is_empty() {
            return Ok(());
        }
        let start_time_ut = extents
            .iter()
            .flat_map(|(_, ds)| ds.iter().map(|d| d.start_time_ut))
            .min()
            .unwrap_or(0);
        let index = JournalV2::build(start_time_ut, &extents);
        index.write_to(&self.dbfiles_dir, self.tier, outgoing_id)?;
        let index = Arc::new(index);
        self.journals_v2.insert(outgoing_id, Arc::clone(&index));

        let remaining: Vec<Arc<JournalV2>> = self
            .journals_v2
            .iter()
            .filter(|e| *e.key() != outgoing_id)
            .map(|e| Arc::clone(e.value()))
            .collect();
        let remaining_refs: Vec<&JournalV2> = remaining.iter().map(|a| a.as_ref()).collect();
        registry::recalculate_retention(registry, Section::tier(self.tier), &index, &remaining_refs, open_cache, &self.config)
    }

    /// Seals the outgoing datafile, then opens a fresh datafile/journal
    /// pair and makes it the current one (§4.2 step 6, §4.7).
    fn rotate(&self, registry: &MetricRegistry, open_cache: &dyn OpenCacheLookup) -> Result<Arc<Datafile>> {
        self.seal_current(registry, open_cache)?;
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let datafile = Arc::new(Datafile::create(&self.dbfiles_dir, self.tier, id, self.max_datafile_size)?);
        let journal = Arc::new(JournalV1::create(&self.dbfiles_dir, self.tier, id)?);
        self.journals.insert(id, journal);
        self.datafiles.lock().push(Arc::clone(&datafile));
        Ok(datafile)
    }

    fn current_datafile(&self) -> Arc<Datafile> {
        Arc::clone(self.datafiles.lock().last().expect("tier always has at least one datafile"))
    }

    fn journal_for(&self, datafile: &Datafile) -> Result<Arc<JournalV1>> {
        self.journals
            .get(&datafile.id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| EngineError::Invariant(format!("no journal for datafile {}", datafile.id)))
    }

    fn datafile_by_id(&self, id: DatafileId) -> Result<Arc<Datafile>> {
        self.datafiles
            .lock()
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| EngineError::Invariant(format!("unknown datafile {id}")))
    }

    fn disk_space_used(&self) -> u64 {
        self.datafiles.lock().iter().map(|d| d.current_size()).sum()
    }
}

/// Everything the §6.4 API needs: registry, caches, and one `TierState`
/// per configured tier. Construct one `Engine` per instance (this crate
/// models a single instance; see [`crate::common::Section`]).
pub struct Engine {
    registry: MetricRegistry,
    page_cache: PageCache,
    extent_cache: ExtentCache,
    open_cache: OpenCacheIndex,
    epdl_router: crate::query::epdl::EpdlRouter,
    tiers: HashMap<u8, TierState>,
}

impl Engine {
    pub fn new(configs: Vec<EngineConfig>) -> Result<Self> {
        if configs.is_empty() {
            return Err(EngineError::Configuration("at least one tier config is required".into()));
        }
        for c in &configs {
            c.validate()?;
        }
        let page_cache_bytes = configs.iter().map(|c| c.page_cache_size_mb).max().unwrap_or(32) * 1024 * 1024;
        let extent_cache_bytes = configs.iter().map(|c| c.extent_cache_size_mb).max().unwrap_or(8) * 1024 * 1024;

        let registry = MetricRegistry::new();
        let open_cache = OpenCacheIndex::new();
        let mut tiers = HashMap::with_capacity(configs.len());
        for config in &configs {
            tiers.insert(config.tier, TierState::new(config, &registry, &open_cache)?);
        }

        Ok(Self {
            registry,
            page_cache: PageCache::new(page_cache_bytes),
            extent_cache: ExtentCache::new(extent_cache_bytes),
            open_cache,
            epdl_router: crate::query::epdl::EpdlRouter::new(),
            tiers,
        })
    }

    fn tier_state(&self, tier: u8) -> Result<&TierState> {
        self.tiers
            .get(&tier)
            .ok_or_else(|| EngineError::Configuration(format!("tier {tier} not configured")))
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn page_cache(&self) -> &PageCache {
        &self.page_cache
    }

    pub fn extent_cache(&self) -> &ExtentCache {
        &self.extent_cache
    }

    pub fn epdl_router(&self) -> &crate::query::epdl::EpdlRouter {
        &self.epdl_router
    }

    pub fn open_cache(&self) -> &OpenCacheIndex {
        &self.open_cache
    }

    pub fn page_type(&self, tier: u8) -> Result<PageType> {
        Ok(self.tier_state(tier)?.page_type)
    }

    pub fn tier_disk_space_used(&self, tier: u8) -> Result<u64> {
        Ok(self.tier_state(tier)?.disk_space_used())
    }

    /// Drains up to `max_pages` DIRTY pages for `tier` and writes them as
    /// one extent, rotating to a fresh datafile if the current one has no
    /// room (§4.2 steps 1-9).
    pub fn flush_tier(&self, tier: u8, max_pages: usize) -> Result<FlushOutcome> {
        let state = self.tier_state(tier)?;
        loop {
            let datafile = state.current_datafile();
            let journal = state.journal_for(&datafile)?;
            match write_path::flush_batch(
                &self.page_cache,
                &datafile,
                &journal,
                &self.open_cache,
                max_pages,
                CompressionAlgorithm::Lz4,
                true,
            ) {
                Ok(outcome) => {
                    state.record_flush(&outcome);
                    self.page_cache.evict_to_target();
                    return Ok(outcome);
                }
                Err(EngineError::Invariant(_)) => {
                    state.rotate(&self.registry, &self.open_cache)?;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn datafile_by_id(&self, tier: u8, id: DatafileId) -> Result<Arc<Datafile>> {
        self.tier_state(tier)?.datafile_by_id(id)
    }

    pub(crate) fn configured_tiers(&self) -> impl Iterator<Item = u8> + '_ {
        self.tiers.keys().copied()
    }
}

/// Lets an `Engine` sit behind `engine::event_loop::EventLoop` as the
/// opcode queue's drain target (§8, C11). `EvictMain`/`EvictOpen` run the
/// page cache's size-bounded eviction; `FlushMain` drains every
/// configured tier. Opcodes that need a live query context
/// (`Query`/`ExtentRead`/`ExtentWrite`) aren't meaningful without the
/// caller's `Pdc`/`Epdl` handles, so they're handled where those are
/// constructed (`api.rs`) rather than here; the event loop still routes
/// them through without panicking.
impl OpcodeHandler for Engine {
    fn handle(&self, cmd: Command) {
        match cmd.opcode {
            Opcode::EvictMain | Opcode::EvictOpen | Opcode::EvictExtent => {
                self.page_cache.evict_to_target();
            }
            Opcode::FlushMain | Opcode::CtxFlushDirty | Opcode::CtxFlushHotDirty => {
                for tier in self.configured_tiers().collect::<Vec<_>>() {
                    let _ = self.flush_tier(tier, usize::MAX);
                }
            }
            Opcode::DatabaseRotate => {
                for tier in self.configured_tiers().collect::<Vec<_>>() {
                    if let Ok(state) = self.tier_state(tier) {
                        let _ = state.rotate(&self.registry, &self.open_cache);
                    }
                }
            }
            Opcode::Query | Opcode::ExtentRead | Opcode::ExtentWrite | Opcode::JournalIndex | Opcode::CtxPopulateMrg | Opcode::CtxQuiesce | Opcode::CtxShutdown | Opcode::Cleanup | Opcode::ShutdownEvloop | Opcode::Noop => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            dbfiles_path: dir.to_string_lossy().into_owned(),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn new_engine_opens_one_datafile_per_tier() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(vec![test_config(dir.path())]).unwrap();
        assert_eq!(engine.tier_disk_space_used(0).unwrap(), 512);
    }

    #[test]
    fn unconfigured_tier_is_an_error() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(vec![test_config(dir.path())]).unwrap();
        assert!(engine.tier_disk_space_used(9).is_err());
    }

    #[test]
    fn flush_tier_with_no_dirty_pages_is_a_no_op() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(vec![test_config(dir.path())]).unwrap();
        let outcome = engine.flush_tier(0, 64).unwrap();
        assert_eq!(outcome.pages_written, 0);
    }

    #[test]
    fn rotate_seals_outgoing_datafile_into_journal_v2() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(vec![test_config(dir.path())]).unwrap();
        let metric = MetricUuid::new_v4();

        let codec = crate::codec::codec_for(PageType::Array32);
        let points: Vec<crate::common::Point> = (0..10)
            .map(|i| crate::common::Point::raw(1_700_000_000 + i, i as f64, crate::common::PointFlags::empty()))
            .collect();
        let data = codec.encode(&points, 1).unwrap();
        let (page, _) = engine.page_cache().add_and_acquire(
            Section::tier(0),
            metric,
            1_700_000_000,
            1_700_000_009,
            1,
            PageType::Array32,
            data,
            10,
            crate::cache::page_cache::PageState::Hot,
        );
        engine.page_cache().hot_to_dirty_and_release(page);

        let outcome = engine.flush_tier(0, 64).unwrap();
        assert_eq!(outcome.pages_written, 1);

        let state = engine.tier_state(0).unwrap();
        state.rotate(&engine.registry, &engine.open_cache).unwrap();

        let journal = JournalV2::read_from(&state.dbfiles_dir, 0, 1).unwrap();
        assert_eq!(journal.metrics.len(), 1);
        assert!(journal.metrics.contains_key(&metric));
    }
}
