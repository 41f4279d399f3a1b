//! Engine configuration.
//!
//! Loading this struct from a file or environment is the embedding
//! daemon's job (CLI/config loading is an explicit non-goal of this
//! crate); the engine only validates and consumes it.

use crate::common::PageType;
use crate::error::{EngineError, Result};

/// Recognized configuration options, per the engine API surface.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tier: u8,
    pub page_type: PageType,
    pub max_disk_space_bytes: u64,
    pub max_retention_s: i64,
    pub dbfiles_path: String,
    pub disk_percentage: f32,
    pub page_cache_size_mb: usize,
    pub extent_cache_size_mb: usize,

    /// Worker pool size; defaults to the detected CPU count.
    pub worker_threads: usize,
    /// Points per page before a HOT page is rotated to DIRTY.
    pub page_capacity_entries: u32,
    /// Pages per extent cap; the on-disk header encodes this in 8 bits.
    pub max_pages_per_extent: u8,
    /// Bytes above which an extent is rejected as oversized.
    pub max_extent_uncompressed_bytes: usize,

    /// Retention recalculation bound: stop scanning a metric after it has
    /// been found in this many remaining datafiles (§4.8, tunable per the
    /// spec's own open question).
    pub retention_scan_max_datafiles: u32,
    /// Retention recalculation bound: stop scanning a metric after this
    /// many pages have been accumulated for it.
    pub retention_scan_max_pages: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tier: 0,
            page_type: PageType::Array32,
            max_disk_space_bytes: 1 << 30,
            max_retention_s: 3600 * 24 * 14,
            dbfiles_path: "./dbengine".to_string(),
            disk_percentage: 5.0,
            page_cache_size_mb: 32,
            extent_cache_size_mb: 8,
            worker_threads: num_cpus::get().max(1),
            page_capacity_entries: 4096,
            max_pages_per_extent: 64,
            max_extent_uncompressed_bytes: 16 * 1024 * 1024,
            retention_scan_max_datafiles: 3,
            retention_scan_max_pages: 5,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_pages_per_extent == 0 {
            return Err(EngineError::Configuration(
                "max_pages_per_extent must be > 0".into(),
            ));
        }
        if self.page_capacity_entries == 0 {
            return Err(EngineError::Configuration(
                "page_capacity_entries must be > 0".into(),
            ));
        }
        if self.dbfiles_path.is_empty() {
            return Err(EngineError::Configuration(
                "dbfiles_path must not be empty".into(),
            ));
        }
        Ok(())
    }
}
