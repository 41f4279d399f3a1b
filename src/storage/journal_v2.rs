//! Journal v2 — the immutable, memory-mappable per-datafile index.
//!
//! `journalfile-<tier>-<fileno>.njfv2`: built asynchronously once every
//! writer of a datafile has drained (§4.7, §5). For each metric present
//! in the datafile, a sorted list of `(page_offset, delta_start_s,
//! delta_end_s, page_length, type)` relative to the journal's base time.
//!
//! This crate serializes the index with `bincode` rather than hand-rolling
//! a raw mmap layout byte-for-byte; the logical shape (header + extent
//! list + per-metric page lists, all deltas relative to one base time) is
//! preserved, which is what matters for the lookups §4.8 performs.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::storage::extent::ExtentDescriptor;

pub const JOURNAL_V2_MAGIC: [u8; 8] = *b"TSJNLV2\0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalV2Header {
    pub start_time_ut: u64,
    pub metric_count: u32,
    pub extent_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalV2PageEntry {
    pub page_offset: u64,
    pub delta_start_s: u32,
    pub delta_end_s: u32,
    pub page_length: u32,
    pub page_type: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalV2 {
    pub header: JournalV2Header,
    /// metric uuid -> page entries, sorted by `delta_start_s`.
    pub metrics: HashMap<Uuid, Vec<JournalV2PageEntry>>,
}

impl JournalV2 {
    /// Builds the index for one datafile from the extents written to it,
    /// each tagged with the byte offset its payload starts at.
    pub fn build(start_time_ut: u64, extents: &[(u64, Vec<ExtentDescriptor>)]) -> Self {
        let mut metrics: HashMap<Uuid, Vec<JournalV2PageEntry>> = HashMap::new();
        let mut extent_count = 0u32;
        for (extent_offset, descriptors) in extents {
            extent_count += 1;
            let mut page_offset = *extent_offset;
            for d in descriptors {
                let start_s = d.start_time_s() as u64;
                let end_s = d.end_time_s() as u64;
                let delta_start_s = start_s.saturating_sub(start_time_ut) as u32;
                let delta_end_s = end_s.saturating_sub(start_time_ut) as u32;
                metrics.entry(d.uuid).or_default().push(JournalV2PageEntry {
                    page_offset,
                    delta_start_s,
                    delta_end_s,
                    page_length: d.page_length,
                    page_type: d.page_type.as_u8(),
                });
                page_offset += d.page_length as u64;
            }
        }
        for entries in metrics.values_mut() {
            entries.sort_by_key(|e| e.delta_start_s);
        }
        let metric_count = metrics.len() as u32;
        JournalV2 {
            header: JournalV2Header {
                start_time_ut,
                metric_count,
                extent_count,
            },
            metrics,
        }
    }

    pub fn write_to(&self, dir: &Path, tier: u8, fileno: u32) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("journalfile-{tier}-{fileno}.njfv2"));
        let encoded = bincode::serde::encode_to_vec(self, bincode::config::standard())?;
        let mut file = File::create(&path)?;
        file.write_all(&JOURNAL_V2_MAGIC)?;
        file.write_all(&encoded)?;
        Ok(path)
    }

    pub fn read_from(dir: &Path, tier: u8, fileno: u32) -> Result<Self> {
        let path = dir.join(format!("journalfile-{tier}-{fileno}.njfv2"));
        let mut file = File::open(&path)?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if magic != JOURNAL_V2_MAGIC {
            return Err(EngineError::Corruption {
                datafile: fileno,
                offset: 0,
                size: 8,
                reason: "bad journal v2 magic".into(),
            });
        }
        let mut rest = Vec::new();
        file.read_to_end(&mut rest)?;
        let (index, _) = bincode::serde::decode_from_slice(&rest, bincode::config::standard())?;
        Ok(index)
    }

    /// Binary-searches this metric's page list for the earliest page
    /// whose `delta_start_s + start_time_ut` is >= none (first entry is
    /// the earliest by construction, since the list is sorted ascending).
    pub fn earliest_start_s(&self, metric: &Uuid) -> Option<i64> {
        let entries = self.metrics.get(metric)?;
        entries
            .first()
            .map(|e| self.header.start_time_ut as i64 + e.delta_start_s as i64)
    }

    /// Pages for `metric` overlapping `[after, before]`, found via binary
    /// search on the sorted `delta_start_s` list.
    pub fn pages_overlapping(&self, metric: &Uuid, after: i64, before: i64) -> Vec<&JournalV2PageEntry> {
        let Some(entries) = self.metrics.get(metric) else {
            return Vec::new();
        };
        let base = self.header.start_time_ut as i64;
        let lo = entries.partition_point(|e| base + e.delta_end_s as i64 + 1 <= after);
        entries[lo..]
            .iter()
            .take_while(|e| base + e.delta_start_s as i64 <= before)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PageType;
    use crate::page::PageDescr;
    use tempfile::tempdir;

    fn descr(uuid: Uuid, start: u64, end: u64, len: u32) -> ExtentDescriptor {
        ExtentDescriptor {
            uuid,
            page_type: PageType::Array32,
            page_length: len,
            start_time_ut: start,
            descr: PageDescr::Array { end_time_ut: end },
        }
    }

    #[test]
    fn builds_sorted_per_metric_index() {
        let m = Uuid::new_v4();
        let extents = vec![
            (512u64, vec![descr(m, 2000, 2059, 240)]),
            (1024u64, vec![descr(m, 1000, 1059, 240)]),
        ];
        let idx = JournalV2::build(1000, &extents);
        let entries = &idx.metrics[&m];
        assert_eq!(entries.len(), 2);
        assert!(entries[0].delta_start_s < entries[1].delta_start_s);
        assert_eq!(idx.earliest_start_s(&m), Some(1000));
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let m = Uuid::new_v4();
        let extents = vec![(0u64, vec![descr(m, 1000, 1059, 240)])];
        let idx = JournalV2::build(1000, &extents);
        idx.write_to(dir.path(), 0, 7).unwrap();
        let back = JournalV2::read_from(dir.path(), 0, 7).unwrap();
        assert_eq!(back.header.metric_count, 1);
        assert_eq!(back.metrics[&m].len(), 1);
    }

    #[test]
    fn pages_overlapping_filters_by_range() {
        let m = Uuid::new_v4();
        let extents = vec![
            (0u64, vec![descr(m, 1000, 1059, 240)]),
            (240u64, vec![descr(m, 1060, 1119, 240)]),
            (480u64, vec![descr(m, 2000, 2059, 240)]),
        ];
        let idx = JournalV2::build(1000, &extents);
        let hits = idx.pages_overlapping(&m, 1050, 1070);
        assert_eq!(hits.len(), 2);
    }
}
