//! Page Data (`PGD`) — the compact in-memory representation of a page's
//! samples, with a per-type codec (C4).

use crate::common::{MetricUuid, PageType, Point, Section, TimestampS};
use crate::error::{EngineError, Result};

/// Hard cap on a fixed-size page's encoded length; Gorilla pages grow past
/// this in 512-byte blocks and are capped separately by
/// [`PageType::Gorilla`] callers via `max_page_length`.
pub const MAX_PAGE_BYTES: usize = 1 << 20;

/// The on-disk descriptor overlays `end_time_ut` for fixed-size tiers with
/// `{delta_time_s, entries}` for Gorilla. Modeled as a tagged variant
/// instead of a C union; the serializer picks the arm by `PageType` and
/// emits the raw 8-byte payload either way (§6.2, §9 Design Notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDescr {
    Array { end_time_ut: u64 },
    Gorilla { delta_time_s: u32, entries: u32 },
}

impl PageDescr {
    /// Raw little-endian 8-byte on-disk payload for this descriptor arm.
    pub fn to_bytes(self) -> [u8; 8] {
        match self {
            PageDescr::Array { end_time_ut } => end_time_ut.to_le_bytes(),
            PageDescr::Gorilla {
                delta_time_s,
                entries,
            } => {
                let mut out = [0u8; 8];
                out[0..4].copy_from_slice(&delta_time_s.to_le_bytes());
                out[4..8].copy_from_slice(&entries.to_le_bytes());
                out
            }
        }
    }

    pub fn from_bytes(page_type: PageType, bytes: [u8; 8]) -> Self {
        match page_type {
            PageType::Gorilla => {
                let delta_time_s = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
                let entries = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
                PageDescr::Gorilla {
                    delta_time_s,
                    entries,
                }
            }
            _ => PageDescr::Array {
                end_time_ut: u64::from_le_bytes(bytes),
            },
        }
    }
}

/// A contiguous run of points for one metric at one update interval.
///
/// Invariants (validated by [`crate::validation`] before a page is trusted):
/// `end_time_s >= start_time_s`; `entries >= 1`; if `entries > 1` then
/// `end_time_s > start_time_s` and `update_every_s > 0`; `entries` roughly
/// equals `(end - start) / update_every + 1`; `data.len() <=
/// max_page_length(type)`.
#[derive(Debug, Clone)]
pub struct Page {
    pub metric: MetricUuid,
    pub section: Section,
    pub page_type: PageType,
    pub start_time_s: TimestampS,
    pub end_time_s: TimestampS,
    pub update_every_s: u32,
    pub entries: u32,
    /// Opaque encoded payload, produced by the type's codec.
    pub data: Vec<u8>,
}

impl Page {
    pub fn descr(&self) -> PageDescr {
        match self.page_type {
            PageType::Gorilla => PageDescr::Gorilla {
                delta_time_s: (self.end_time_s - self.start_time_s) as u32,
                entries: self.entries,
            },
            _ => PageDescr::Array {
                end_time_ut: self.end_time_s as u64,
            },
        }
    }

    pub fn page_length(&self) -> usize {
        self.data.len()
    }

    /// Maximum encoded length for this page's type at its current entry
    /// count: fixed tiers are `entries * point_size`; Gorilla grows in
    /// 512-byte blocks, so the bound is generous and only used to reject
    /// clearly-corrupt lengths.
    pub fn max_page_length(page_type: PageType, entries: u32) -> usize {
        match page_type.fixed_point_size() {
            Some(sz) => (entries as usize) * sz,
            None => {
                // Gorilla: worst case is no compression at all, 2 words
                // (value + delta-of-delta) per sample, rounded up to a
                // 512-byte block.
                let worst = (entries as usize) * 16 + 16;
                worst.div_ceil(512) * 512
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descr_round_trips_array() {
        let d = PageDescr::Array {
            end_time_ut: 1_700_000_000,
        };
        let bytes = d.to_bytes();
        let back = PageDescr::from_bytes(PageType::Array32, bytes);
        assert_eq!(d, back);
    }

    #[test]
    fn descr_round_trips_gorilla() {
        let d = PageDescr::Gorilla {
            delta_time_s: 3600,
            entries: 120,
        };
        let bytes = d.to_bytes();
        let back = PageDescr::from_bytes(PageType::Gorilla, bytes);
        assert_eq!(d, back);
    }
}

/// Wraps an encode/decode failure with the page's identity, for callers
/// that want to attribute a codec error to a specific page.
pub fn codec_err(metric: MetricUuid, reason: impl Into<String>) -> EngineError {
    EngineError::InvalidPage(format!("{metric}: {}", reason.into()))
}

pub type PageResult<T> = Result<T>;
