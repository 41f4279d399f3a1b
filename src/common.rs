//! Shared primitive types used across the engine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A metric's unique identifier, scoped to one section.
pub type MetricUuid = Uuid;

/// Seconds since the epoch. The engine only ever deals in whole seconds.
pub type TimestampS = i64;

/// A per-tier namespace used as a hash key, effectively `(instance, tier)`.
/// This crate models a single instance, so a `Section` is just the tier id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Section(pub u8);

impl Section {
    pub const fn tier(tier: u8) -> Self {
        Section(tier)
    }

    pub fn tier_id(&self) -> u8 {
        self.0
    }
}

/// Tier-specific point representation, per §6.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageType {
    /// `ARRAY_32BIT`: a 32-bit IEEE float per sample (raw tier).
    Array32,
    /// `ARRAY_TIER1`: `{min, max, sum, count, anomaly_count}` per sample.
    Tier1,
    /// `GORILLA_32BIT`: variable-length delta-of-delta stream.
    Gorilla,
}

impl PageType {
    /// Fixed per-sample size in bytes for the fixed-size tiers. Gorilla has
    /// no fixed per-sample size; callers must not call this for it.
    pub fn fixed_point_size(self) -> Option<usize> {
        match self {
            PageType::Array32 => Some(4),
            PageType::Tier1 => Some(12),
            PageType::Gorilla => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            PageType::Array32 => 0,
            PageType::Tier1 => 1,
            PageType::Gorilla => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PageType::Array32),
            1 => Some(PageType::Tier1),
            2 => Some(PageType::Gorilla),
            _ => None,
        }
    }
}

/// Per-point quality flags. Several may be set at once, hence a bitset
/// rather than an enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointFlags(u8);

impl PointFlags {
    pub const EMPTY: PointFlags = PointFlags(1 << 0);
    pub const RESET: PointFlags = PointFlags(1 << 1);
    pub const ANOMALY: PointFlags = PointFlags(1 << 2);
    pub const PARTIAL: PointFlags = PointFlags(1 << 3);
    pub const CANCEL: PointFlags = PointFlags(1 << 4);

    pub const fn empty() -> Self {
        PointFlags(0)
    }

    pub fn contains(&self, other: PointFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: PointFlags) {
        self.0 |= other.0;
    }

    pub fn union(self, other: PointFlags) -> PointFlags {
        PointFlags(self.0 | other.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

/// A single sample. `value` holds the raw-tier float; `tier1` holds the
/// aggregate struct for downsampled tiers. Exactly one is meaningful,
/// selected by the owning page's `PageType`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub timestamp_s: TimestampS,
    pub value: f64,
    pub tier1: Option<Tier1Value>,
    pub flags: PointFlags,
}

impl Point {
    pub fn raw(timestamp_s: TimestampS, value: f64, flags: PointFlags) -> Self {
        Self {
            timestamp_s,
            value,
            tier1: None,
            flags,
        }
    }

    pub fn empty(timestamp_s: TimestampS) -> Self {
        Self {
            timestamp_s,
            value: f64::NAN,
            tier1: None,
            flags: PointFlags::EMPTY,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.flags.contains(PointFlags::EMPTY) || self.value.is_nan()
    }
}

/// `{min, max, sum, count, anomaly_count}` — the downsampled-tier struct.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tier1Value {
    pub min: f32,
    pub max: f32,
    pub sum: f32,
    pub count: u16,
    pub anomaly_count: u16,
}

impl Tier1Value {
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    pub fn anomaly_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.anomaly_count as f64 / self.count as f64 * 100.0
        }
    }
}
