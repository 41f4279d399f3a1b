//! Per-type page codecs (C4). Each tier stores its samples in a different
//! on-disk shape; a codec hides that behind a uniform encode/decode pair so
//! the write path and read path never special-case the type directly.

mod array32;
mod gorilla;
mod tier1;

use crate::common::{PageType, Point, TimestampS};
use crate::error::Result;

pub use array32::Array32Codec;
pub use gorilla::GorillaCodec;
pub use tier1::Tier1Codec;

/// Capability set for converting between in-memory points and a page's
/// opaque on-disk byte representation.
pub trait PageCodec {
    fn page_type(&self) -> PageType;

    /// Encode `points` (already sorted by ascending timestamp, spaced by
    /// `update_every_s`) into the opaque payload stored in [`crate::page::Page::data`].
    fn encode(&self, points: &[Point], update_every_s: u32) -> Result<Vec<u8>>;

    /// Decode `entries` points starting at `start_time_s`, `update_every_s`
    /// apart, out of `bytes`.
    fn decode(
        &self,
        bytes: &[u8],
        entries: u32,
        start_time_s: TimestampS,
        update_every_s: u32,
    ) -> Result<Vec<Point>>;
}

/// Looks up the codec for a page type.
pub fn codec_for(page_type: PageType) -> Box<dyn PageCodec> {
    match page_type {
        PageType::Array32 => Box::new(Array32Codec),
        PageType::Tier1 => Box::new(Tier1Codec),
        PageType::Gorilla => Box::new(GorillaCodec),
    }
}
