//! Datafile & Journal (C5) and Extent Codec (C6) — the on-disk log of
//! compressed extents, its write-ahead journal, and the immutable index
//! built over it asynchronously.

pub mod datafile;
pub mod extent;
pub mod journal_v1;
pub mod journal_v2;

pub use datafile::{Datafile, DatafileId};
pub use extent::{build_extent, parse_extent, EncodedExtent, ExtentDescriptor};
