//! Multi-tier, page-oriented time-series storage engine.
//!
//! Samples are collected into in-memory pages (`page`), cached hot in the
//! page cache (`cache`), batched into compressed extents by the write path
//! (`engine::write_path`) and appended to a per-tier datafile + journal
//! (`storage`). Queries are planned across tiers (`query::planner`) and
//! served by merging page-cache and on-disk points through a reducer
//! (`query::executor`). `api` is the façade the rest of this crate is built
//! to support.

pub mod api;
pub mod arena;
pub mod cache;
pub mod codec;
pub mod common;
pub mod compression;
pub mod config;
pub mod engine;
pub mod error;
pub mod page;
pub mod query;
pub mod registry;
pub mod storage;
pub mod validation;

pub use api::{CollectHandle, LoadHandle, SampleValue};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};
