//! Write Path (C12) — batches DIRTY pages into an extent, compresses it,
//! appends a WAL record, and promotes the written pages into the open
//! cache, per §4.2.

use std::thread;
use std::time::Duration;

use crate::cache::page_cache::{PageCache, PageCacheEntry};
use crate::common::{MetricUuid, Section, TimestampS};
use crate::compression::CompressionAlgorithm;
use crate::error::{EngineError, Result};
use crate::page::Page;
use crate::storage::datafile::Datafile;
use crate::storage::extent::{build_extent, ExtentDescriptor};
use crate::storage::journal_v1::JournalV1;

const MAX_WRITE_ATTEMPTS: u32 = 10;
const RETRY_BACKOFF: Duration = Duration::from_millis(300);

/// Substrings that mark an I/O failure as fatal rather than transient.
/// `EngineError::Io` only carries the formatted `io::Error` message (no
/// `ErrorKind`/errno survives the conversion in `error.rs`), so retry
/// classification has to match on these.
const FATAL_IO_SUBSTRINGS: &[&str] = &[
    "No space left",
    "Bad file descriptor",
    "Permission denied",
    "Read-only file system",
    "Invalid argument",
];

fn is_fatal_io_error(err: &EngineError) -> bool {
    match err {
        EngineError::Io(msg) => FATAL_IO_SUBSTRINGS.iter().any(|s| msg.contains(s)),
        EngineError::DiskFull => true,
        _ => false,
    }
}

/// Where a promoted page landed: the open cache only needs enough to
/// re-read it without consulting the journal.
#[derive(Debug, Clone, Copy)]
pub struct OpenCacheEntry {
    pub datafile_id: crate::storage::DatafileId,
    /// Byte offset of the *extent* this page was written in, not the
    /// page itself — reading it back means reading the whole extent and
    /// picking this page out of its descriptor table.
    pub offset: u64,
    pub length: u32,
    pub extent_size: u32,
}

/// Promotion target for freshly written pages. Implemented by whatever
/// in-memory index backs "is this point still only on the datafile I
/// just wrote, or has it been superseded" lookups (§4.2 step 8).
pub trait OpenCache: Send + Sync {
    fn promote(&self, section: Section, metric: MetricUuid, start_time_s: TimestampS, entry: OpenCacheEntry);
}

/// Result of flushing one batch of DIRTY pages.
#[derive(Debug, Default)]
pub struct FlushOutcome {
    pub pages_written: usize,
    pub bytes_written: usize,
    pub txn_id: Option<u64>,
    /// Offset and descriptor table of the extent just written, so the
    /// caller can accumulate a per-datafile index (§4.7's journal v2
    /// build) without re-reading anything back off disk.
    pub extent_offset: Option<u64>,
    pub descriptors: Vec<ExtentDescriptor>,
}

fn page_from_entry(entry: &PageCacheEntry) -> Page {
    Page {
        metric: entry.metric,
        section: entry.section,
        page_type: entry.page_type,
        start_time_s: entry.start_time_s,
        end_time_s: entry.end_time_s(),
        update_every_s: entry.update_every_s,
        entries: entry.entries(),
        data: entry.data.read().clone(),
    }
}

/// Writes bytes at `offset` with the retry policy of §4.2's last
/// paragraph: up to [`MAX_WRITE_ATTEMPTS`] attempts on a transient I/O
/// error, 300ms apart, aborting immediately on a fatal one.
fn write_with_retry(datafile: &Datafile, offset: u64, bytes: &[u8]) -> Result<()> {
    let mut last_err = None;
    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        match datafile.write_at(offset, bytes) {
            Ok(()) => return Ok(()),
            Err(e) if is_fatal_io_error(&e) => return Err(e),
            Err(e) => {
                last_err = Some(e);
                if attempt < MAX_WRITE_ATTEMPTS {
                    thread::sleep(RETRY_BACKOFF);
                }
            }
        }
    }
    Err(last_err.unwrap_or(EngineError::Io("write_at exhausted retries".into())))
}

/// Runs one write-path pass: drains up to `max_pages` DIRTY pages from
/// `cache`, builds and writes one extent, and promotes the written pages
/// into `open_cache`. Requeues the batch for a later attempt instead of
/// losing it if the write fails after retries (§4.1's partial-failure
/// policy: pages stay DIRTY on failure).
#[allow(clippy::too_many_arguments)]
pub fn flush_batch(
    cache: &PageCache,
    datafile: &Datafile,
    journal: &JournalV1,
    open_cache: &dyn OpenCache,
    max_pages: usize,
    compression_algo: CompressionAlgorithm,
    is_latest_datafile: bool,
) -> Result<FlushOutcome> {
    let batch = cache.drain_flush_batch(max_pages);
    if batch.is_empty() {
        return Ok(FlushOutcome::default());
    }

    let pages: Vec<Page> = batch.iter().map(|e| page_from_entry(e)).collect();
    let extent = match build_extent(&pages, compression_algo) {
        Ok(e) => e,
        Err(err) => {
            cache.requeue_for_flush(batch);
            return Err(err);
        }
    };

    let len = extent.bytes.len() as u64;
    let Some(offset) = datafile.reserve(len) else {
        cache.requeue_for_flush(batch);
        return Err(EngineError::Invariant(
            "datafile has no room left; caller must rotate before retrying".into(),
        ));
    };

    let write_result = write_with_retry(datafile, offset, &extent.bytes).and_then(|()| datafile.sync());

    let write_result = match write_result {
        Ok(()) => Ok(()),
        Err(err) => {
            for entry in &batch {
                entry.record_io_error();
            }
            Err(err)
        }
    };

    if let Err(err) = write_result {
        datafile.writer_done();
        cache.requeue_for_flush(batch);
        return Err(err);
    }

    let txn_id = journal.append_store_data(offset, len as u32, &extent.descriptors)?;

    for (entry, descr) in batch.iter().zip(extent.descriptors.iter()) {
        cache.mark_written(entry);
        open_cache.promote(
            entry.section,
            entry.metric,
            entry.start_time_s,
            OpenCacheEntry {
                datafile_id: datafile.id,
                offset,
                length: descr.page_length,
                extent_size: len as u32,
            },
        );
    }

    datafile.writer_done();
    if !is_latest_datafile {
        datafile.mark_needs_indexing();
    }

    Ok(FlushOutcome {
        pages_written: batch.len(),
        bytes_written: len as usize,
        txn_id: Some(txn_id),
        extent_offset: Some(offset),
        descriptors: extent.descriptors.clone(),
    })
}
