//! Extent Codec (C6) — header/trailer framing, CRC32, descriptor tables.
//!
//! On-disk frame (§6.2, bit-exact, little-endian):
//! ```text
//! header:  { magic[8], version, number_of_pages:u8, compression_algorithm:u8,
//!            payload_length:u32, descr[number_of_pages] }
//! descr:   { uuid[16], type:u8, reserved, page_length:u32, start_time_ut:u64,
//!            union { end_time_ut:u64 | { delta_time_s:u32, entries:u32 } } }
//! trailer: { checksum:u32 }
//! ```

use crate::common::{MetricUuid, PageType, TimestampS};
use crate::compression::{self, CompressionAlgorithm};
use crate::error::{EngineError, Result};
use crate::page::{Page, PageDescr};

pub const EXTENT_MAGIC: [u8; 8] = *b"TSEXTNT1";
pub const EXTENT_VERSION: u8 = 1;
pub const MAX_PAGES_PER_EXTENT: usize = 255;

const DESCR_SIZE: usize = 16 + 1 + 1 + 4 + 8 + 8;
const HEADER_FIXED_SIZE: usize = 8 + 1 + 1 + 1 + 4;
const TRAILER_SIZE: usize = 4;

#[derive(Debug, Clone)]
pub struct ExtentDescriptor {
    pub uuid: MetricUuid,
    pub page_type: PageType,
    pub page_length: u32,
    pub start_time_ut: u64,
    pub descr: PageDescr,
}

impl ExtentDescriptor {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.uuid.as_bytes());
        out.push(self.page_type.as_u8());
        out.push(0); // reserved
        out.extend_from_slice(&self.page_length.to_le_bytes());
        out.extend_from_slice(&self.start_time_ut.to_le_bytes());
        out.extend_from_slice(&self.descr.to_bytes());
    }

    fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DESCR_SIZE {
            return Err(EngineError::InvalidExtent("descriptor truncated".into()));
        }
        let uuid = MetricUuid::from_slice(&bytes[0..16])
            .map_err(|e| EngineError::InvalidExtent(format!("bad uuid: {e}")))?;
        let page_type = PageType::from_u8(bytes[16])
            .ok_or_else(|| EngineError::InvalidExtent(format!("bad page type {}", bytes[16])))?;
        let page_length = u32::from_le_bytes(bytes[18..22].try_into().unwrap());
        let start_time_ut = u64::from_le_bytes(bytes[22..30].try_into().unwrap());
        let descr_bytes: [u8; 8] = bytes[30..38].try_into().unwrap();
        let descr = PageDescr::from_bytes(page_type, descr_bytes);
        Ok(Self {
            uuid,
            page_type,
            page_length,
            start_time_ut,
            descr,
        })
    }

    pub fn start_time_s(&self) -> TimestampS {
        self.start_time_ut as TimestampS
    }

    pub fn end_time_s(&self) -> TimestampS {
        match self.descr {
            PageDescr::Array { end_time_ut } => end_time_ut as TimestampS,
            PageDescr::Gorilla { delta_time_s, .. } => {
                self.start_time_s() + delta_time_s as TimestampS
            }
        }
    }

    pub fn entries(&self) -> Option<u32> {
        match self.descr {
            PageDescr::Gorilla { entries, .. } => Some(entries),
            PageDescr::Array { .. } => None,
        }
    }
}

/// A fully-framed, on-disk extent: header + compressed payload + trailer.
#[derive(Debug, Clone)]
pub struct EncodedExtent {
    pub bytes: Vec<u8>,
    pub descriptors: Vec<ExtentDescriptor>,
}

/// Builds an extent from `pages` (already HOT->DIRTY, eligible for flush),
/// compressing the concatenated payload per the write path's steps 2-5.
pub fn build_extent(pages: &[Page], requested_algo: CompressionAlgorithm) -> Result<EncodedExtent> {
    if pages.is_empty() {
        return Err(EngineError::InvalidExtent("empty extent".into()));
    }
    if pages.len() > MAX_PAGES_PER_EXTENT {
        return Err(EngineError::InvalidExtent(format!(
            "extent has {} pages, max is {}",
            pages.len(),
            MAX_PAGES_PER_EXTENT
        )));
    }

    let descriptors: Vec<ExtentDescriptor> = pages
        .iter()
        .map(|p| ExtentDescriptor {
            uuid: p.metric,
            page_type: p.page_type,
            page_length: p.data.len() as u32,
            start_time_ut: p.start_time_s as u64,
            descr: p.descr(),
        })
        .collect();

    let mut raw_payload = Vec::with_capacity(pages.iter().map(|p| p.data.len()).sum());
    for p in pages {
        raw_payload.extend_from_slice(&p.data);
    }

    let (compressed_payload, algo) = compression::compress(&raw_payload, requested_algo)?;

    let mut out = Vec::with_capacity(
        HEADER_FIXED_SIZE + descriptors.len() * DESCR_SIZE + compressed_payload.len() + TRAILER_SIZE,
    );
    out.extend_from_slice(&EXTENT_MAGIC);
    out.push(EXTENT_VERSION);
    out.push(pages.len() as u8);
    out.push(algo.as_u8());
    out.extend_from_slice(&(compressed_payload.len() as u32).to_le_bytes());
    for d in &descriptors {
        d.write(&mut out);
    }
    out.extend_from_slice(&compressed_payload);

    let checksum = crc32fast::hash(&out);
    out.extend_from_slice(&checksum.to_le_bytes());

    Ok(EncodedExtent {
        bytes: out,
        descriptors,
    })
}

/// A parsed-but-not-yet-decompressed extent.
pub struct ParsedExtent {
    pub descriptors: Vec<ExtentDescriptor>,
    pub compression_algorithm: CompressionAlgorithm,
    payload_offset: usize,
    payload_length: usize,
}

impl ParsedExtent {
    pub fn payload<'a>(&self, bytes: &'a [u8]) -> &'a [u8] {
        &bytes[self.payload_offset..self.payload_offset + self.payload_length]
    }

    /// Decompresses the payload and slices out each page's raw bytes in
    /// descriptor order.
    pub fn decode_pages(&self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        let total_uncompressed: usize = self.descriptors.iter().map(|d| d.page_length as usize).sum();
        let raw = compression::decompress(self.payload(bytes), self.compression_algorithm, total_uncompressed)?;
        let mut out = Vec::with_capacity(self.descriptors.len());
        let mut pos = 0;
        for d in &self.descriptors {
            let len = d.page_length as usize;
            if pos + len > raw.len() {
                return Err(EngineError::InvalidExtent(
                    "decompressed payload shorter than descriptor table implies".into(),
                ));
            }
            out.push(raw[pos..pos + len].to_vec());
            pos += len;
        }
        Ok(out)
    }
}

/// Validates the header, verifies the CRC32 trailer, and returns the
/// parsed descriptor table (§4.5 steps 3-4).
pub fn parse_extent(bytes: &[u8]) -> Result<ParsedExtent> {
    if bytes.len() < HEADER_FIXED_SIZE + TRAILER_SIZE {
        return Err(EngineError::InvalidExtent("extent too short".into()));
    }
    if bytes[0..8] != EXTENT_MAGIC {
        return Err(EngineError::InvalidExtent("bad magic".into()));
    }
    let version = bytes[8];
    if version != EXTENT_VERSION {
        return Err(EngineError::InvalidExtent(format!(
            "unsupported extent version {version}"
        )));
    }
    let number_of_pages = bytes[9] as usize;
    if number_of_pages == 0 || number_of_pages > MAX_PAGES_PER_EXTENT {
        return Err(EngineError::InvalidExtent(format!(
            "number_of_pages {number_of_pages} out of range"
        )));
    }
    let compression_algorithm = CompressionAlgorithm::from_u8(bytes[10])?;
    let payload_length = u32::from_le_bytes(bytes[11..15].try_into().unwrap()) as usize;

    let descr_table_start = HEADER_FIXED_SIZE;
    let descr_table_len = number_of_pages * DESCR_SIZE;
    let payload_offset = descr_table_start + descr_table_len;
    let trailer_offset = payload_offset + payload_length;

    if trailer_offset + TRAILER_SIZE != bytes.len() {
        return Err(EngineError::InvalidExtent(format!(
            "payload_length {payload_length} inconsistent with extent size {}",
            bytes.len()
        )));
    }

    let expected_crc = u32::from_le_bytes(bytes[trailer_offset..trailer_offset + TRAILER_SIZE].try_into().unwrap());
    let actual_crc = crc32fast::hash(&bytes[0..trailer_offset]);
    if expected_crc != actual_crc {
        return Err(EngineError::InvalidExtent(format!(
            "CRC mismatch: expected {expected_crc:#x}, got {actual_crc:#x}"
        )));
    }

    let mut descriptors = Vec::with_capacity(number_of_pages);
    for i in 0..number_of_pages {
        let start = descr_table_start + i * DESCR_SIZE;
        descriptors.push(ExtentDescriptor::read(&bytes[start..start + DESCR_SIZE])?);
    }

    Ok(ParsedExtent {
        descriptors,
        compression_algorithm,
        payload_offset,
        payload_length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{PointFlags, Point};
    use crate::codec::{codec_for, PageCodec};

    fn sample_page(metric: MetricUuid, start: i64, n: i64) -> Page {
        let points: Vec<Point> = (0..n)
            .map(|i| Point::raw(start + i, i as f64, PointFlags::empty()))
            .collect();
        let codec = codec_for(PageType::Array32);
        let data = codec.encode(&points, 1).unwrap();
        Page {
            metric,
            section: crate::common::Section::tier(0),
            page_type: PageType::Array32,
            start_time_s: start,
            end_time_s: start + n - 1,
            update_every_s: 1,
            entries: n as u32,
            data,
        }
    }

    #[test]
    fn round_trips_single_page_extent() {
        let metric = MetricUuid::new_v4();
        let page = sample_page(metric, 1000, 60);
        let extent = build_extent(&[page.clone()], CompressionAlgorithm::Lz4).unwrap();
        let parsed = parse_extent(&extent.bytes).unwrap();
        assert_eq!(parsed.descriptors.len(), 1);
        assert_eq!(parsed.descriptors[0].uuid, metric);
        assert_eq!(parsed.descriptors[0].start_time_s(), 1000);
        assert_eq!(parsed.descriptors[0].end_time_s(), 1059);
        let pages = parsed.decode_pages(&extent.bytes).unwrap();
        assert_eq!(pages[0], page.data);
    }

    #[test]
    fn detects_crc_corruption() {
        let metric = MetricUuid::new_v4();
        let page = sample_page(metric, 1000, 10);
        let mut extent = build_extent(&[page], CompressionAlgorithm::Lz4).unwrap();
        let last = extent.bytes.len() - 1;
        extent.bytes[last] ^= 0xFF;
        assert!(parse_extent(&extent.bytes).is_err());
    }

    #[test]
    fn rejects_zero_pages() {
        assert!(build_extent(&[], CompressionAlgorithm::None).is_err());
    }
}
