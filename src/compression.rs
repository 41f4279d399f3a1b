//! Extent compression (§4.10). Two algorithms: `NONE` and `LZ4`.

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    None,
    Lz4,
}

impl CompressionAlgorithm {
    pub fn as_u8(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Lz4),
            other => Err(EngineError::InvalidExtent(format!(
                "unknown compression algorithm id {other}"
            ))),
        }
    }
}

/// Worst-case compressed size for `n` input bytes, used to size the
/// scratch buffer before a real compression attempt.
pub fn max_compressed_size(n: usize) -> usize {
    lz4_flex::block::get_maximum_output_size(n)
}

/// Compresses `input` with LZ4; if the result would not be smaller than
/// the input, the caller should fall back to storing it uncompressed and
/// recording [`CompressionAlgorithm::None`] in the extent header, per the
/// write path's step 4.
pub fn compress_lz4(input: &[u8]) -> Result<Vec<u8>> {
    Ok(lz4_flex::block::compress(input))
}

/// Decompresses an LZ4-compressed extent payload into a buffer of exactly
/// `dst_size` bytes. Never call this with [`CompressionAlgorithm::None`]
/// (caller invariant) — an uncompressed payload is used as-is.
pub fn decompress_lz4(src: &[u8], dst_size: usize) -> Result<Vec<u8>> {
    lz4_flex::block::decompress(src, dst_size)
        .map_err(|e| EngineError::Compression(format!("lz4 decompress failed: {e}")))
}

/// Compresses `payload` with the given algorithm, returning the bytes to
/// store and the algorithm actually used (which may differ from the one
/// requested, if compression did not pay off).
pub fn compress(payload: &[u8], requested: CompressionAlgorithm) -> Result<(Vec<u8>, CompressionAlgorithm)> {
    match requested {
        CompressionAlgorithm::None => Ok((payload.to_vec(), CompressionAlgorithm::None)),
        CompressionAlgorithm::Lz4 => {
            let compressed = compress_lz4(payload)?;
            if compressed.len() >= payload.len() {
                Ok((payload.to_vec(), CompressionAlgorithm::None))
            } else {
                Ok((compressed, CompressionAlgorithm::Lz4))
            }
        }
    }
}

pub fn decompress(
    payload: &[u8],
    algorithm: CompressionAlgorithm,
    uncompressed_size: usize,
) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(payload.to_vec()),
        CompressionAlgorithm::Lz4 => decompress_lz4(payload, uncompressed_size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_compressible_data() {
        let data = vec![7u8; 4096];
        let (compressed, algo) = compress(&data, CompressionAlgorithm::Lz4).unwrap();
        assert_eq!(algo, CompressionAlgorithm::Lz4);
        assert!(compressed.len() < data.len());
        let back = decompress(&compressed, algo, data.len()).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn falls_back_to_none_for_incompressible_tiny_input() {
        let data: Vec<u8> = vec![1, 2, 3];
        let (out, algo) = compress(&data, CompressionAlgorithm::Lz4).unwrap();
        assert_eq!(algo, CompressionAlgorithm::None);
        assert_eq!(out, data);
    }
}
