use super::PageCodec;
use crate::common::{PageType, Point, PointFlags, TimestampS};
use crate::error::{EngineError, Result};

/// Gorilla pages grow in fixed blocks as more samples are appended.
const GORILLA_BLOCK_BYTES: usize = 512;

/// `GORILLA_32BIT`: a delta-of-delta / XOR value stream (Facebook
/// "Gorilla" compression), stored in growable 512-byte blocks. Timestamps
/// are implicit (fixed `update_every_s` spacing); only values are
/// compressed.
pub struct GorillaCodec;

struct BitWriter {
    buf: Vec<u8>,
    bit_pos: usize,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            buf: Vec::new(),
            bit_pos: 0,
        }
    }

    fn push_bit(&mut self, bit: bool) {
        let byte_idx = self.bit_pos / 8;
        if byte_idx == self.buf.len() {
            self.buf.push(0);
        }
        if bit {
            self.buf[byte_idx] |= 1 << (7 - (self.bit_pos % 8));
        }
        self.bit_pos += 1;
    }

    fn push_bits(&mut self, value: u64, nbits: u32) {
        for i in (0..nbits).rev() {
            self.push_bit((value >> i) & 1 == 1);
        }
    }

    /// Pad with zero bits up to the next 512-byte block boundary.
    fn pad_to_block(&mut self) {
        let target = self.buf.len().div_ceil(GORILLA_BLOCK_BYTES) * GORILLA_BLOCK_BYTES;
        self.buf.resize(target.max(GORILLA_BLOCK_BYTES), 0);
    }
}

struct BitReader<'a> {
    buf: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, bit_pos: 0 }
    }

    fn next_bit(&mut self) -> Result<bool> {
        let byte_idx = self.bit_pos / 8;
        if byte_idx >= self.buf.len() {
            return Err(EngineError::InvalidPage(
                "gorilla stream exhausted mid-sample".into(),
            ));
        }
        let bit = (self.buf[byte_idx] >> (7 - (self.bit_pos % 8))) & 1 == 1;
        self.bit_pos += 1;
        Ok(bit)
    }

    fn next_bits(&mut self, nbits: u32) -> Result<u64> {
        let mut v = 0u64;
        for _ in 0..nbits {
            v = (v << 1) | (self.next_bit()? as u64);
        }
        Ok(v)
    }
}

impl PageCodec for GorillaCodec {
    fn page_type(&self) -> PageType {
        PageType::Gorilla
    }

    fn encode(&self, points: &[Point], _update_every_s: u32) -> Result<Vec<u8>> {
        let mut w = BitWriter::new();
        if points.is_empty() {
            w.pad_to_block();
            return Ok(w.buf);
        }

        let first = if points[0].is_empty() {
            f32::NAN.to_bits() as u64
        } else {
            (points[0].value as f32).to_bits() as u64
        };
        let mut prev_bits = first;
        w.push_bits(first, 32);

        let mut prev_leading: u32 = u32::MAX;
        let mut prev_trailing: u32 = 0;

        for p in &points[1..] {
            let cur = if p.is_empty() {
                f32::NAN.to_bits() as u64
            } else {
                (p.value as f32).to_bits() as u64
            };
            let xor = (cur ^ prev_bits) as u32;
            if xor == 0 {
                w.push_bit(false);
            } else {
                w.push_bit(true);
                let leading = xor.leading_zeros().min(31);
                let trailing = xor.trailing_zeros();
                if prev_leading != u32::MAX
                    && leading >= prev_leading
                    && trailing >= prev_trailing
                {
                    w.push_bit(false);
                    let meaningful = 32 - prev_leading - prev_trailing;
                    w.push_bits((xor >> prev_trailing) as u64, meaningful);
                } else {
                    w.push_bit(true);
                    w.push_bits(leading as u64, 5);
                    let meaningful = (32 - leading - trailing).max(1);
                    w.push_bits(meaningful as u64 - 1, 6);
                    w.push_bits((xor >> trailing) as u64, meaningful);
                    prev_leading = leading;
                    prev_trailing = trailing;
                }
            }
            prev_bits = cur;
        }

        w.pad_to_block();
        Ok(w.buf)
    }

    fn decode(
        &self,
        bytes: &[u8],
        entries: u32,
        start_time_s: TimestampS,
        update_every_s: u32,
    ) -> Result<Vec<Point>> {
        if entries == 0 {
            return Ok(Vec::new());
        }
        let mut r = BitReader::new(bytes);
        let mut out = Vec::with_capacity(entries as usize);

        let first_bits = r.next_bits(32)? as u32;
        let mut prev_bits = first_bits;
        out.push(bits_to_point(first_bits, start_time_s));

        let mut prev_leading: u32 = u32::MAX;
        let mut prev_trailing: u32 = 0;

        for i in 1..entries {
            let ts = start_time_s + i as i64 * update_every_s as i64;
            let control = r.next_bit()?;
            let cur_bits = if !control {
                prev_bits
            } else {
                let extend = r.next_bit()?;
                if !extend {
                    if prev_leading == u32::MAX {
                        return Err(EngineError::InvalidPage(
                            "gorilla stream: reused window before any was set".into(),
                        ));
                    }
                    let meaningful = 32 - prev_leading - prev_trailing;
                    let bits = r.next_bits(meaningful)? as u32;
                    let xor = bits << prev_trailing;
                    prev_bits ^ xor
                } else {
                    let leading = r.next_bits(5)? as u32;
                    let len_field = r.next_bits(6)? as u32;
                    let meaningful = len_field + 1;
                    let trailing = 32 - leading - meaningful;
                    let bits = r.next_bits(meaningful)? as u32;
                    let xor = bits << trailing;
                    prev_leading = leading;
                    prev_trailing = trailing;
                    prev_bits ^ xor
                }
            };
            out.push(bits_to_point(cur_bits, ts));
            prev_bits = cur_bits;
        }
        Ok(out)
    }
}

fn bits_to_point(bits: u32, ts: TimestampS) -> Point {
    let v = f32::from_bits(bits);
    if v.is_nan() {
        Point::empty(ts)
    } else {
        Point::raw(ts, v as f64, PointFlags::empty())
    }
}
