use super::PageCodec;
use crate::common::{PageType, Point, PointFlags, TimestampS};
use crate::error::{EngineError, Result};

/// `ARRAY_32BIT`: a 32-bit IEEE float per sample, raw tier. `NaN` encodes
/// an empty point; the sign bit of the exponent-all-ones pattern is not
/// otherwise overloaded, matching the tier's single-value-per-sample shape.
pub struct Array32Codec;

impl PageCodec for Array32Codec {
    fn page_type(&self) -> PageType {
        PageType::Array32
    }

    fn encode(&self, points: &[Point], _update_every_s: u32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(points.len() * 4);
        for p in points {
            let v = if p.is_empty() { f32::NAN } else { p.value as f32 };
            out.extend_from_slice(&v.to_le_bytes());
        }
        Ok(out)
    }

    fn decode(
        &self,
        bytes: &[u8],
        entries: u32,
        start_time_s: TimestampS,
        update_every_s: u32,
    ) -> Result<Vec<Point>> {
        if bytes.len() < entries as usize * 4 {
            return Err(EngineError::InvalidPage(format!(
                "array32 page too short: {} bytes for {} entries",
                bytes.len(),
                entries
            )));
        }
        let mut out = Vec::with_capacity(entries as usize);
        for i in 0..entries as usize {
            let raw = u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
            let v = f32::from_bits(raw);
            let ts = start_time_s + i as i64 * update_every_s as i64;
            if v.is_nan() {
                out.push(Point::empty(ts));
            } else {
                out.push(Point::raw(ts, v as f64, PointFlags::empty()));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_values_and_gaps() {
        let codec = Array32Codec;
        let points = vec![
            Point::raw(1000, 1.5, PointFlags::empty()),
            Point::empty(1001),
            Point::raw(1002, -3.25, PointFlags::empty()),
        ];
        let bytes = codec.encode(&points, 1).unwrap();
        let back = codec.decode(&bytes, 3, 1000, 1).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[0].value, 1.5);
        assert!(back[1].is_empty());
        assert_eq!(back[2].value, -3.25);
        assert_eq!(back[2].timestamp_s, 1002);
    }
}
