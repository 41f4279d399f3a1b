use super::PageCodec;
use crate::common::{PageType, Point, PointFlags, Tier1Value, TimestampS};
use crate::error::{EngineError, Result};

const TIER1_POINT_SIZE: usize = 12;

/// `ARRAY_TIER1`: `{min:f32, max:f32, sum:f32, count:u16, anomaly_count:u16}`
/// per sample, for downsampled tiers.
pub struct Tier1Codec;

impl PageCodec for Tier1Codec {
    fn page_type(&self) -> PageType {
        PageType::Tier1
    }

    fn encode(&self, points: &[Point], _update_every_s: u32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(points.len() * TIER1_POINT_SIZE);
        for p in points {
            let t1 = p.tier1.unwrap_or(Tier1Value {
                min: f32::NAN,
                max: f32::NAN,
                sum: 0.0,
                count: 0,
                anomaly_count: 0,
            });
            out.extend_from_slice(&t1.min.to_le_bytes());
            out.extend_from_slice(&t1.max.to_le_bytes());
            out.extend_from_slice(&t1.sum.to_le_bytes());
            out.extend_from_slice(&t1.count.to_le_bytes());
            out.extend_from_slice(&t1.anomaly_count.to_le_bytes());
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
        if bytes.len() < entries as usize * TIER1_POINT_SIZE {
            return Err(EngineError::InvalidPage(format!(
                "tier1 page too short: {} bytes for {} entries",
                bytes.len(),
                entries
            )));
        }
        let mut out = Vec::with_capacity(entries as usize);
        for i in 0..entries as usize {
            let base = i * TIER1_POINT_SIZE;
            let min = f32::from_le_bytes(bytes[base..base + 4].try_into().unwrap());
            let max = f32::from_le_bytes(bytes[base + 4..base + 8].try_into().unwrap());
            let sum = f32::from_le_bytes(bytes[base + 8..base + 12].try_into().unwrap());
            let count = u16::from_le_bytes(bytes[base + 12..base + 14].try_into().unwrap());
            let anomaly_count = u16::from_le_bytes(bytes[base + 14..base + 16].try_into().unwrap());
            let ts = start_time_s + i as i64 * update_every_s as i64;
            let t1 = Tier1Value {
                min,
                max,
                sum,
                count,
                anomaly_count,
            };
            if count == 0 {
                out.push(Point::empty(ts));
            } else {
                out.push(Point {
                    timestamp_s: ts,
                    value: t1.average(),
                    tier1: Some(t1),
                    flags: PointFlags::empty(),
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_aggregate() {
        let codec = Tier1Codec;
        let t1 = Tier1Value {
            min: 1.0,
            max: 5.0,
            sum: 20.0,
            count: 10,
            anomaly_count: 2,
        };
        let points = vec![Point {
            timestamp_s: 100,
            value: t1.average(),
            tier1: Some(t1),
            flags: PointFlags::empty(),
        }];
        let bytes = codec.encode(&points, 60).unwrap();
        assert_eq!(bytes.len(), TIER1_POINT_SIZE);
        let back = codec.decode(&bytes, 1, 100, 60).unwrap();
        assert_eq!(back[0].tier1.unwrap().count, 10);
        assert_eq!(back[0].value, 2.0);
    }
}
