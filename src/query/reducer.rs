//! Time-grouping reducer contract (§4.6). Concrete reducers (average,
//! median, percentile, stddev, ses, des, ...) are external collaborators;
//! this module only specifies the interface the executor drives and a
//! trivial built-in used by this crate's own tests.

use crate::common::PointFlags;

/// Per-bucket aggregation state. One instance is `create`d per query and
/// `reset` between metrics within a grouping session; it must not mutate
/// anything outside itself.
pub trait Reducer: Send {
    /// Clears accumulated state for a new metric within the same session.
    fn reset(&mut self);

    /// Feeds one raw point's value into the current bucket.
    fn add(&mut self, value: f64, flags: PointFlags);

    /// Closes the current bucket, returning its value and merged flags.
    /// Anomaly rate is carried in the returned flags' caller-visible
    /// companion value.
    fn flush(&mut self) -> (f64, PointFlags, f64);
}

/// Builds fresh reducer instances for a query; reducers are arena-backed
/// state in the original system, modeled here as a trait-object factory.
pub trait ReducerFactory: Send + Sync {
    fn create(&self) -> Box<dyn Reducer>;
}

/// Arithmetic mean reducer — this crate's only built-in, used to exercise
/// the executor in tests; production reducers are supplied by the caller.
#[derive(Default)]
pub struct AverageReducer {
    sum: f64,
    count: u32,
    flags: PointFlags,
    anomalies: u32,
}

impl Reducer for AverageReducer {
    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
        self.flags = PointFlags::empty();
        self.anomalies = 0;
    }

    fn add(&mut self, value: f64, flags: PointFlags) {
        if flags.contains(PointFlags::ANOMALY) {
            self.anomalies += 1;
        }
        self.flags = self.flags.union(flags);
        if value.is_finite() {
            self.sum += value;
            self.count += 1;
        }
    }

    fn flush(&mut self) -> (f64, PointFlags, f64) {
        let value = if self.count == 0 {
            f64::NAN
        } else {
            self.sum / self.count as f64
        };
        let mut flags = self.flags;
        if self.count == 0 {
            flags.set(PointFlags::EMPTY);
        }
        let anomaly_rate = if self.count == 0 {
            0.0
        } else {
            self.anomalies as f64 / self.count as f64 * 100.0
        };
        let result = (value, flags, anomaly_rate);
        self.reset();
        result
    }
}

pub struct AverageReducerFactory;

impl ReducerFactory for AverageReducerFactory {
    fn create(&self) -> Box<dyn Reducer> {
        Box::new(AverageReducer::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_reducer_ignores_non_finite_values() {
        let mut r = AverageReducer::default();
        r.add(10.0, PointFlags::empty());
        r.add(20.0, PointFlags::empty());
        r.add(f64::NAN, PointFlags::EMPTY);
        let (value, flags, _) = r.flush();
        assert_eq!(value, 15.0);
        assert!(flags.contains(PointFlags::EMPTY));
    }

    #[test]
    fn empty_bucket_flushes_nan_with_empty_flag() {
        let mut r = AverageReducer::default();
        let (value, flags, rate) = r.flush();
        assert!(value.is_nan());
        assert!(flags.contains(PointFlags::EMPTY));
        assert_eq!(rate, 0.0);
    }

    #[test]
    fn anomaly_rate_reflects_fraction_of_anomalous_points() {
        let mut r = AverageReducer::default();
        r.add(1.0, PointFlags::ANOMALY);
        r.add(2.0, PointFlags::empty());
        let (_, _, rate) = r.flush();
        assert_eq!(rate, 50.0);
    }
}
