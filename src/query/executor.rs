//! Query Executor (C10) — walks the planner's segments point by point,
//! interpolating across plan boundaries and feeding a caller-supplied
//! reducer, per §4.6.

use std::collections::VecDeque;

use tracing::warn;

use crate::common::{PointFlags, TimestampS};
use crate::query::planner::QueryPlan;
use crate::query::reducer::Reducer;

/// One decoded sample from a plan's tier, with its validity span. For a
/// raw-tier point `start_s == end_s - update_every_s`; for a tier-1
/// aggregate it is the bucket the aggregate summarizes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourcePoint {
    pub start_s: TimestampS,
    pub end_s: TimestampS,
    pub value: f64,
    pub flags: PointFlags,
}

impl SourcePoint {
    fn duration_s(&self) -> i64 {
        self.end_s - self.start_s
    }
}

/// Drives one query end to end: a sequence of plans, each backed by its
/// own pre-decoded point stream (decoding happens upstream, via the page
/// cache and codec layer).
pub struct QueryExecutor {
    plans: Vec<QueryPlan>,
    sources: Vec<VecDeque<SourcePoint>>,
    plan_idx: usize,
    last1: Option<SourcePoint>,
    new: Option<SourcePoint>,
}

/// One output bucket: its end time, the reduced value, merged flags, and
/// anomaly rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputPoint {
    pub end_time_s: TimestampS,
    pub value: f64,
    pub flags: PointFlags,
    pub anomaly_rate: f64,
}

impl QueryExecutor {
    pub fn new(plans: Vec<QueryPlan>, sources: Vec<VecDeque<SourcePoint>>) -> Self {
        assert_eq!(plans.len(), sources.len(), "one point source per plan");
        Self {
            plans,
            sources,
            plan_idx: 0,
            last1: None,
            new: None,
        }
    }

    fn switch_plan_if_exhausted(&mut self) {
        while self.plan_idx + 1 < self.plans.len()
            && self
                .sources
                .get(self.plan_idx)
                .map(|s| s.is_empty())
                .unwrap_or(true)
        {
            self.plan_idx += 1;
        }
    }

    fn pull_next(&mut self) -> Option<SourcePoint> {
        loop {
            self.switch_plan_if_exhausted();
            let point = self.sources.get_mut(self.plan_idx)?.pop_front()?;
            if let Some(new) = &self.new {
                if point.end_s <= new.end_s {
                    warn!(
                        end_s = point.end_s,
                        prior_end_s = new.end_s,
                        "query executor: dropping non-advancing point"
                    );
                    continue;
                }
            }
            return Some(point);
        }
    }

    fn advance_to(&mut self, now_end_time: TimestampS) {
        while self
            .new
            .map(|n| n.end_s < now_end_time)
            .unwrap_or(true)
        {
            let plan_before = self.plan_idx;
            match self.pull_next() {
                Some(point) => {
                    // A plan switch drops lookback continuity: the new
                    // plan's tier has a different update_every, so
                    // `last1` from the old plan is not contiguous with
                    // anything in the new one.
                    self.last1 = if self.plan_idx != plan_before {
                        None
                    } else {
                        self.new.take()
                    };
                    self.new = Some(point);
                }
                None => break,
            }
        }
    }

    fn select_value(&self, now_end_time: TimestampS) -> Option<(f64, PointFlags)> {
        let new = self.new?;
        if new.start_s > now_end_time || new.end_s < now_end_time {
            // No point actually covers this output time: a gap.
            return None;
        }
        if let Some(last1) = self.last1 {
            let contiguous = last1.end_s == new.start_s;
            let both_finite = last1.value.is_finite() && new.value.is_finite();
            if contiguous && both_finite && new.duration_s() > 1 {
                let span = (new.end_s - last1.end_s).max(1) as f64;
                let frac = (now_end_time - last1.end_s) as f64 / span;
                let interpolated = last1.value + (new.value - last1.value) * frac;
                return Some((interpolated, new.flags));
            }
        }
        Some((new.value, new.flags))
    }

    /// Runs the whole query, producing one output bucket per
    /// `view_update_every_s` step from `after` (exclusive) to `before`.
    pub fn run(
        &mut self,
        after: TimestampS,
        before: TimestampS,
        view_update_every_s: u32,
        reducer: &mut dyn Reducer,
    ) -> Vec<OutputPoint> {
        let step = view_update_every_s.max(1) as i64;
        let mut outputs = Vec::new();
        let mut now_end_time = after + step;

        while now_end_time <= before {
            self.switch_plan_if_exhausted();
            self.advance_to(now_end_time);

            match self.select_value(now_end_time) {
                Some((value, flags)) => {
                    reducer.add(value, flags);
                    let (out_value, out_flags, anomaly_rate) = reducer.flush();
                    outputs.push(OutputPoint {
                        end_time_s: now_end_time,
                        value: out_value,
                        flags: out_flags,
                        anomaly_rate,
                    });
                }
                None => {
                    let mut flags = PointFlags::empty();
                    flags.set(PointFlags::EMPTY);
                    outputs.push(OutputPoint {
                        end_time_s: now_end_time,
                        value: f64::NAN,
                        flags,
                        anomaly_rate: 0.0,
                    });
                }
            }

            now_end_time += step;
        }

        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PageType;
    use crate::query::reducer::AverageReducer;

    fn plan(tier: u8, after: i64, before: i64, uev: u32) -> QueryPlan {
        QueryPlan {
            tier,
            page_type: PageType::Array32,
            after,
            before,
            update_every_s: uev,
        }
    }

    fn pt(start: i64, end: i64, value: f64) -> SourcePoint {
        SourcePoint {
            start_s: start,
            end_s: end,
            value,
            flags: PointFlags::empty(),
        }
    }

    #[test]
    fn straight_pass_through_on_single_plan() {
        let plans = vec![plan(0, 0, 300, 1)];
        let points: VecDeque<_> = (1..=5).map(|i| pt(i - 1, i, i as f64)).collect();
        let mut exec = QueryExecutor::new(plans, vec![points]);
        let mut reducer = AverageReducer::default();
        let out = exec.run(0, 5, 1, &mut reducer);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0].value, 1.0);
        assert_eq!(out[4].value, 5.0);
        assert!(out.iter().all(|p| !p.flags.contains(PointFlags::EMPTY)));
    }

    #[test]
    fn gap_produces_nan_and_empty_flag() {
        let plans = vec![plan(0, 0, 300, 1)];
        let points: VecDeque<_> = VecDeque::from(vec![pt(0, 1, 1.0), pt(5, 6, 6.0)]);
        let mut exec = QueryExecutor::new(plans, vec![points]);
        let mut reducer = AverageReducer::default();
        let out = exec.run(0, 6, 1, &mut reducer);
        assert_eq!(out[0].value, 1.0);
        assert!(out[2].flags.contains(PointFlags::EMPTY));
        assert!(out[2].value.is_nan());
    }

    #[test]
    fn plan_switch_moves_to_next_source_without_losing_points() {
        let plans = vec![plan(1, 0, 3, 1), plan(0, 3, 6, 1)];
        let source0: VecDeque<_> = VecDeque::from(vec![pt(0, 1, 1.0), pt(1, 2, 2.0), pt(2, 3, 3.0)]);
        let source1: VecDeque<_> = VecDeque::from(vec![pt(3, 4, 4.0), pt(4, 5, 5.0), pt(5, 6, 6.0)]);
        let mut exec = QueryExecutor::new(plans, vec![source0, source1]);
        let mut reducer = AverageReducer::default();
        let out = exec.run(0, 6, 1, &mut reducer);
        assert_eq!(out.len(), 6);
        assert_eq!(out[5].value, 6.0);
    }
}
