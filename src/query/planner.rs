//! Query Planner (C9) — picks which tier(s) answer `(metric, after,
//! before, points_wanted)` and builds a sequence of non-overlapping
//! plans spanning the requested range.

use crate::common::{PageType, TimestampS};

/// Upper bound on how many tier segments one query can stitch together.
pub const QUERY_PLANS_MAX: usize = 8;

/// How many `update_every` units a plan's upper boundary is extended by,
/// so the executor has lookahead points for interpolation across a plan
/// switch (§4.3 step 5, §4.6).
const READ_AHEAD_POINTS: i64 = 2;

/// One tier's current retention window, as the planner needs it.
#[derive(Debug, Clone, Copy)]
pub struct TierRetention {
    pub tier: u8,
    pub page_type: PageType,
    pub first_time_s: TimestampS,
    pub last_time_s: TimestampS,
    pub update_every_s: u32,
}

/// One segment of the overall query, entirely served by one tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryPlan {
    pub tier: u8,
    pub page_type: PageType,
    pub after: TimestampS,
    pub before: TimestampS,
    pub update_every_s: u32,
}

fn overlap(tier: &TierRetention, after: TimestampS, before: TimestampS) -> Option<(TimestampS, TimestampS)> {
    let start = tier.first_time_s.max(after);
    let end = tier.last_time_s.min(before);
    if end > start {
        Some((start, end))
    } else {
        None
    }
}

fn score_tier(tier: &TierRetention, after: TimestampS, before: TimestampS, points_wanted: u32) -> f64 {
    let Some((start, end)) = overlap(tier, after, before) else {
        return f64::NEG_INFINITY;
    };
    let overlap_dur = (end - start) as f64;
    let total_dur = (before - after).max(1) as f64;
    let coverage_ratio = (overlap_dur / total_dur).min(1.0);

    let update_every = tier.update_every_s.max(1) as f64;
    let points_available = overlap_dur / update_every;
    let wanted = points_wanted.max(1) as f64;
    let deviation = ((points_available - wanted).abs() / wanted).min(1.0);
    let points_score = 1.0 - deviation;

    let tier_bonus = tier.tier as f64 * 0.01;
    coverage_ratio * 0.7 + points_score * 0.3 + tier_bonus
}

fn best_tier<'a>(
    tiers: &'a [TierRetention],
    after: TimestampS,
    before: TimestampS,
    points_wanted: u32,
    pinned_tier: Option<u8>,
) -> Option<&'a TierRetention> {
    if let Some(pinned) = pinned_tier {
        if let Some(t) = tiers
            .iter()
            .find(|t| t.tier == pinned && overlap(t, after, before).is_some())
        {
            return Some(t);
        }
    }
    tiers
        .iter()
        .filter(|t| overlap(t, after, before).is_some())
        .max_by(|a, b| {
            score_tier(a, after, before, points_wanted)
                .partial_cmp(&score_tier(b, after, before, points_wanted))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

fn plan_from_tier(tier: &TierRetention, after: TimestampS, before: TimestampS) -> QueryPlan {
    let (start, end) = overlap(tier, after, before).expect("caller guarantees overlap");
    QueryPlan {
        tier: tier.tier,
        page_type: tier.page_type,
        after: start,
        before: end,
        update_every_s: tier.update_every_s,
    }
}

/// Builds the ordered list of plans answering the query. Returns an empty
/// vec if no tier has any data in range.
pub fn plan_query(
    tiers: &[TierRetention],
    after: TimestampS,
    before: TimestampS,
    points_wanted: u32,
    pinned_tier: Option<u8>,
) -> Vec<QueryPlan> {
    let Some(spine_tier) = best_tier(tiers, after, before, points_wanted, pinned_tier) else {
        return Vec::new();
    };
    let mut plans = vec![plan_from_tier(spine_tier, after, before)];

    // Backward: fill [after, first_plan.after) with higher (coarser) tiers.
    while plans.first().unwrap().after > after && plans.len() < QUERY_PLANS_MAX {
        let gap_before = plans.first().unwrap().after;
        let current_tier = plans.first().unwrap().tier;
        let candidate = tiers
            .iter()
            .filter(|t| t.tier > current_tier)
            .filter_map(|t| overlap(t, after, gap_before).map(|ov| (t, ov)))
            .max_by_key(|(_, (s, e))| *e - *s);
        match candidate {
            Some((tier, (start, end))) => {
                plans.insert(
                    0,
                    QueryPlan {
                        tier: tier.tier,
                        page_type: tier.page_type,
                        after: start,
                        before: end,
                        update_every_s: tier.update_every_s,
                    },
                );
            }
            None => break,
        }
    }

    // Forward: fill (last_plan.before, before] with lower (finer) tiers.
    while plans.last().unwrap().before < before && plans.len() < QUERY_PLANS_MAX {
        let gap_after = plans.last().unwrap().before;
        let current_tier = plans.last().unwrap().tier;
        let candidate = tiers
            .iter()
            .filter(|t| t.tier < current_tier)
            .filter_map(|t| overlap(t, gap_after, before).map(|ov| (t, ov)))
            .max_by_key(|(_, (s, e))| *e - *s);
        match candidate {
            Some((tier, (start, end))) => {
                plans.push(QueryPlan {
                    tier: tier.tier,
                    page_type: tier.page_type,
                    after: start,
                    before: end,
                    update_every_s: tier.update_every_s,
                });
            }
            None => break,
        }
    }

    plans.sort_by_key(|p| p.after);

    // Read-ahead: extend each non-last plan's `before` a little so the
    // executor has lookahead points to interpolate across the switch,
    // without creating an actual time overlap between plans.
    for i in 0..plans.len().saturating_sub(1) {
        let next_after = plans[i + 1].after;
        let extension = READ_AHEAD_POINTS * plans[i].update_every_s.max(1) as i64;
        plans[i].before = (plans[i].before + extension).min(next_after);
    }

    plans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(tier: u8, first: i64, last: i64, update_every: u32) -> TierRetention {
        TierRetention {
            tier,
            page_type: PageType::Array32,
            first_time_s: first,
            last_time_s: last,
            update_every_s: update_every,
        }
    }

    #[test]
    fn single_tier_covering_full_range_yields_one_plan() {
        let tiers = vec![tier(0, 0, 10_000, 1)];
        let plans = plan_query(&tiers, 100, 5000, 600, None);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].tier, 0);
    }

    #[test]
    fn pinned_tier_is_honored_when_it_has_data() {
        let tiers = vec![tier(0, 0, 10_000, 1), tier(1, 0, 10_000, 60)];
        let plans = plan_query(&tiers, 0, 10_000, 100, Some(1));
        assert_eq!(plans[0].tier, 1);
    }

    #[test]
    fn backward_extension_fills_gap_with_higher_tier() {
        // tier 0 only has recent data; tier 1 covers the whole range.
        let tiers = vec![tier(0, 5000, 10_000, 1), tier(1, 0, 10_000, 60)];
        let plans = plan_query(&tiers, 0, 10_000, 1000, Some(0));
        assert!(plans.len() >= 2);
        assert_eq!(plans[0].tier, 1);
        assert_eq!(plans[0].after, 0);
        assert_eq!(plans.last().unwrap().tier, 0);
    }

    #[test]
    fn plans_never_overlap_and_span_requested_range() {
        let tiers = vec![tier(0, 5000, 10_000, 1), tier(1, 0, 10_000, 60)];
        let plans = plan_query(&tiers, 0, 10_000, 1000, Some(0));
        for w in plans.windows(2) {
            assert!(w[0].before <= w[1].after);
        }
        assert_eq!(plans.first().unwrap().after, 0);
    }

    #[test]
    fn no_coverage_returns_empty_plan_list() {
        let tiers = vec![tier(0, 50_000, 60_000, 1)];
        let plans = plan_query(&tiers, 0, 1000, 100, None);
        assert!(plans.is_empty());
    }
}
