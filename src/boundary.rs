//! Global cutoff estimation for size-bounded ranked aggregations.
//!
//! Every shard answers the initial request with a locally truncated prefix of
//! its ranking. Entries it did not report rank strictly after its cutoff. The
//! estimator decides which shards could still hide an entry that belongs in
//! the global top `number`, and how far down each of them has to look.
//!
//! For descending sorts over non-negative values the per-shard bounds never
//! add up to more than the candidate boundary, so a key missing from every
//! shard's refined answer cannot reach the global top. Ascending sorts keep
//! the candidate as the bound and are best effort.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aggregate::{Coverage, RankedList, SortDirection, SortSpec};
use crate::numeric::Numeric;
use crate::transport::ShardId;

/// A numeric cutoff together with the direction it is interpreted in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComparableBoundary {
    value: Numeric,
    direction: SortDirection,
}

impl ComparableBoundary {
    pub fn new(value: Numeric, direction: SortDirection) -> Self {
        Self { value, direction }
    }

    pub fn value(&self) -> Numeric {
        self.value
    }

    pub fn direction(&self) -> SortDirection {
        self.direction
    }

    pub fn add(&mut self, value: Numeric) {
        self.value = self.value + value;
    }

    pub fn subtract(&mut self, value: Numeric) {
        self.value = self.value - value;
    }

    /// Plain numeric comparison of the boundary against `raw`.
    pub fn compare(&self, raw: Numeric) -> Ordering {
        self.value.compare(raw)
    }

    /// `raw` ranks strictly before the boundary.
    pub fn is_beaten_by(&self, raw: Numeric) -> bool {
        self.direction.better(raw, self.value)
    }

    /// `self` demands less data than `other`: higher for descending sorts,
    /// lower for ascending ones.
    pub fn is_tighter_than(&self, other: &ComparableBoundary) -> bool {
        self.direction.better(self.value, other.value)
    }

    /// Share of the boundary each of `n` shards has to cover. Descending
    /// boundaries are divided (floor division for longs); ascending ones are
    /// kept as they are.
    pub fn recompute_boundary(&self, n: usize) -> ComparableBoundary {
        match self.direction {
            SortDirection::Desc if n > 0 => {
                Self::new(self.value.floor_div(n as i64), self.direction)
            }
            _ => *self,
        }
    }
}

/// One shard's view of a ranked aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardContribution {
    pub shard: ShardId,
    /// `(key, sort value)` in the shard's local order.
    pub entries: Vec<(String, Numeric)>,
    /// Sort value of the last retained entry; `None` when nothing was cut.
    pub local_boundary: Option<Numeric>,
}

impl ShardContribution {
    pub fn from_ranked(shard: ShardId, list: &RankedList) -> Self {
        let local_boundary = match list.coverage() {
            Coverage::Truncated | Coverage::AboveBoundary => list.last_sort_value(),
            Coverage::Complete | Coverage::KeysOnly => None,
        };
        Self {
            shard,
            entries: list.ranked_values(),
            local_boundary,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.local_boundary.is_none()
    }

    pub fn key_set(&self) -> BTreeSet<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }
}

/// Bound assigned to one truncated shard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShardBound {
    pub shard: ShardId,
    pub cutoff: Numeric,
    pub bound: ComparableBoundary,
    /// The shard stopped before reaching `bound` and must be asked again.
    pub flagged: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BoundaryEstimate {
    /// Value of the `number`-th best merged entry.
    pub candidate: Option<ComparableBoundary>,
    /// Fewer merged entries than requested; the union is already exact.
    pub underflow: bool,
    /// Distinct keys across all contributions.
    pub merged_entries: usize,
    pub bounds: Vec<ShardBound>,
}

impl BoundaryEstimate {
    pub fn needs_refinement(&self) -> bool {
        self.bounds.iter().any(|b| b.flagged)
    }

    /// Shards to ask again, with the boundary each must search down to.
    pub fn flagged(&self) -> impl Iterator<Item = (ShardId, Numeric)> + '_ {
        self.bounds
            .iter()
            .filter(|b| b.flagged)
            .map(|b| (b.shard, b.bound.value()))
    }
}

/// Merge contributions per key and rank them; ties go to the smaller key.
pub fn merged_ranking(
    contributions: &[ShardContribution],
    direction: SortDirection,
) -> Vec<(String, Numeric)> {
    let mut summed: BTreeMap<&str, Numeric> = BTreeMap::new();
    for contribution in contributions {
        for (key, value) in &contribution.entries {
            let slot = summed.entry(key.as_str()).or_insert(Numeric::ZERO);
            *slot = *slot + *value;
        }
    }
    let mut ranked: Vec<(String, Numeric)> = summed
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    ranked.sort_by(|a, b| direction.rank(a.1, b.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

/// Decide which shards need a boundary request for a ranked aggregation
/// asking for `number` entries.
pub fn estimate(
    contributions: &[ShardContribution],
    sort: SortSpec,
    number: i64,
) -> BoundaryEstimate {
    if !sort.needs_boundary() {
        return BoundaryEstimate::default();
    }
    let direction = sort.direction;
    let ranked = merged_ranking(contributions, direction);
    let mut plan = BoundaryEstimate {
        merged_entries: ranked.len(),
        ..BoundaryEstimate::default()
    };
    if number <= 0 || (ranked.len() as i64) < number {
        plan.underflow = number > 0;
        return plan;
    }
    let candidate = ComparableBoundary::new(ranked[(number - 1) as usize].1, direction);
    plan.candidate = Some(candidate);

    let mut truncated: Vec<(ShardId, Numeric)> = contributions
        .iter()
        .filter_map(|c| c.local_boundary.map(|b| (c.shard, b)))
        .collect();
    if truncated.is_empty() {
        return plan;
    }
    truncated.sort_by(|a, b| a.1.compare(b.1).then_with(|| a.0.cmp(&b.0)));

    let shards = truncated.len();
    let main = candidate.recompute_boundary(shards);
    debug!(
        candidate = %candidate.value(),
        main = %main.value(),
        shards,
        "estimating boundary"
    );

    let mut sum: Option<ComparableBoundary> = None;
    for (processed, (shard, cutoff)) in truncated.into_iter().enumerate() {
        let mut bound = main;
        let mut flagged = main.is_beaten_by(cutoff);
        if flagged {
            if let (Some(accounted), SortDirection::Desc) = (sum, direction) {
                let mut remaining = candidate;
                remaining.subtract(accounted.value());
                let alternative = remaining.recompute_boundary(shards - processed);
                if alternative.is_tighter_than(&bound) {
                    bound = alternative;
                    flagged = bound.is_beaten_by(cutoff);
                }
            }
        } else {
            bound = ComparableBoundary::new(cutoff, direction);
        }
        match sum.as_mut() {
            Some(total) => total.add(bound.value()),
            None => sum = Some(bound),
        }
        plan.bounds.push(ShardBound {
            shard,
            cutoff,
            bound,
            flagged,
        });
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::SortType;

    fn contribution(shard: u32, entries: &[(&str, i64)], truncated: bool) -> ShardContribution {
        ShardContribution {
            shard: ShardId(shard),
            entries: entries
                .iter()
                .map(|(k, v)| (k.to_string(), Numeric::Long(*v)))
                .collect(),
            local_boundary: if truncated {
                entries.last().map(|(_, v)| Numeric::Long(*v))
            } else {
                None
            },
        }
    }

    fn desc() -> SortSpec {
        SortSpec::new(SortType::N, SortDirection::Desc)
    }

    #[test]
    fn recompute_divides_descending_only() {
        let desc = ComparableBoundary::new(Numeric::Long(10), SortDirection::Desc);
        assert_eq!(desc.recompute_boundary(3).value(), Numeric::Long(3));
        assert_eq!(desc.recompute_boundary(0).value(), Numeric::Long(10));
        let asc = ComparableBoundary::new(Numeric::Long(10), SortDirection::Asc);
        assert_eq!(asc.recompute_boundary(3).value(), Numeric::Long(10));
    }

    #[test]
    fn recompute_on_subset_is_never_looser() {
        let candidate = ComparableBoundary::new(Numeric::Long(97), SortDirection::Desc);
        let all = candidate.recompute_boundary(5);
        for subset in 1..=5 {
            let partial = candidate.recompute_boundary(subset);
            assert!(!all.is_tighter_than(&partial), "subset {subset}");
        }
    }

    #[test]
    fn boundary_arithmetic() {
        let mut b = ComparableBoundary::new(Numeric::Long(10), SortDirection::Desc);
        b.subtract(Numeric::Long(4));
        b.add(Numeric::Double(0.5));
        assert_eq!(b.value(), Numeric::Double(6.5));
        assert_eq!(b.compare(Numeric::Long(7)), Ordering::Less);
        assert!(b.is_beaten_by(Numeric::Long(7)));
        assert!(!b.is_beaten_by(Numeric::Double(6.5)));
    }

    #[test]
    fn three_shard_scenario_flags_every_truncated_shard() {
        let contributions = vec![
            contribution(0, &[("a", 10), ("b", 9)], true),
            contribution(1, &[("c", 8), ("d", 7)], true),
            contribution(2, &[("e", 12), ("f", 11)], true),
        ];
        let ranked = merged_ranking(&contributions, SortDirection::Desc);
        let top: Vec<_> = ranked.iter().take(3).map(|(k, _)| k.as_str()).collect();
        assert_eq!(top, vec!["e", "f", "a"]);

        let plan = estimate(&contributions, desc(), 3);
        assert_eq!(
            plan.candidate.map(|c| c.value()),
            Some(Numeric::Long(10))
        );
        let flagged: Vec<_> = plan.flagged().collect();
        assert_eq!(
            flagged,
            vec![
                (ShardId(1), Numeric::Long(3)),
                (ShardId(0), Numeric::Long(3)),
                (ShardId(2), Numeric::Long(4)),
            ]
        );
    }

    #[test]
    fn bounds_never_exceed_candidate() {
        let contributions = vec![
            contribution(0, &[("a", 40), ("b", 30)], true),
            contribution(1, &[("c", 25), ("d", 2)], true),
            contribution(2, &[("e", 50), ("f", 45)], true),
            contribution(3, &[("a", 1)], false),
        ];
        let plan = estimate(&contributions, desc(), 3);
        let candidate = plan.candidate.unwrap().value();
        let total = plan
            .bounds
            .iter()
            .fold(Numeric::ZERO, |acc, b| acc + b.bound.value());
        assert!(total.compare(candidate) != Ordering::Greater);
    }

    #[test]
    fn low_cutoffs_need_no_refinement() {
        let contributions = vec![
            contribution(0, &[("a", 10), ("b", 1)], true),
            contribution(1, &[("c", 9), ("d", 2)], true),
        ];
        let plan = estimate(&contributions, desc(), 2);
        assert_eq!(plan.candidate.unwrap().value(), Numeric::Long(9));
        assert!(!plan.needs_refinement());
    }

    #[test]
    fn alternative_boundary_tightens_later_shards() {
        // candidate 6, main 3; shard 0 is clear at its cutoff 1, shard 1
        // gets (6 - 1) / 1 = 5 and still has to search down to it.
        let contributions = vec![
            contribution(0, &[("a", 10), ("b", 1)], true),
            contribution(1, &[("c", 9), ("d", 6)], true),
        ];
        let plan = estimate(&contributions, desc(), 3);
        assert_eq!(plan.candidate.unwrap().value(), Numeric::Long(6));
        assert_eq!(plan.bounds[0].bound.value(), Numeric::Long(1));
        assert!(!plan.bounds[0].flagged);
        assert_eq!(plan.bounds[1].bound.value(), Numeric::Long(5));
        assert!(plan.bounds[1].flagged);
    }

    #[test]
    fn alternative_boundary_can_clear_a_shard() {
        // candidate 12, main 6; shard 1 (cutoff 7) passes (12 - 1) / 1 = 11.
        let contributions = vec![
            contribution(0, &[("a", 20), ("b", 1)], true),
            contribution(1, &[("c", 12), ("d", 8), ("e", 7)], true),
            contribution(2, &[("d", 4)], false),
        ];
        let plan = estimate(&contributions, desc(), 3);
        assert_eq!(plan.candidate.unwrap().value(), Numeric::Long(12));
        assert_eq!(plan.bounds[1].bound.value(), Numeric::Long(11));
        assert!(!plan.needs_refinement());
    }

    #[test]
    fn complete_shards_are_never_flagged() {
        let contributions = vec![
            contribution(0, &[("a", 10), ("b", 9)], false),
            contribution(1, &[("c", 8), ("d", 7)], false),
        ];
        let plan = estimate(&contributions, desc(), 3);
        assert!(plan.candidate.is_some());
        assert!(plan.bounds.is_empty());
        assert!(!plan.needs_refinement());
    }

    #[test]
    fn underflow_skips_refinement() {
        let contributions = vec![contribution(0, &[("a", 10)], true)];
        let plan = estimate(&contributions, desc(), 3);
        assert!(plan.underflow);
        assert!(plan.candidate.is_none());
        assert!(!plan.needs_refinement());

        let plan = estimate(&contributions, desc(), 0);
        assert!(!plan.underflow);
        assert!(!plan.needs_refinement());
    }

    #[test]
    fn term_sort_is_never_refined() {
        let contributions = vec![contribution(0, &[("a", 10), ("b", 9)], true)];
        let sort = SortSpec::new(SortType::Term, SortDirection::Asc);
        assert!(!estimate(&contributions, sort, 1).needs_refinement());
    }

    #[test]
    fn ascending_uses_candidate_unchanged() {
        let contributions = vec![
            contribution(0, &[("a", 1), ("b", 2)], true),
            contribution(1, &[("c", 3), ("d", 8)], true),
        ];
        let sort = SortSpec::new(SortType::Sum, SortDirection::Asc);
        let plan = estimate(&contributions, sort, 3);
        assert_eq!(plan.candidate.unwrap().value(), Numeric::Long(3));
        let flagged: Vec<_> = plan.flagged().collect();
        assert_eq!(flagged, vec![(ShardId(0), Numeric::Long(3))]);
    }
}
