//! Opaque mergeable leaves: a statistics accumulator and a ranked list of
//! keyed statistics.
//!
//! Both travel inside a [`ResultTree`] as [`ResultTree::Mergeable`] and are
//! combined with [`Mergeable::merge`] rather than structurally.

use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MergeError, ParamError};
use crate::numeric::Numeric;
use crate::tree::{KeyedItem, OrderedMap, ResultTree};

/// Contract shared by every opaque leaf.
pub trait Mergeable {
    /// Fold `other` into `self`.
    fn merge(&mut self, other: &Self) -> Result<(), MergeError>;

    /// Whether the rendered view should carry the total number of entries.
    fn with_total(&self) -> bool;

    fn set_with_total(&mut self, with_total: bool);

    fn size(&self) -> usize;

    /// Display form of the leaf.
    fn result_view(&self) -> ResultTree;
}

// =============================================================================
// Sorting
// =============================================================================

/// What a ranked list is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortType {
    /// Entry key; never needs boundary refinement.
    Term,
    /// Number of observations.
    #[default]
    N,
    /// Sum of observed values.
    Sum,
}

impl SortType {
    pub fn as_str(self) -> &'static str {
        match self {
            SortType::Term => "term",
            SortType::N => "n",
            SortType::Sum => "sum",
        }
    }
}

impl FromStr for SortType {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "term" => Ok(SortType::Term),
            "n" | "count" => Ok(SortType::N),
            "sum" => Ok(SortType::Sum),
            other => Err(ParamError::Invalid {
                key: "sort.type".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }

    /// Ranking order: `Less` means `a` ranks before `b`.
    pub fn rank(self, a: Numeric, b: Numeric) -> Ordering {
        match self {
            SortDirection::Asc => a.compare(b),
            SortDirection::Desc => b.compare(a),
        }
    }

    /// `a` ranks strictly before `b`.
    pub fn better(self, a: Numeric, b: Numeric) -> bool {
        self.rank(a, b) == Ordering::Less
    }
}

impl FromStr for SortDirection {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            other => Err(ParamError::Invalid {
                key: "sort.direction".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SortSpec {
    pub sort_type: SortType,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn new(sort_type: SortType, direction: SortDirection) -> Self {
        Self {
            sort_type,
            direction,
        }
    }

    pub fn needs_boundary(self) -> bool {
        self.sort_type != SortType::Term
    }
}

impl fmt::Display for SortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.sort_type.as_str(), self.direction.as_str())
    }
}

// =============================================================================
// Statistics accumulator
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsAccumulator {
    n: u64,
    sum: Numeric,
    min: Option<Numeric>,
    max: Option<Numeric>,
    sum_of_squares: f64,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Numeric>,
    {
        let mut stats = Self::new();
        for value in values {
            stats.observe(value);
        }
        stats
    }

    pub fn observe(&mut self, value: Numeric) {
        self.n += 1;
        self.sum = self.sum + value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
        let v = value.as_f64();
        self.sum_of_squares += v * v;
    }

    pub fn n(&self) -> u64 {
        self.n
    }

    pub fn sum(&self) -> Numeric {
        self.sum
    }

    pub fn mean(&self) -> Option<f64> {
        (self.n > 0).then(|| self.sum.as_f64() / self.n as f64)
    }

    /// Sample variance; zero for fewer than two observations.
    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            return 0.0;
        }
        let n = self.n as f64;
        let sum = self.sum.as_f64();
        ((self.sum_of_squares - sum * sum / n) / (n - 1.0)).max(0.0)
    }

    /// Value a ranked list orders this entry by. `None` for term sorts.
    pub fn sort_value(&self, sort_type: SortType) -> Option<Numeric> {
        match sort_type {
            SortType::Term => None,
            SortType::N => Some(Numeric::Long(self.n as i64)),
            SortType::Sum => Some(self.sum),
        }
    }

    fn absorb(&mut self, other: &StatsAccumulator) {
        self.n += other.n;
        self.sum = self.sum + other.sum;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.sum_of_squares += other.sum_of_squares;
    }
}

impl Mergeable for StatsAccumulator {
    fn merge(&mut self, other: &Self) -> Result<(), MergeError> {
        self.absorb(other);
        Ok(())
    }

    fn with_total(&self) -> bool {
        false
    }

    fn set_with_total(&mut self, _with_total: bool) {}

    fn size(&self) -> usize {
        1
    }

    fn result_view(&self) -> ResultTree {
        let mut view = OrderedMap::new();
        view.insert("n", ResultTree::long_counter(self.n as i64));
        view.insert("sum", ResultTree::number(self.sum));
        if let Some(mean) = self.mean() {
            view.insert("mean", ResultTree::number(mean));
        }
        if let Some(min) = self.min {
            view.insert("min", ResultTree::number(min));
        }
        if let Some(max) = self.max {
            view.insert("max", ResultTree::number(max));
        }
        let variance = self.variance();
        view.insert("variance", ResultTree::number(variance));
        view.insert("standarddeviation", ResultTree::number(variance.sqrt()));
        ResultTree::Map(view)
    }
}

// =============================================================================
// Ranked list
// =============================================================================

/// How much of its local data a shard's ranked list covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Coverage {
    /// Every local key is present.
    #[default]
    Complete,
    /// Only the specific keys that were asked for.
    KeysOnly,
    /// Every local entry at least as good as a boundary.
    AboveBoundary,
    /// A prefix of the local order, ties at the cutoff included.
    Truncated,
}

impl Coverage {
    fn weight(self) -> u8 {
        match self {
            Coverage::Complete => 0,
            Coverage::KeysOnly => 1,
            Coverage::AboveBoundary => 2,
            Coverage::Truncated => 3,
        }
    }

    /// Coverage of a combination; complete only if both sides are.
    pub fn combine(self, other: Coverage) -> Coverage {
        if other.weight() > self.weight() {
            other
        } else {
            self
        }
    }
}

/// Keyed statistics ordered by a [`SortSpec`] and bounded to `number`
/// entries once finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedList {
    sort: SortSpec,
    number: i64,
    entries: BTreeMap<String, StatsAccumulator>,
    with_total: bool,
    coverage: Coverage,
    last_sort_value: Option<Numeric>,
}

impl RankedList {
    /// `number <= 0` requests every entry.
    pub fn new(sort: SortSpec, number: i64) -> Self {
        Self {
            sort,
            number,
            entries: BTreeMap::new(),
            with_total: false,
            coverage: Coverage::Complete,
            last_sort_value: None,
        }
    }

    pub fn with_total_flag(mut self, with_total: bool) -> Self {
        self.with_total = with_total;
        self
    }

    pub fn sort(&self) -> SortSpec {
        self.sort
    }

    pub fn number(&self) -> i64 {
        self.number
    }

    pub fn set_number(&mut self, number: i64) {
        self.number = number;
    }

    pub fn coverage(&self) -> Coverage {
        self.coverage
    }

    /// Sort value of the last retained entry when the list was cut locally.
    pub fn last_sort_value(&self) -> Option<Numeric> {
        self.last_sort_value
    }

    pub fn is_complete(&self) -> bool {
        self.coverage == Coverage::Complete
    }

    pub fn get(&self, key: &str) -> Option<&StatsAccumulator> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn key_set(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn observe(&mut self, key: impl Into<String>, value: Numeric) {
        self.entries.entry(key.into()).or_default().observe(value);
    }

    pub fn insert(&mut self, key: impl Into<String>, stats: StatsAccumulator) {
        match self.entries.entry(key.into()) {
            Entry::Occupied(mut slot) => slot.get_mut().absorb(&stats),
            Entry::Vacant(slot) => {
                slot.insert(stats);
            }
        }
    }

    fn compare_entries(
        &self,
        a: (&String, &StatsAccumulator),
        b: (&String, &StatsAccumulator),
    ) -> Ordering {
        match (
            a.1.sort_value(self.sort.sort_type),
            b.1.sort_value(self.sort.sort_type),
        ) {
            (Some(va), Some(vb)) => self.sort.direction.rank(va, vb).then_with(|| a.0.cmp(b.0)),
            _ => match self.sort.direction {
                SortDirection::Asc => a.0.cmp(b.0),
                SortDirection::Desc => b.0.cmp(a.0),
            },
        }
    }

    /// Entries in final order: sort value per direction, ties by ascending key.
    pub fn sorted(&self) -> Vec<(&String, &StatsAccumulator)> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by(|a, b| self.compare_entries(*a, *b));
        entries
    }

    /// `(key, sort value)` pairs in final order. Empty for term sorts.
    pub fn ranked_values(&self) -> Vec<(String, Numeric)> {
        self.sorted()
            .into_iter()
            .filter_map(|(key, stats)| {
                stats
                    .sort_value(self.sort.sort_type)
                    .map(|v| (key.clone(), v))
            })
            .collect()
    }

    /// Shard-side cut to `limit` entries, keeping every entry tied with the
    /// last one retained. `limit <= 0` keeps everything.
    pub fn truncate_local(&mut self, limit: i64) {
        if limit <= 0 || self.entries.len() as i64 <= limit {
            self.coverage = Coverage::Complete;
            self.last_sort_value = None;
            return;
        }
        let sorted: Vec<(String, Option<Numeric>)> = self
            .sorted()
            .into_iter()
            .map(|(k, s)| (k.clone(), s.sort_value(self.sort.sort_type)))
            .collect();
        let cutoff = sorted[(limit - 1) as usize].1;
        let keep: BTreeSet<String> = sorted
            .iter()
            .enumerate()
            .take_while(|(idx, (_, value))| {
                (*idx as i64) < limit
                    || matches!((value, cutoff), (Some(v), Some(c)) if v.compare(c) == Ordering::Equal)
            })
            .map(|(_, (k, _))| k.clone())
            .collect();
        if keep.len() == self.entries.len() {
            self.coverage = Coverage::Complete;
            self.last_sort_value = None;
            return;
        }
        self.entries.retain(|k, _| keep.contains(k));
        self.coverage = Coverage::Truncated;
        self.last_sort_value = cutoff;
    }

    /// Shard-side answer to a boundary request: every entry at least as good
    /// as `boundary`, with no count limit.
    pub fn retain_from_boundary(&mut self, boundary: Numeric) {
        let sort = self.sort;
        self.entries.retain(|_, stats| match stats.sort_value(sort.sort_type) {
            Some(v) => !sort.direction.better(boundary, v),
            None => true,
        });
        self.coverage = Coverage::AboveBoundary;
        self.last_sort_value = Some(boundary);
    }

    /// Shard-side answer to a key request.
    pub fn retain_keys(&mut self, keys: &BTreeSet<String>) {
        self.entries.retain(|k, _| keys.contains(k));
        self.coverage = Coverage::KeysOnly;
        self.last_sort_value = None;
    }

    /// Final cut to exactly `number` entries in final order.
    pub fn truncate_to_number(&mut self) {
        if self.number <= 0 || self.entries.len() as i64 <= self.number {
            return;
        }
        let keep: BTreeSet<String> = self
            .sorted()
            .into_iter()
            .take(self.number as usize)
            .map(|(k, _)| k.clone())
            .collect();
        self.entries.retain(|k, _| keep.contains(k));
    }
}

impl Mergeable for RankedList {
    fn merge(&mut self, other: &Self) -> Result<(), MergeError> {
        for (key, stats) in &other.entries {
            match self.entries.get_mut(key) {
                Some(existing) => existing.absorb(stats),
                None => {
                    self.entries.insert(key.clone(), stats.clone());
                }
            }
        }
        self.coverage = self.coverage.combine(other.coverage);
        if self.last_sort_value.is_none() {
            self.last_sort_value = other.last_sort_value;
        }
        Ok(())
    }

    fn with_total(&self) -> bool {
        self.with_total
    }

    fn set_with_total(&mut self, with_total: bool) {
        self.with_total = with_total;
    }

    fn size(&self) -> usize {
        self.entries.len()
    }

    fn result_view(&self) -> ResultTree {
        let limit = if self.number > 0 {
            self.number as usize
        } else {
            usize::MAX
        };
        let list = self
            .sorted()
            .into_iter()
            .take(limit)
            .map(|(key, stats)| KeyedItem::new(key.clone(), stats.result_view()))
            .collect();
        let mut view = OrderedMap::new();
        if self.with_total {
            view.insert("total", ResultTree::long_counter(self.entries.len() as i64));
        }
        view.insert("list", ResultTree::KeyedList(list));
        ResultTree::Map(view)
    }
}

// =============================================================================
// Closed union of leaves
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Aggregate {
    Stats(StatsAccumulator),
    Ranked(RankedList),
}

impl Aggregate {
    pub fn kind(&self) -> &'static str {
        match self {
            Aggregate::Stats(_) => "stats",
            Aggregate::Ranked(_) => "ranked",
        }
    }

    pub fn as_ranked(&self) -> Option<&RankedList> {
        match self {
            Aggregate::Ranked(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_ranked_mut(&mut self) -> Option<&mut RankedList> {
        match self {
            Aggregate::Ranked(list) => Some(list),
            _ => None,
        }
    }
}

impl Mergeable for Aggregate {
    fn merge(&mut self, other: &Self) -> Result<(), MergeError> {
        match (self, other) {
            (Aggregate::Stats(a), Aggregate::Stats(b)) => a.merge(b),
            (Aggregate::Ranked(a), Aggregate::Ranked(b)) => a.merge(b),
            (a, b) => Err(MergeError::KindMismatch {
                path: String::new(),
                dest: a.kind(),
                src: b.kind(),
            }),
        }
    }

    fn with_total(&self) -> bool {
        match self {
            Aggregate::Stats(s) => s.with_total(),
            Aggregate::Ranked(r) => r.with_total(),
        }
    }

    fn set_with_total(&mut self, with_total: bool) {
        match self {
            Aggregate::Stats(s) => s.set_with_total(with_total),
            Aggregate::Ranked(r) => r.set_with_total(with_total),
        }
    }

    fn size(&self) -> usize {
        match self {
            Aggregate::Stats(s) => s.size(),
            Aggregate::Ranked(r) => r.size(),
        }
    }

    fn result_view(&self) -> ResultTree {
        match self {
            Aggregate::Stats(s) => s.result_view(),
            Aggregate::Ranked(r) => r.result_view(),
        }
    }
}

impl From<StatsAccumulator> for Aggregate {
    fn from(stats: StatsAccumulator) -> Self {
        Aggregate::Stats(stats)
    }
}

impl From<RankedList> for Aggregate {
    fn from(list: RankedList) -> Self {
        Aggregate::Ranked(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc_by_sum() -> SortSpec {
        SortSpec::new(SortType::Sum, SortDirection::Desc)
    }

    fn list_of(pairs: &[(&str, i64)]) -> RankedList {
        let mut list = RankedList::new(desc_by_sum(), 3);
        for (k, v) in pairs {
            list.observe(*k, Numeric::Long(*v));
        }
        list
    }

    #[test]
    fn stats_merge_adds_and_tracks_extremes() {
        let mut a = StatsAccumulator::from_values([Numeric::Long(1), Numeric::Long(5)]);
        let b = StatsAccumulator::from_values([Numeric::Long(-2)]);
        a.merge(&b).unwrap();
        assert_eq!(a.n(), 3);
        assert_eq!(a.sum(), Numeric::Long(4));
        let view = a.result_view();
        assert_eq!(view.get_path(&["min"]), Some(&ResultTree::number(-2i64)));
        assert_eq!(view.get_path(&["max"]), Some(&ResultTree::number(5i64)));
    }

    #[test]
    fn variance_of_constant_series_is_zero() {
        let stats = StatsAccumulator::from_values([Numeric::Long(4); 5]);
        assert_eq!(stats.variance(), 0.0);
        let stats = StatsAccumulator::from_values([Numeric::Long(1), Numeric::Long(3)]);
        assert!((stats.variance() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn sorted_breaks_ties_by_key() {
        let list = list_of(&[("b", 5), ("a", 5), ("c", 9)]);
        let keys: Vec<_> = list.sorted().into_iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn local_truncation_keeps_ties() {
        let mut list = list_of(&[("a", 10), ("b", 9), ("c", 9), ("d", 1)]);
        list.truncate_local(2);
        assert_eq!(list.size(), 3);
        assert_eq!(list.coverage(), Coverage::Truncated);
        assert_eq!(list.last_sort_value(), Some(Numeric::Long(9)));
        assert!(!list.contains_key("d"));
    }

    #[test]
    fn local_truncation_of_short_list_is_complete() {
        let mut list = list_of(&[("a", 10), ("b", 9)]);
        list.truncate_local(4);
        assert!(list.is_complete());
        assert_eq!(list.last_sort_value(), None);
    }

    #[test]
    fn boundary_retention_is_inclusive() {
        let mut list = list_of(&[("a", 10), ("b", 9), ("c", 8)]);
        list.retain_from_boundary(Numeric::Long(9));
        assert_eq!(list.key_set(), BTreeSet::from(["a".to_string(), "b".to_string()]));
        assert_eq!(list.coverage(), Coverage::AboveBoundary);
    }

    #[test]
    fn ascending_boundary_keeps_smaller_values() {
        let mut list = RankedList::new(SortSpec::new(SortType::Sum, SortDirection::Asc), 2);
        list.observe("a", Numeric::Long(1));
        list.observe("b", Numeric::Long(5));
        list.retain_from_boundary(Numeric::Long(3));
        assert_eq!(list.key_set(), BTreeSet::from(["a".to_string()]));
    }

    #[test]
    fn ranked_merge_is_per_key_and_coverage_is_conservative() {
        let mut a = list_of(&[("x", 3), ("y", 1)]);
        let mut b = list_of(&[("x", 4), ("z", 2)]);
        b.truncate_local(1);
        a.merge(&b).unwrap();
        assert_eq!(a.get("x").unwrap().sum(), Numeric::Long(7));
        assert!(a.contains_key("y"));
        assert!(!a.contains_key("z"));
        assert_eq!(a.coverage(), Coverage::Truncated);
    }

    #[test]
    fn result_view_honours_number_and_total() {
        let list = list_of(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]).with_total_flag(true);
        let view = list.result_view();
        assert_eq!(view.get_path(&["total"]), Some(&ResultTree::long_counter(4)));
        match view.get_path(&["list"]) {
            Some(ResultTree::KeyedList(items)) => {
                let keys: Vec<_> = items.iter().map(|i| i.key.as_str()).collect();
                assert_eq!(keys, vec!["d", "c", "b"]);
            }
            other => panic!("unexpected view {other:?}"),
        }
    }

    #[test]
    fn mixing_leaf_kinds_is_a_mismatch() {
        let mut a = Aggregate::Stats(StatsAccumulator::new());
        let b = Aggregate::Ranked(list_of(&[("a", 1)]));
        assert!(matches!(a.merge(&b), Err(MergeError::KindMismatch { .. })));
    }

    #[test]
    fn term_sort_orders_by_key() {
        let mut list = RankedList::new(SortSpec::new(SortType::Term, SortDirection::Asc), 2);
        for key in ["c", "a", "b"] {
            list.observe(key, Numeric::Long(1));
        }
        list.truncate_local(2);
        assert_eq!(list.key_set(), BTreeSet::from(["a".to_string(), "b".to_string()]));
        assert!(list.ranked_values().is_empty());
        assert!(!list.sort().needs_boundary());
    }
}
