//! The recursive value every partial and merged aggregate is expressed in.
//!
//! A [`ResultTree`] is a closed union: merge rules are chosen by matching on
//! the variant (see [`crate::merge`]). Containers keep insertion order so the
//! merged output reflects the order in which shards first contributed a key.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value};

use crate::aggregate::{Aggregate, Mergeable};
use crate::numeric::Numeric;

/// Plain value. Merging two scalars keeps the first one seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Number(Numeric),
    Text(String),
}

/// Additive count, widened to `Long` when either side is long or an int sum
/// overflows. Counters have no floating kind, so a `Long` sum clamps at the
/// `i64` range instead of widening further the way [`Numeric`] does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Counter {
    Int(i32),
    Long(i64),
}

impl Counter {
    pub fn value(self) -> i64 {
        match self {
            Counter::Int(v) => v as i64,
            Counter::Long(v) => v,
        }
    }

    pub fn add(self, other: Counter) -> Counter {
        match (self, other) {
            (Counter::Int(a), Counter::Int(b)) => match a.checked_add(b) {
                Some(v) => Counter::Int(v),
                None => Counter::Long(a as i64 + b as i64),
            },
            (a, b) => Counter::Long(a.value().saturating_add(b.value())),
        }
    }
}

/// Insertion-ordered string map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderedMap {
    entries: Vec<(String, ResultTree)>,
}

impl OrderedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn get(&self, key: &str) -> Option<&ResultTree> {
        self.position(key).map(|idx| &self.entries[idx].1)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut ResultTree> {
        let idx = self.position(key)?;
        Some(&mut self.entries[idx].1)
    }

    /// Insert or replace. A replaced value keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: ResultTree) -> Option<ResultTree> {
        let key = key.into();
        match self.position(&key) {
            Some(idx) => Some(std::mem::replace(&mut self.entries[idx].1, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<ResultTree> {
        self.position(key).map(|idx| self.entries.remove(idx).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResultTree)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut ResultTree)> {
        self.entries.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }
}

impl FromIterator<(String, ResultTree)> for OrderedMap {
    fn from_iter<I: IntoIterator<Item = (String, ResultTree)>>(iter: I) -> Self {
        let mut map = OrderedMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// One element of a [`ResultTree::KeyedList`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedItem {
    pub key: String,
    pub value: ResultTree,
}

impl KeyedItem {
    pub fn new(key: impl Into<String>, value: ResultTree) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultTree {
    Scalar(Scalar),
    Counter(Counter),
    Map(OrderedMap),
    KeyedList(Vec<KeyedItem>),
    Set(BTreeSet<String>),
    Mergeable(Aggregate),
}

impl Default for ResultTree {
    fn default() -> Self {
        ResultTree::Map(OrderedMap::new())
    }
}

impl ResultTree {
    pub fn empty_map() -> Self {
        ResultTree::Map(OrderedMap::new())
    }

    pub fn text(value: impl Into<String>) -> Self {
        ResultTree::Scalar(Scalar::Text(value.into()))
    }

    pub fn number(value: impl Into<Numeric>) -> Self {
        ResultTree::Scalar(Scalar::Number(value.into()))
    }

    pub fn long_counter(value: i64) -> Self {
        ResultTree::Counter(Counter::Long(value))
    }

    pub fn set<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ResultTree::Set(values.into_iter().map(Into::into).collect())
    }

    /// Short name of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            ResultTree::Scalar(_) => "scalar",
            ResultTree::Counter(_) => "counter",
            ResultTree::Map(_) => "map",
            ResultTree::KeyedList(_) => "keyed-list",
            ResultTree::Set(_) => "set",
            ResultTree::Mergeable(_) => "mergeable",
        }
    }

    pub fn same_kind(&self, other: &ResultTree) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Copy suitable for insertion into a coordinator-owned tree.
    ///
    /// Containers are rebuilt item by item so nothing in the copy refers back
    /// into the source; leaves are copied by value.
    pub fn detached_clone(&self) -> ResultTree {
        match self {
            ResultTree::Map(map) => ResultTree::Map(
                map.iter()
                    .map(|(k, v)| (k.to_string(), v.detached_clone()))
                    .collect(),
            ),
            ResultTree::KeyedList(items) => ResultTree::KeyedList(
                items
                    .iter()
                    .map(|item| KeyedItem::new(item.key.clone(), item.value.detached_clone()))
                    .collect(),
            ),
            ResultTree::Scalar(s) => ResultTree::Scalar(s.clone()),
            ResultTree::Counter(c) => ResultTree::Counter(*c),
            ResultTree::Set(s) => ResultTree::Set(s.clone()),
            ResultTree::Mergeable(agg) => ResultTree::Mergeable(agg.clone()),
        }
    }

    pub fn as_map(&self) -> Option<&OrderedMap> {
        match self {
            ResultTree::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut OrderedMap> {
        match self {
            ResultTree::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_aggregate(&self) -> Option<&Aggregate> {
        match self {
            ResultTree::Mergeable(agg) => Some(agg),
            _ => None,
        }
    }

    pub fn as_aggregate_mut(&mut self) -> Option<&mut Aggregate> {
        match self {
            ResultTree::Mergeable(agg) => Some(agg),
            _ => None,
        }
    }

    pub fn as_counter(&self) -> Option<Counter> {
        match self {
            ResultTree::Counter(c) => Some(*c),
            _ => None,
        }
    }

    /// Follow a path of map keys.
    pub fn get_path(&self, path: &[&str]) -> Option<&ResultTree> {
        let mut current = self;
        for segment in path {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }

    pub fn get_path_mut(&mut self, path: &[&str]) -> Option<&mut ResultTree> {
        let mut current = self;
        for segment in path {
            current = current.as_map_mut()?.get_mut(segment)?;
        }
        Some(current)
    }

    /// Display form. Mergeable leaves are rendered through their result view.
    pub fn to_json(&self) -> Value {
        match self {
            ResultTree::Scalar(Scalar::Text(s)) => Value::String(s.clone()),
            ResultTree::Scalar(Scalar::Number(Numeric::Long(v))) => json!(v),
            ResultTree::Scalar(Scalar::Number(Numeric::Double(v))) => json!(v),
            ResultTree::Counter(c) => json!(c.value()),
            ResultTree::Map(map) => {
                let mut out = JsonMap::new();
                for (k, v) in map.iter() {
                    out.insert(k.to_string(), v.to_json());
                }
                Value::Object(out)
            }
            ResultTree::KeyedList(items) => Value::Array(
                items
                    .iter()
                    .map(|item| {
                        let mut out = JsonMap::new();
                        out.insert("key".to_string(), Value::String(item.key.clone()));
                        match item.value.to_json() {
                            Value::Object(fields) => out.extend(fields),
                            other => {
                                out.insert("value".to_string(), other);
                            }
                        }
                        Value::Object(out)
                    })
                    .collect(),
            ),
            ResultTree::Set(values) => json!(values),
            ResultTree::Mergeable(agg) => agg.result_view().to_json(),
        }
    }
}

impl From<OrderedMap> for ResultTree {
    fn from(map: OrderedMap) -> Self {
        ResultTree::Map(map)
    }
}

impl From<Aggregate> for ResultTree {
    fn from(agg: Aggregate) -> Self {
        ResultTree::Mergeable(agg)
    }
}
