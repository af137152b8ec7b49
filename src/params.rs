//! Flat dotted parameter sets and bounded variable expansion.
//!
//! Every aggregation instance owns the namespace `agg.<id>.`; the top-level
//! switch `agg=true` marks a request that carries aggregations at all.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParamError;

/// Namespace prefix for aggregation parameters.
pub const PARAM_PREFIX: &str = "agg";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSet(BTreeMap<String, String>);

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn extend(&mut self, other: &ParamSet) {
        for (k, v) in other.iter() {
            self.0.insert(k.to_string(), v.to_string());
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some("true"))
    }

    /// Parse a value; absent keys yield `None`.
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ParamError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| ParamError::Invalid {
                key: key.to_string(),
                value: raw.to_string(),
            }),
        }
    }

    pub fn require(&self, key: &str) -> Result<&str, ParamError> {
        self.get(key).ok_or_else(|| ParamError::Missing(key.to_string()))
    }

    pub fn agg(&self, id: &str, name: &str) -> Option<&str> {
        self.get(&agg_key(id, name))
    }

    pub fn set_agg(&mut self, id: &str, name: &str, value: impl ToString) -> &mut Self {
        self.set(agg_key(id, name), value)
    }
}

impl fmt::Display for ParamSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.iter() {
            if !first {
                f.write_str("&")?;
            }
            first = false;
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

pub fn agg_key(id: &str, name: &str) -> String {
    format!("{PARAM_PREFIX}.{id}.{name}")
}

/// Aggregation ids present under `prefix`: every `<prefix>.<id>.<name>` key
/// contributes `<id>`.
pub fn ids_from_parameters(params: &ParamSet, prefix: &str) -> BTreeSet<String> {
    let lead = format!("{prefix}.");
    params
        .iter()
        .filter_map(|(key, _)| key.strip_prefix(&lead))
        .filter_map(|rest| rest.split_once('.').map(|(id, _)| id.to_string()))
        .collect()
}

/// Join keys with `,`, escaping `\` and `,` with a backslash.
pub fn escape_list<I, S>(keys: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    keys.into_iter()
        .map(|k| k.as_ref().replace('\\', "\\\\").replace(',', "\\,"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Inverse of [`escape_list`]. An empty string is an empty list.
pub fn unescape_list(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }
    let mut items = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ',' => items.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    items.push(current);
    items
}

/// One assignment of values to variables. A variable declared without
/// values stays unbound.
pub type Binding = BTreeMap<String, Option<String>>;

/// Cartesian product of the declared variable values, refused when it would
/// exceed `limit` combinations.
pub fn expand_variables(
    variables: &BTreeMap<String, Vec<String>>,
    limit: usize,
) -> Result<Vec<Binding>, ParamError> {
    let size = variables
        .values()
        .try_fold(1usize, |acc, values| acc.checked_mul(values.len().max(1)))
        .unwrap_or(usize::MAX);
    if size > limit {
        return Err(ParamError::ExpansionTooLarge { size, limit });
    }

    let mut combinations: Vec<Binding> = vec![Binding::new()];
    for (name, values) in variables {
        let mut next = Vec::with_capacity(combinations.len() * values.len().max(1));
        for binding in &combinations {
            if values.is_empty() {
                let mut item = binding.clone();
                item.insert(name.clone(), None);
                next.push(item);
            } else {
                for value in values {
                    let mut item = binding.clone();
                    item.insert(name.clone(), Some(value.clone()));
                    next.push(item);
                }
            }
        }
        combinations = next;
    }
    Ok(combinations)
}

/// Human-readable suffix identifying a binding, e.g. `$pos='N' $lemma=-`.
pub fn binding_label(binding: &Binding) -> String {
    binding
        .iter()
        .map(|(name, value)| match value {
            Some(v) => format!("${name}='{}'", escape_list([v])),
            None => format!("${name}=-"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
