//! Top-K queries, the parameter sets sent to shards for each round, and the
//! shard-side reading of those parameters.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::aggregate::{SortDirection, SortSpec, SortType};
use crate::error::ParamError;
use crate::numeric::Numeric;
use crate::params::{
    binding_label, escape_list, expand_variables, ids_from_parameters, unescape_list, Binding,
    ParamSet, PARAM_PREFIX,
};
use crate::transport::ShardId;

/// Map key under which shards report aggregations, one entry per id.
pub const RESPONSE_SECTION: &str = "agg";
/// Map key under which shards report display data in a finish round.
pub const DISPLAY_SECTION: &str = "display";
/// Parameter carrying the purpose tag of a sub-request.
pub const PURPOSE_PARAM: &str = "agg.purpose";

/// Why a follow-up request is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Purpose {
    MissingTop,
    MissingKey,
    Finish,
}

impl Purpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Purpose::MissingTop => "missing-top",
            Purpose::MissingKey => "missing-key",
            Purpose::Finish => "finish",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing-top" => Ok(Purpose::MissingTop),
            "missing-key" => Ok(Purpose::MissingKey),
            "finish" => Ok(Purpose::Finish),
            other => Err(ParamError::Invalid {
                key: PURPOSE_PARAM.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// A targeted follow-up request for one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubRequest {
    pub shard: ShardId,
    pub purpose: Purpose,
    pub params: ParamSet,
}

impl SubRequest {
    fn new(shard: ShardId, purpose: Purpose) -> Self {
        let mut params = ParamSet::new();
        params
            .set(PARAM_PREFIX, true)
            .set(PURPOSE_PARAM, purpose.as_str());
        Self {
            shard,
            purpose,
            params,
        }
    }
}

/// One ranked aggregation of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopKAggregation {
    pub id: String,
    pub field: String,
    /// Display key; defaults to the id.
    pub key: Option<String>,
    pub prefix: Option<String>,
    pub sort: SortSpec,
    /// Requested global size. The coordinator replaces 0 by its configured
    /// default; a negative size means every entry.
    pub number: i64,
    /// Shards return complete lists and key reconciliation is skipped.
    pub full: bool,
    pub with_total: bool,
    /// Multi-valued variables, expanded into one aggregation per binding.
    #[serde(default)]
    pub variables: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub binding: Binding,
}

impl TopKAggregation {
    pub fn new(id: impl Into<String>, field: impl Into<String>, number: i64) -> Self {
        Self {
            id: id.into(),
            field: field.into(),
            key: None,
            prefix: None,
            sort: SortSpec::default(),
            number,
            full: false,
            with_total: false,
            variables: BTreeMap::new(),
            binding: Binding::new(),
        }
    }

    pub fn sorted_by(mut self, sort_type: SortType, direction: SortDirection) -> Self {
        self.sort = SortSpec::new(sort_type, direction);
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_total(mut self) -> Self {
        self.with_total = true;
        self
    }

    pub fn full(mut self) -> Self {
        self.full = true;
        self
    }

    pub fn with_variable<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variables
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn display_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.id)
    }

    /// Number of entries each shard is asked for in the initial round.
    pub fn shard_number(&self, multiplier: i64) -> i64 {
        if self.full || self.number <= 0 {
            -1
        } else {
            self.number.saturating_mul(multiplier.max(1))
        }
    }

    fn write_base(&self, params: &mut ParamSet) {
        let id = self.id.as_str();
        params
            .set_agg(id, "field", &self.field)
            .set_agg(id, "key", self.display_key())
            .set_agg(id, "sort.type", self.sort.sort_type.as_str())
            .set_agg(id, "sort.direction", self.sort.direction.as_str())
            .set_agg(id, "number", self.number);
        if let Some(prefix) = &self.prefix {
            params.set_agg(id, "prefix", prefix);
        }
        if self.with_total {
            params.set_agg(id, "total", true);
        }
        for (name, value) in &self.binding {
            if let Some(value) = value {
                params.set_agg(id, &format!("variable.{name}"), value);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopKQuery {
    pub aggregations: Vec<TopKAggregation>,
}

impl TopKQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, aggregation: TopKAggregation) -> Self {
        self.aggregations.push(aggregation);
        self
    }

    pub fn aggregation(&self, id: &str) -> Option<&TopKAggregation> {
        self.aggregations.iter().find(|a| a.id == id)
    }

    /// Replace every aggregation declaring variables by one aggregation per
    /// binding, refusing expansions larger than `limit` in total.
    ///
    /// Ids name a parameter namespace `agg.<id>.*`, so they must be non-empty,
    /// free of `.` and unique once expanded.
    pub fn expanded(&self, limit: usize) -> Result<TopKQuery, ParamError> {
        let mut aggregations = Vec::new();
        for agg in &self.aggregations {
            if agg.id.is_empty() || agg.id.contains('.') {
                return Err(invalid_id(&agg.id));
            }
            if agg.variables.is_empty() {
                aggregations.push(agg.clone());
                continue;
            }
            let remaining = limit.saturating_sub(aggregations.len());
            let bindings = expand_variables(&agg.variables, remaining)?;
            for (idx, binding) in bindings.into_iter().enumerate() {
                let mut expanded = agg.clone();
                expanded.id = format!("{}-{idx}", agg.id);
                expanded.key = Some(format!("{} {}", agg.display_key(), binding_label(&binding)));
                expanded.variables.clear();
                expanded.binding = binding;
                aggregations.push(expanded);
            }
        }
        let mut seen = BTreeSet::new();
        if let Some(duplicate) = aggregations.iter().find(|a| !seen.insert(a.id.clone())) {
            return Err(invalid_id(&duplicate.id));
        }
        Ok(TopKQuery { aggregations })
    }

    /// Parameters of the initial fan-out.
    pub fn initial_params(&self, multiplier: i64) -> ParamSet {
        let mut params = ParamSet::new();
        params.set(PARAM_PREFIX, true);
        for agg in &self.aggregations {
            agg.write_base(&mut params);
            params.set_agg(&agg.id, "number.shards", agg.shard_number(multiplier));
            if agg.full {
                params.set_agg(&agg.id, "full", true);
            }
        }
        params
    }

    /// Ask `shard` for every entry at least as good as the given boundary,
    /// per aggregation id.
    pub fn missing_top_request(
        &self,
        shard: ShardId,
        boundaries: &BTreeMap<String, Numeric>,
    ) -> SubRequest {
        let mut request = SubRequest::new(shard, Purpose::MissingTop);
        for (id, boundary) in boundaries {
            if let Some(agg) = self.aggregation(id) {
                agg.write_base(&mut request.params);
                request
                    .params
                    .set_agg(id, "number.shards", -1)
                    .set_agg(id, "boundary", boundary);
            }
        }
        request
    }

    /// Ask `shard` for exactly the listed keys, per aggregation id.
    pub fn missing_key_request(
        &self,
        shard: ShardId,
        keys: &BTreeMap<String, BTreeSet<String>>,
    ) -> SubRequest {
        let mut request = SubRequest::new(shard, Purpose::MissingKey);
        for (id, list) in keys {
            if let Some(agg) = self.aggregation(id) {
                agg.write_base(&mut request.params);
                request
                    .params
                    .set_agg(id, "number.shards", -1)
                    .set_agg(id, "full", false)
                    .set_agg(id, "list", escape_list(list));
            }
        }
        request
    }

    /// Hand the final keys back to `shard` so it can attach display data.
    pub fn finish_request(&self, shard: ShardId, keys: &BTreeMap<String, Vec<String>>) -> SubRequest {
        let mut request = SubRequest::new(shard, Purpose::Finish);
        for (id, list) in keys {
            if let Some(agg) = self.aggregation(id) {
                agg.write_base(&mut request.params);
                request
                    .params
                    .set_agg(id, "finish", true)
                    .set_agg(id, "list", escape_list(list));
            }
        }
        request
    }
}

fn invalid_id(id: &str) -> ParamError {
    ParamError::Invalid {
        key: format!("{PARAM_PREFIX}.id"),
        value: id.to_string(),
    }
}

// =============================================================================
// Shard side
// =============================================================================

/// What a shard is asked to return for one aggregation.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardMode {
    /// Local top `limit` with ties; `limit <= 0` returns everything.
    Initial { limit: i64 },
    /// Every entry at least as good as the boundary.
    FromBoundary(Numeric),
    /// Exactly these keys.
    Keys(BTreeSet<String>),
    /// Display data for these final keys.
    Finish(Vec<String>),
}

/// One aggregation as read back from a parameter set.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationRequest {
    pub id: String,
    pub field: String,
    pub key: String,
    pub prefix: Option<String>,
    pub sort: SortSpec,
    pub number: i64,
    pub with_total: bool,
    pub variables: BTreeMap<String, String>,
    pub mode: ShardMode,
}

impl AggregationRequest {
    pub fn parse_all(params: &ParamSet) -> Result<Vec<AggregationRequest>, ParamError> {
        ids_from_parameters(params, PARAM_PREFIX)
            .into_iter()
            .map(|id| Self::parse(params, id))
            .collect()
    }

    fn parse(params: &ParamSet, id: String) -> Result<AggregationRequest, ParamError> {
        let key_of = |name: &str| format!("{PARAM_PREFIX}.{id}.{name}");
        let field = params.require(&key_of("field"))?.to_string();
        let key = params.agg(&id, "key").unwrap_or(&id).to_string();
        let sort = SortSpec::new(
            params.parse(&key_of("sort.type"))?.unwrap_or_default(),
            params.parse(&key_of("sort.direction"))?.unwrap_or_default(),
        );
        let number = params.parse(&key_of("number"))?.unwrap_or(0);
        let variable_lead = key_of("variable.");
        let variables = params
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&variable_lead)
                    .map(|name| (name.to_string(), v.to_string()))
            })
            .collect();

        let list = params.agg(&id, "list").map(unescape_list);
        let mode = if params.get_bool(&key_of("finish")) {
            ShardMode::Finish(list.unwrap_or_default())
        } else if let Some(keys) = list {
            ShardMode::Keys(keys.into_iter().collect())
        } else if let Some(boundary) = params.parse::<Numeric>(&key_of("boundary"))? {
            ShardMode::FromBoundary(boundary)
        } else {
            ShardMode::Initial {
                limit: params.parse(&key_of("number.shards"))?.unwrap_or(-1),
            }
        };

        Ok(AggregationRequest {
            field,
            key,
            prefix: params.agg(&id, "prefix").map(str::to_string),
            sort,
            number,
            with_total: params.get_bool(&key_of("total")),
            variables,
            mode,
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> TopKQuery {
        TopKQuery::new()
            .with(TopKAggregation::new("words", "text", 10).with_prefix("w_"))
            .with(
                TopKAggregation::new("lemmas", "lemma", 0)
                    .sorted_by(SortType::Sum, SortDirection::Asc)
                    .with_total(),
            )
    }

    #[test]
    fn initial_params_request_more_per_shard() {
        let params = query().initial_params(2);
        assert_eq!(params.get("agg"), Some("true"));
        assert_eq!(params.get("agg.words.number"), Some("10"));
        assert_eq!(params.get("agg.words.number.shards"), Some("20"));
        assert_eq!(params.get("agg.words.prefix"), Some("w_"));
        assert_eq!(params.get("agg.lemmas.number.shards"), Some("-1"));
        assert_eq!(params.get("agg.lemmas.sort.type"), Some("sum"));
        assert_eq!(params.get("agg.lemmas.total"), Some("true"));
        assert_eq!(params.get(PURPOSE_PARAM), None);
    }

    #[test]
    fn sub_requests_carry_purpose_and_delta() {
        let q = query();
        let top = q.missing_top_request(
            ShardId(1),
            &BTreeMap::from([("words".to_string(), Numeric::Long(7))]),
        );
        assert_eq!(top.purpose, Purpose::MissingTop);
        assert_eq!(top.params.get(PURPOSE_PARAM), Some("missing-top"));
        assert_eq!(top.params.get("agg.words.boundary"), Some("7"));
        assert_eq!(top.params.get("agg.lemmas.field"), None);

        let keys = q.missing_key_request(
            ShardId(2),
            &BTreeMap::from([(
                "words".to_string(),
                BTreeSet::from(["a,b".to_string(), "c".to_string()]),
            )]),
        );
        assert_eq!(keys.params.get("agg.words.list"), Some("a\\,b,c"));
        assert_eq!(keys.params.get("agg.words.full"), Some("false"));
    }

    #[test]
    fn shard_side_reads_back_each_mode() {
        let q = query();
        let initial = AggregationRequest::parse_all(&q.initial_params(2)).unwrap();
        assert_eq!(initial.len(), 2);
        let words = initial.iter().find(|a| a.id == "words").unwrap();
        assert_eq!(words.mode, ShardMode::Initial { limit: 20 });
        assert_eq!(words.prefix.as_deref(), Some("w_"));

        let top = q.missing_top_request(
            ShardId(0),
            &BTreeMap::from([("words".to_string(), Numeric::Double(2.5))]),
        );
        let parsed = AggregationRequest::parse_all(&top.params).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].mode, ShardMode::FromBoundary(Numeric::Double(2.5)));

        let keys = BTreeSet::from(["x\\y".to_string(), "z".to_string()]);
        let missing = q.missing_key_request(
            ShardId(0),
            &BTreeMap::from([("lemmas".to_string(), keys.clone())]),
        );
        let parsed = AggregationRequest::parse_all(&missing.params).unwrap();
        assert_eq!(parsed[0].mode, ShardMode::Keys(keys));
        assert_eq!(parsed[0].sort.direction, SortDirection::Asc);

        let finish = q.finish_request(
            ShardId(0),
            &BTreeMap::from([("words".to_string(), vec!["b".to_string(), "a".to_string()])]),
        );
        let parsed = AggregationRequest::parse_all(&finish.params).unwrap();
        assert_eq!(
            parsed[0].mode,
            ShardMode::Finish(vec!["b".to_string(), "a".to_string()])
        );
    }

    #[test]
    fn missing_field_is_rejected() {
        let mut params = ParamSet::new();
        params.set_agg("x", "number", 3);
        assert_eq!(
            AggregationRequest::parse_all(&params),
            Err(ParamError::Missing("agg.x.field".to_string()))
        );
    }

    #[test]
    fn variables_expand_into_separate_aggregations() {
        let q = TopKQuery::new().with(
            TopKAggregation::new("pos", "text", 5)
                .with_variable("tag", ["N", "V"])
                .with_variable("lemma", Vec::<String>::new()),
        );
        let expanded = q.expanded(8).unwrap();
        let ids: Vec<_> = expanded.aggregations.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["pos-0", "pos-1"]);
        assert_eq!(
            expanded.aggregations[1].display_key(),
            "pos $lemma=- $tag='V'"
        );
        let params = expanded.initial_params(2);
        assert_eq!(params.get("agg.pos-0.variable.tag"), Some("N"));
        assert_eq!(params.get("agg.pos-0.variable.lemma"), None);
        let parsed = AggregationRequest::parse_all(&params).unwrap();
        assert_eq!(parsed[0].variables.get("tag").map(String::as_str), Some("N"));

        assert!(q.expanded(1).is_err());
    }

    #[test]
    fn ids_outside_the_parameter_namespace_are_rejected() {
        for id in ["my.words", ""] {
            let q = TopKQuery::new().with(TopKAggregation::new(id, "text", 2));
            assert_eq!(
                q.expanded(8),
                Err(ParamError::Invalid {
                    key: "agg.id".to_string(),
                    value: id.to_string(),
                })
            );
        }
    }

    #[test]
    fn expanded_ids_must_not_collide() {
        let q = TopKQuery::new()
            .with(TopKAggregation::new("pos", "pos_$tag", 2).with_variable("tag", ["N"]))
            .with(TopKAggregation::new("pos-0", "text", 2));
        assert_eq!(
            q.expanded(8),
            Err(ParamError::Invalid {
                key: "agg.id".to_string(),
                value: "pos-0".to_string(),
            })
        );

        let q = TopKQuery::new()
            .with(TopKAggregation::new("words", "text", 2))
            .with(TopKAggregation::new("words", "lemma", 2));
        assert!(q.expanded(8).is_err());
    }
}
