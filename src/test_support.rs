use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;

use crate::aggregate::{Aggregate, Mergeable, RankedList, SortSpec, StatsAccumulator};
use crate::codec::{encode_leaves, ENCODED_PREFIX};
use crate::config::SimulationConfig;
use crate::error::ShardError;
use crate::numeric::Numeric;
use crate::params::ParamSet;
use crate::request::{
    AggregationRequest, Purpose, ShardMode, DISPLAY_SECTION, PURPOSE_PARAM, RESPONSE_SECTION,
};
use crate::transport::{ShardId, ShardTransport};
use crate::tree::{Counter, OrderedMap, ResultTree};

/// Field every generated shard stores its keys under.
pub const SIM_FIELD: &str = "text";

/// A shard holding raw observations in memory and answering parameter sets
/// the way a real shard would.
#[derive(Debug, Clone)]
pub struct LocalShard {
    id: ShardId,
    fields: BTreeMap<String, BTreeMap<String, Vec<Numeric>>>,
    encode_leaves: bool,
}

impl LocalShard {
    pub fn new(id: ShardId) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
            encode_leaves: false,
        }
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Answer with encoded leaves, as a shard behind another hop would.
    pub fn encoded(mut self) -> Self {
        self.encode_leaves = true;
        self
    }

    pub fn with_observations<I>(mut self, field: &str, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = Numeric>,
    {
        for value in values {
            self.observe(field, key, value);
        }
        self
    }

    pub fn observe(&mut self, field: &str, key: &str, value: Numeric) {
        self.fields
            .entry(field.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .push(value);
    }

    /// `count` observations of 1, so count and sum sorts agree.
    pub fn add_count(&mut self, field: &str, key: &str, count: u64) {
        for _ in 0..count {
            self.observe(field, key, Numeric::Long(1));
        }
    }

    /// Every local entry of `field` whose key starts with `prefix`.
    pub fn ranked(&self, field: &str, prefix: Option<&str>, sort: SortSpec, number: i64) -> RankedList {
        let mut list = RankedList::new(sort, number);
        if let Some(keys) = self.fields.get(field) {
            for (key, values) in keys {
                if prefix.is_some_and(|p| !key.starts_with(p)) {
                    continue;
                }
                list.insert(key.clone(), StatsAccumulator::from_values(values.iter().copied()));
            }
        }
        list
    }

    pub fn answer(&self, params: &ParamSet) -> Result<ResultTree, ShardError> {
        let requests =
            AggregationRequest::parse_all(params).map_err(|err| ShardError::Transport {
                shard: self.id,
                reason: err.to_string(),
            })?;

        let mut aggregations = OrderedMap::new();
        let mut display = OrderedMap::new();
        for request in &requests {
            let field = substitute(&request.field, &request.variables);
            if let ShardMode::Finish(keys) = &request.mode {
                let labels = keys
                    .iter()
                    .filter(|key| self.fields.get(&field).is_some_and(|f| f.contains_key(*key)))
                    .map(|key| (key.clone(), ResultTree::text(format!("{field}:{key}"))))
                    .collect();
                display.insert(request.id.clone(), ResultTree::Map(labels));
                continue;
            }

            let mut list = self.ranked(&field, request.prefix.as_deref(), request.sort, request.number);
            list.set_with_total(request.with_total);
            match &request.mode {
                ShardMode::Initial { limit } => list.truncate_local(*limit),
                ShardMode::FromBoundary(boundary) => list.retain_from_boundary(*boundary),
                ShardMode::Keys(keys) => {
                    list.retain_keys(keys);
                    for key in keys {
                        if !list.contains_key(key) {
                            list.insert(key.clone(), StatsAccumulator::new());
                        }
                    }
                }
                ShardMode::Finish(_) => {}
            }
            aggregations.insert(request.id.clone(), ResultTree::Mergeable(list.into()));
        }

        let mut root = OrderedMap::new();
        if !aggregations.is_empty() {
            root.insert(RESPONSE_SECTION, ResultTree::Map(aggregations));
        }
        if !display.is_empty() {
            root.insert(DISPLAY_SECTION, ResultTree::Map(display));
        }
        root.insert("responses", ResultTree::Counter(Counter::Int(1)));
        let mut tree = ResultTree::Map(root);
        if self.encode_leaves {
            encode_leaves(&mut tree).map_err(|err| ShardError::Malformed {
                shard: self.id,
                reason: err.to_string(),
            })?;
        }
        Ok(tree)
    }
}

/// Replace `$name` in a field by the bound variable value.
fn substitute(field: &str, variables: &BTreeMap<String, String>) -> String {
    variables
        .iter()
        .fold(field.to_string(), |acc, (name, value)| {
            acc.replace(&format!("${name}"), value)
        })
}

/// Misbehaviour injected into an [`InMemoryTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    Fail,
    Delay(Duration),
    /// Answer with a bare scalar instead of a map.
    Malformed,
    /// Answer with text where ranked lists belong.
    WrongKind,
    /// Answer with statistics leaves where ranked lists belong.
    StatsLeaf,
    /// Answer with encoded leaves whose payload cannot be decoded.
    CorruptPayload,
}

#[derive(Debug, Clone)]
struct FaultRule {
    shard: ShardId,
    /// `None` matches every request, initial ones included.
    purpose: Option<Purpose>,
    fault: Fault,
}

/// Transport over a set of [`LocalShard`]s with fault injection and a log of
/// every request sent.
#[derive(Debug)]
pub struct InMemoryTransport {
    shards: BTreeMap<ShardId, LocalShard>,
    faults: Vec<FaultRule>,
    log: Mutex<Vec<(ShardId, ParamSet)>>,
}

impl InMemoryTransport {
    pub fn new(shards: Vec<LocalShard>) -> Self {
        Self {
            shards: shards.into_iter().map(|s| (s.id(), s)).collect(),
            faults: Vec::new(),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.keys().copied().collect()
    }

    pub fn shards(&self) -> impl Iterator<Item = &LocalShard> {
        self.shards.values()
    }

    pub fn with_fault(mut self, shard: ShardId, fault: Fault) -> Self {
        self.faults.push(FaultRule {
            shard,
            purpose: None,
            fault,
        });
        self
    }

    /// Fault only the follow-up requests of one purpose.
    pub fn with_fault_on(mut self, shard: ShardId, purpose: Purpose, fault: Fault) -> Self {
        self.faults.push(FaultRule {
            shard,
            purpose: Some(purpose),
            fault,
        });
        self
    }

    pub async fn requests(&self) -> Vec<(ShardId, ParamSet)> {
        self.log.lock().await.clone()
    }

    fn fault_for(&self, shard: ShardId, params: &ParamSet) -> Option<&Fault> {
        let purpose = params
            .get(PURPOSE_PARAM)
            .and_then(|p| p.parse::<Purpose>().ok());
        self.faults
            .iter()
            .find(|rule| rule.shard == shard && (rule.purpose.is_none() || rule.purpose == purpose))
            .map(|rule| &rule.fault)
    }
}

#[async_trait]
impl ShardTransport for InMemoryTransport {
    async fn send(&self, shard: ShardId, params: &ParamSet) -> Result<ResultTree, ShardError> {
        self.log.lock().await.push((shard, params.clone()));
        let local = self.shards.get(&shard).ok_or_else(|| ShardError::Transport {
            shard,
            reason: "unknown shard".to_string(),
        })?;

        match self.fault_for(shard, params) {
            None => local.answer(params),
            Some(Fault::Fail) => Err(ShardError::Transport {
                shard,
                reason: "injected failure".to_string(),
            }),
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(*delay).await;
                local.answer(params)
            }
            Some(Fault::Malformed) => Ok(ResultTree::text("not a result")),
            Some(Fault::WrongKind) => {
                let mut tree = local.answer(params)?;
                if let Some(section) = tree
                    .get_path_mut(&[RESPONSE_SECTION])
                    .and_then(ResultTree::as_map_mut)
                {
                    for (_, value) in section.iter_mut() {
                        *value = ResultTree::text("unexpected");
                    }
                }
                Ok(tree)
            }
            Some(Fault::StatsLeaf) => {
                let mut tree = local.answer(params)?;
                if let Some(section) = tree
                    .get_path_mut(&[RESPONSE_SECTION])
                    .and_then(ResultTree::as_map_mut)
                {
                    for (_, value) in section.iter_mut() {
                        let stats = StatsAccumulator::from_values([Numeric::Long(1)]);
                        *value = ResultTree::from(Aggregate::from(stats));
                    }
                }
                Ok(tree)
            }
            Some(Fault::CorruptPayload) => {
                let mut tree = local.clone().encoded().answer(params)?;
                if let Some(section) = tree
                    .get_path_mut(&[RESPONSE_SECTION])
                    .and_then(ResultTree::as_map_mut)
                {
                    for (key, value) in section.iter_mut() {
                        if key.starts_with(ENCODED_PREFIX) {
                            *value = ResultTree::text("%%not-base64%%");
                        }
                    }
                }
                Ok(tree)
            }
        }
    }
}

/// Shards drawing keys from a shared vocabulary. Low key indices are drawn
/// more often, so the global top is spread unevenly over the shards.
pub fn random_cluster(
    seed: u64,
    shards: usize,
    vocabulary: usize,
    keys_per_shard: usize,
    max_count: u64,
) -> Vec<LocalShard> {
    let mut rng = StdRng::seed_from_u64(seed);
    let vocabulary = vocabulary.max(1);
    (0..shards)
        .map(|idx| {
            let mut shard = LocalShard::new(ShardId(idx as u32));
            for _ in 0..keys_per_shard {
                let draw: f64 = rng.random();
                let key = (draw * draw * vocabulary as f64) as usize;
                let count = rng.random_range(1..=max_count.max(1));
                shard.add_count(SIM_FIELD, &format!("k{key:05}"), count);
            }
            shard
        })
        .collect()
}

pub fn simulation_cluster(config: &SimulationConfig) -> Vec<LocalShard> {
    random_cluster(
        config.seed,
        config.shards,
        config.vocabulary,
        config.keys_per_shard,
        config.max_count,
    )
}

/// Exact top `number` of `field` computed from every shard's full data.
pub fn ground_truth_top(
    shards: &[LocalShard],
    field: &str,
    sort: SortSpec,
    number: i64,
) -> Vec<(String, Numeric)> {
    let mut merged = RankedList::new(sort, number);
    for shard in shards {
        // Lists built from one sort never disagree in kind.
        let _ = merged.merge(&shard.ranked(field, None, sort, number));
    }
    merged.truncate_to_number();
    merged.ranked_values()
}
