//! Bounded multi-round top-K protocol.
//!
//! A query moves through `Gathering`, `EstimatingBoundary`, an optional
//! `RefiningTop`, `ReconcilingKeys`, an optional `Finishing` round and ends in
//! `Done`. Each round fans out in parallel and waits for every shard (or its
//! timeout) before merging; no round is repeated.
//!
//! The coordinator keeps one tree per responding shard. A boundary answer
//! replaces that shard's earlier list for the refined aggregation; a key
//! answer is merged into it. The final result merges all shard trees in shard
//! order and cuts every ranked list to its requested size.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::aggregate::RankedList;
use crate::boundary::{estimate, ShardContribution};
use crate::codec::decode_leaves;
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Diagnostic, ShardError};
use crate::merge::{merge, merge_all};
use crate::missing::{missing_keys, ShardKeys};
use crate::numeric::Numeric;
use crate::params::ParamSet;
use crate::request::{SubRequest, TopKQuery, DISPLAY_SECTION, RESPONSE_SECTION};
use crate::transport::{ShardId, ShardTransport};
use crate::tree::{OrderedMap, ResultTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoordinatorState {
    Gathering,
    EstimatingBoundary,
    RefiningTop,
    ReconcilingKeys,
    Finishing,
    Done,
}

impl CoordinatorState {
    pub fn as_str(self) -> &'static str {
        match self {
            CoordinatorState::Gathering => "gathering",
            CoordinatorState::EstimatingBoundary => "estimating-boundary",
            CoordinatorState::RefiningTop => "refining-top",
            CoordinatorState::ReconcilingKeys => "reconciling-keys",
            CoordinatorState::Finishing => "finishing",
            CoordinatorState::Done => "done",
        }
    }
}

/// Timing and failures of one fan-out round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundMetrics {
    pub state: CoordinatorState,
    pub asked: usize,
    pub responded: usize,
    pub failed: Vec<ShardId>,
    pub elapsed_us: u64,
    /// Slowest single shard request of the round.
    pub max_shard_latency_us: u64,
}

/// Result of a query together with how it was obtained.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub result: ResultTree,
    pub states: Vec<CoordinatorState>,
    pub sub_requests: Vec<SubRequest>,
    pub rounds: Vec<RoundMetrics>,
    pub diagnostics: Vec<Diagnostic>,
    /// Per-shard trees after the last round that changed them.
    #[serde(skip)]
    pub shard_results: BTreeMap<ShardId, ResultTree>,
}

impl QueryOutcome {
    pub fn visited(&self, state: CoordinatorState) -> bool {
        self.states.contains(&state)
    }

    pub fn ranked(&self, id: &str) -> Option<&RankedList> {
        ranked_in(&self.result, id)
    }

    /// `(key, sort value)` of a ranked aggregation in final order.
    pub fn top(&self, id: &str) -> Vec<(String, Numeric)> {
        self.ranked(id)
            .map(RankedList::ranked_values)
            .unwrap_or_default()
    }

    pub fn sub_requests_for(&self, shard: ShardId) -> impl Iterator<Item = &SubRequest> {
        self.sub_requests.iter().filter(move |r| r.shard == shard)
    }
}

fn ranked_in<'a>(tree: &'a ResultTree, id: &str) -> Option<&'a RankedList> {
    tree.get_path(&[RESPONSE_SECTION, id])?
        .as_aggregate()?
        .as_ranked()
}

fn ranked_in_mut<'a>(tree: &'a mut ResultTree, id: &str) -> Option<&'a mut RankedList> {
    tree.get_path_mut(&[RESPONSE_SECTION, id])?
        .as_aggregate_mut()?
        .as_ranked_mut()
}

/// Per-query working state; owned by one `execute` call.
struct Run {
    states: Vec<CoordinatorState>,
    sub_requests: Vec<SubRequest>,
    rounds: Vec<RoundMetrics>,
    diagnostics: Vec<Diagnostic>,
    shard_results: BTreeMap<ShardId, ResultTree>,
}

impl Run {
    fn enter(&mut self, state: CoordinatorState) {
        debug!(state = state.as_str(), "entering state");
        self.states.push(state);
    }
}

pub struct TopKCoordinator<T> {
    transport: T,
    shards: Vec<ShardId>,
    config: CoordinatorConfig,
}

impl<T: ShardTransport> TopKCoordinator<T> {
    pub fn new(transport: T, shards: Vec<ShardId>, config: CoordinatorConfig) -> Self {
        Self {
            transport,
            shards,
            config,
        }
    }

    pub fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run `query` against every shard.
    ///
    /// Shard failures and malformed payloads degrade the answer and are
    /// listed in the outcome's diagnostics. The query itself fails only when
    /// no shard answers the initial round or `cancel` fires.
    #[instrument(skip_all, fields(shards = self.shards.len(), aggregations = query.aggregations.len()))]
    pub async fn execute(
        &self,
        query: &TopKQuery,
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome, CoordinatorError> {
        let mut query = query.expanded(self.config.max_expansion)?;
        for agg in &mut query.aggregations {
            agg.number = self.config.resolve_number(agg.number);
        }

        let mut run = Run {
            states: Vec::new(),
            sub_requests: Vec::new(),
            rounds: Vec::new(),
            diagnostics: Vec::new(),
            shard_results: BTreeMap::new(),
        };

        // Gathering
        run.enter(CoordinatorState::Gathering);
        let initial = query.initial_params(self.config.shard_number_multiplier);
        let requests = self
            .shards
            .iter()
            .map(|shard| (*shard, initial.clone()))
            .collect();
        for (shard, response) in self
            .round(&query, CoordinatorState::Gathering, requests, cancel, &mut run)
            .await?
        {
            if let Some(tree) = response {
                run.shard_results.insert(shard, tree);
            }
        }
        if run.shard_results.is_empty() {
            return Err(CoordinatorError::NoShardResponded {
                attempted: self.shards.len(),
            });
        }

        // EstimatingBoundary
        run.enter(CoordinatorState::EstimatingBoundary);
        let refinements = self.plan_refinements(&query, &mut run);

        // RefiningTop
        if self.config.missing_top_round && !refinements.is_empty() {
            run.enter(CoordinatorState::RefiningTop);
            let subs: Vec<SubRequest> = refinements
                .iter()
                .map(|(shard, boundaries)| query.missing_top_request(*shard, boundaries))
                .collect();
            let responses = self
                .sub_round(&query, CoordinatorState::RefiningTop, subs, cancel, &mut run)
                .await?;
            for (shard, response) in responses {
                let (Some(tree), Some(boundaries)) = (response, refinements.get(&shard)) else {
                    continue;
                };
                for id in boundaries.keys() {
                    self.replace_ranked(&mut run, shard, id, &tree);
                }
            }
        }

        // ReconcilingKeys
        if self.config.missing_key_round {
            run.enter(CoordinatorState::ReconcilingKeys);
            let owed = self.plan_missing_keys(&query, &run);
            if !owed.is_empty() {
                let subs: Vec<SubRequest> = owed
                    .iter()
                    .map(|(shard, keys)| query.missing_key_request(*shard, keys))
                    .collect();
                let responses = self
                    .sub_round(&query, CoordinatorState::ReconcilingKeys, subs, cancel, &mut run)
                    .await?;
                for (shard, response) in responses {
                    let (Some(tree), Some(keys)) = (response, owed.get(&shard)) else {
                        continue;
                    };
                    for id in keys.keys() {
                        self.merge_ranked(&mut run, shard, id, &tree);
                    }
                }
            }
        }

        let (mut result, report) = merge_all(run.shard_results.values());
        run.diagnostics.extend(report.diagnostics);
        for agg in &query.aggregations {
            if let Some(list) = ranked_in_mut(&mut result, &agg.id) {
                list.set_number(agg.number);
                list.truncate_to_number();
            }
        }

        // Finishing
        if self.config.finish_round {
            run.enter(CoordinatorState::Finishing);
            self.finish(&query, &mut result, cancel, &mut run).await?;
        }

        run.enter(CoordinatorState::Done);
        info!(
            rounds = run.rounds.len(),
            diagnostics = run.diagnostics.len(),
            "query complete"
        );
        Ok(QueryOutcome {
            result,
            states: run.states,
            sub_requests: run.sub_requests,
            rounds: run.rounds,
            diagnostics: run.diagnostics,
            shard_results: run.shard_results,
        })
    }

    /// Boundaries per flagged shard, per aggregation id.
    fn plan_refinements(
        &self,
        query: &TopKQuery,
        run: &mut Run,
    ) -> BTreeMap<ShardId, BTreeMap<String, Numeric>> {
        let mut refinements: BTreeMap<ShardId, BTreeMap<String, Numeric>> = BTreeMap::new();
        for agg in &query.aggregations {
            if !agg.sort.needs_boundary() {
                continue;
            }
            let contributions: Vec<ShardContribution> = run
                .shard_results
                .iter()
                .filter_map(|(shard, tree)| {
                    ranked_in(tree, &agg.id).map(|list| ShardContribution::from_ranked(*shard, list))
                })
                .collect();
            let plan = estimate(&contributions, agg.sort, agg.number);
            if plan.underflow {
                run.diagnostics.push(Diagnostic::BoundaryUnderflow {
                    aggregation: agg.id.clone(),
                    entries: plan.merged_entries,
                    number: agg.number,
                });
            }
            for (shard, boundary) in plan.flagged() {
                debug!(aggregation = %agg.id, %shard, %boundary, "shard flagged for refinement");
                refinements
                    .entry(shard)
                    .or_default()
                    .insert(agg.id.clone(), boundary);
            }
        }
        refinements
    }

    /// Keys each shard has not reported, per aggregation id.
    fn plan_missing_keys(
        &self,
        query: &TopKQuery,
        run: &Run,
    ) -> BTreeMap<ShardId, BTreeMap<String, BTreeSet<String>>> {
        let mut owed: BTreeMap<ShardId, BTreeMap<String, BTreeSet<String>>> = BTreeMap::new();
        for agg in query.aggregations.iter().filter(|a| !a.full) {
            let shards: Vec<ShardKeys> = run
                .shard_results
                .iter()
                .filter_map(|(shard, tree)| {
                    ranked_in(tree, &agg.id).map(|list| ShardKeys::from_ranked(*shard, list))
                })
                .collect();
            for (shard, keys) in missing_keys(&shards) {
                owed.entry(shard).or_default().insert(agg.id.clone(), keys);
            }
        }
        owed
    }

    fn replace_ranked(&self, run: &mut Run, shard: ShardId, id: &str, response: &ResultTree) {
        let Some(list) = ranked_in(response, id) else {
            self.missing_section(run, shard, id, "refining-top");
            return;
        };
        if let Some(existing) = run
            .shard_results
            .get_mut(&shard)
            .and_then(|tree| ranked_in_mut(tree, id))
        {
            *existing = list.clone();
        }
    }

    fn merge_ranked(&self, run: &mut Run, shard: ShardId, id: &str, response: &ResultTree) {
        let Some(incoming) = response.get_path(&[RESPONSE_SECTION, id]) else {
            self.missing_section(run, shard, id, "reconciling-keys");
            return;
        };
        let Some(existing) = run
            .shard_results
            .get_mut(&shard)
            .and_then(|tree| tree.get_path_mut(&[RESPONSE_SECTION, id]))
        else {
            return;
        };
        match merge(existing, incoming) {
            Ok(report) => run.diagnostics.extend(report.diagnostics),
            Err(err) => {
                debug!(%shard, error = %err, "skipping key answer");
                run.diagnostics.push(err.into());
            }
        }
    }

    fn missing_section(&self, run: &mut Run, shard: ShardId, id: &str, round: &str) {
        let err = ShardError::Malformed {
            shard,
            reason: format!("no ranked list for aggregation {id}"),
        };
        warn!(%shard, aggregation = id, round, "answer lacks requested aggregation");
        run.diagnostics.push(Diagnostic::shard_unavailable(round, &err));
    }

    async fn finish(
        &self,
        query: &TopKQuery,
        result: &mut ResultTree,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> Result<(), CoordinatorError> {
        let keys: BTreeMap<String, Vec<String>> = query
            .aggregations
            .iter()
            .filter_map(|agg| {
                ranked_in(result, &agg.id).map(|list| {
                    let keys = list.sorted().into_iter().map(|(k, _)| k.clone()).collect();
                    (agg.id.clone(), keys)
                })
            })
            .collect();
        if keys.is_empty() {
            return Ok(());
        }
        let subs: Vec<SubRequest> = run
            .shard_results
            .keys()
            .map(|shard| query.finish_request(*shard, &keys))
            .collect();
        let responses = self
            .sub_round(query, CoordinatorState::Finishing, subs, cancel, run)
            .await?;
        let Some(root) = result.as_map_mut() else {
            return Ok(());
        };
        if !root.contains_key(DISPLAY_SECTION) {
            root.insert(DISPLAY_SECTION, ResultTree::Map(OrderedMap::new()));
        }
        for (shard, response) in responses {
            let (Some(tree), Some(display)) = (response.as_ref(), root.get_mut(DISPLAY_SECTION))
            else {
                continue;
            };
            let Some(incoming) = tree.get_path(&[DISPLAY_SECTION]) else {
                continue;
            };
            match merge(display, incoming) {
                Ok(report) => run.diagnostics.extend(report.diagnostics),
                Err(err) => {
                    debug!(%shard, error = %err, "skipping display answer");
                    run.diagnostics.push(err.into());
                }
            }
        }
        Ok(())
    }

    async fn sub_round(
        &self,
        query: &TopKQuery,
        state: CoordinatorState,
        subs: Vec<SubRequest>,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> Result<Vec<(ShardId, Option<ResultTree>)>, CoordinatorError> {
        let requests = subs.iter().map(|s| (s.shard, s.params.clone())).collect();
        run.sub_requests.extend(subs);
        self.round(query, state, requests, cancel, run).await
    }

    /// Fan out one request per shard and wait for all of them. A failed,
    /// timed out or malformed answer comes back as `None`.
    async fn round(
        &self,
        query: &TopKQuery,
        state: CoordinatorState,
        requests: Vec<(ShardId, ParamSet)>,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> Result<Vec<(ShardId, Option<ResultTree>)>, CoordinatorError> {
        if cancel.is_cancelled() {
            return Err(CoordinatorError::Cancelled);
        }
        let timeout = self.config.shard_timeout();
        let started = Instant::now();
        let asked = requests.len();
        info!(state = state.as_str(), shards = asked, "starting round");

        let calls = requests
            .into_iter()
            .map(|(shard, params)| self.call(shard, params, timeout));
        let answers = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(state = state.as_str(), "round cancelled");
                return Err(CoordinatorError::Cancelled);
            }
            answers = join_all(calls) => answers,
        };

        let mut metrics = RoundMetrics {
            state,
            asked,
            responded: 0,
            failed: Vec::new(),
            elapsed_us: 0,
            max_shard_latency_us: 0,
        };
        let mut responses = Vec::with_capacity(answers.len());
        for (shard, answer, latency) in answers {
            metrics.max_shard_latency_us = metrics
                .max_shard_latency_us
                .max(latency.as_micros() as u64);
            match answer.and_then(|tree| self.accept(query, shard, tree, run)) {
                Ok(tree) => {
                    metrics.responded += 1;
                    responses.push((shard, Some(tree)));
                }
                Err(err) => {
                    warn!(%shard, state = state.as_str(), error = %err, "shard contributes nothing this round");
                    run.diagnostics
                        .push(Diagnostic::shard_unavailable(state.as_str(), &err));
                    metrics.failed.push(shard);
                    responses.push((shard, None));
                }
            }
        }
        metrics.elapsed_us = started.elapsed().as_micros() as u64;
        run.rounds.push(metrics);
        Ok(responses)
    }

    async fn call(
        &self,
        shard: ShardId,
        params: ParamSet,
        timeout: Duration,
    ) -> (ShardId, Result<ResultTree, ShardError>, Duration) {
        let started = Instant::now();
        let answer = match tokio::time::timeout(timeout, self.transport.send(shard, &params)).await
        {
            Ok(answer) => answer,
            Err(_) => Err(ShardError::Timeout { shard, timeout }),
        };
        (shard, answer, started.elapsed())
    }

    /// Decode embedded leaves, reject answers that are not maps and drop
    /// aggregation entries of the wrong kind. A top-K aggregation must be a
    /// ranked list; anything else must at least be a mergeable leaf.
    fn accept(
        &self,
        query: &TopKQuery,
        shard: ShardId,
        mut tree: ResultTree,
        run: &mut Run,
    ) -> Result<ResultTree, ShardError> {
        if tree.as_map().is_none() {
            return Err(ShardError::Malformed {
                shard,
                reason: format!("expected a map, got {}", tree.kind()),
            });
        }
        for diagnostic in decode_leaves(&mut tree) {
            debug!(%shard, %diagnostic, "decode failure");
            run.diagnostics.push(diagnostic);
        }
        if let Some(section) = tree
            .get_path_mut(&[RESPONSE_SECTION])
            .and_then(ResultTree::as_map_mut)
        {
            let invalid: Vec<(String, &'static str, &'static str)> = section
                .iter()
                .filter_map(|(key, value)| {
                    let ranked = query.aggregations.iter().any(|agg| agg.id == key);
                    match value.as_aggregate() {
                        Some(agg) if ranked && agg.as_ranked().is_none() => {
                            Some((key.to_string(), "ranked", agg.kind()))
                        }
                        Some(_) => None,
                        None => Some((key.to_string(), "mergeable", value.kind())),
                    }
                })
                .collect();
            for (key, expected, kind) in invalid {
                section.remove(&key);
                let path = format!("{RESPONSE_SECTION}.{key}");
                debug!(%shard, %path, kind, "dropping aggregation of the wrong kind");
                run.diagnostics
                    .push(Diagnostic::kind_mismatch(path, expected, kind));
            }
        }
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::TopKAggregation;
    use crate::test_support::{InMemoryTransport, LocalShard};

    fn shard(id: u32, entries: &[(&str, u64)]) -> LocalShard {
        let mut local = LocalShard::new(ShardId(id));
        for (key, count) in entries {
            local.add_count("text", key, *count);
        }
        local
    }

    #[tokio::test]
    async fn complete_shards_skip_refinement() {
        let transport = InMemoryTransport::new(vec![
            shard(0, &[("a", 5), ("b", 3)]),
            shard(1, &[("a", 1), ("c", 4)]),
        ]);
        let coordinator = TopKCoordinator::new(
            transport,
            vec![ShardId(0), ShardId(1)],
            CoordinatorConfig::default(),
        );
        let query = TopKQuery::new().with(TopKAggregation::new("words", "text", 2));
        let outcome = coordinator
            .execute(&query, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.visited(CoordinatorState::RefiningTop));
        assert!(outcome.sub_requests.is_empty());
        assert_eq!(
            outcome.top("words"),
            vec![
                ("a".to_string(), Numeric::Long(6)),
                ("c".to_string(), Numeric::Long(4)),
            ]
        );
        assert_eq!(outcome.states.last(), Some(&CoordinatorState::Done));
    }

    #[tokio::test]
    async fn zero_number_uses_configured_default() {
        let entries: Vec<(String, u64)> = (0..15).map(|i| (format!("k{i:02}"), 20 - i)).collect();
        let mut local = LocalShard::new(ShardId(0));
        for (key, count) in &entries {
            local.add_count("text", key, *count);
        }
        let coordinator = TopKCoordinator::new(
            InMemoryTransport::new(vec![local]),
            vec![ShardId(0)],
            CoordinatorConfig::default(),
        );
        let query = TopKQuery::new().with(TopKAggregation::new("words", "text", 0));
        let outcome = coordinator
            .execute(&query, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.top("words").len(), 10);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let coordinator = TopKCoordinator::new(
            InMemoryTransport::new(vec![shard(0, &[("a", 1)])]),
            vec![ShardId(0)],
            CoordinatorConfig::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let query = TopKQuery::new().with(TopKAggregation::new("words", "text", 2));
        let err = coordinator.execute(&query, &cancel).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Cancelled));
    }
}
