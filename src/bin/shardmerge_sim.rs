use std::sync::Arc;

use serde_json::json;
use shardmerge_rs::aggregate::{SortDirection, SortSpec, SortType};
use shardmerge_rs::config::{
    ConfigOverrides, CoordinatorOverrides, ShardMergeConfig, SimulationOverrides,
};
use shardmerge_rs::test_support::{ground_truth_top, simulation_cluster, InMemoryTransport, SIM_FIELD};
use shardmerge_rs::{TopKAggregation, TopKCoordinator, TopKQuery};
use tokio_util::sync::CancellationToken;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"shardmerge_sim - Run a top-K query against simulated shards

USAGE:
    shardmerge_sim [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to config file (TOML)
    -s, --shards <N>        Override number of simulated shards [default: 4]
    -n, --number <K>        Entries requested [default: coordinator.default_number]
        --sort <TYPE>       Sort by n, sum or term [default: n]
        --asc               Sort ascending instead of descending
        --prefix <P>        Only keys starting with P
        --seed <SEED>       Override the data seed
        --timeout-ms <MS>   Override the per-shard timeout
        --finish            Run the display round
    -h, --help              Print help

ENVIRONMENT:
    SHARDMERGE_CONFIG                          Path to config file
    SHARDMERGE_COORDINATOR__SHARD_TIMEOUT_MS   Per-shard timeout
    SHARDMERGE_SIMULATION__SEED                Data seed

CONFIG FILE (shardmerge.toml):
    [coordinator]
    shard_number_multiplier = 2

    [cluster]
    shards = [0, 1, 2, 3]

    [simulation]
    shards = 4
    keys_per_shard = 200
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt::init();

    // Build CLI overrides
    let mut overrides = ConfigOverrides::default();
    let mut coordinator_overrides = CoordinatorOverrides::default();
    let mut simulation_overrides = SimulationOverrides::default();

    if let Some(timeout) = parse_arg("--timeout-ms") {
        coordinator_overrides.shard_timeout_ms = Some(timeout.parse()?);
    }
    if has_flag("--finish") {
        coordinator_overrides.finish_round = Some(true);
    }
    if let Some(shards) = parse_arg("--shards").or_else(|| parse_arg("-s")) {
        simulation_overrides.shards = Some(shards.parse()?);
    }
    if let Some(seed) = parse_arg("--seed") {
        simulation_overrides.seed = Some(seed.parse()?);
    }

    if coordinator_overrides.shard_timeout_ms.is_some() || coordinator_overrides.finish_round.is_some()
    {
        overrides.coordinator = Some(coordinator_overrides);
    }
    if simulation_overrides.shards.is_some() || simulation_overrides.seed.is_some() {
        overrides.simulation = Some(simulation_overrides);
    }

    // Load config: CLI > Env > File > Defaults
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("SHARDMERGE_CONFIG").ok());
    let config = ShardMergeConfig::load(config_path.as_deref(), overrides)?;

    let cluster = simulation_cluster(&config.simulation);
    let transport = Arc::new(InMemoryTransport::new(cluster.clone()));
    let mut shards = config.cluster.resolve_shards()?;
    if shards.is_empty() {
        shards = transport.shard_ids();
    }

    // Resolved once so the ground truth sees the same size as the coordinator
    let number = match parse_arg("--number").or_else(|| parse_arg("-n")) {
        Some(number) => config.coordinator.resolve_number(number.parse()?),
        None => config.coordinator.default_number,
    };
    let sort_type: SortType = parse_arg("--sort").as_deref().unwrap_or("n").parse()?;
    let direction = if has_flag("--asc") {
        SortDirection::Asc
    } else {
        SortDirection::Desc
    };
    let mut aggregation =
        TopKAggregation::new("top", SIM_FIELD, number).sorted_by(sort_type, direction);
    if let Some(prefix) = parse_arg("--prefix") {
        aggregation = aggregation.with_prefix(prefix);
    }
    let query = TopKQuery::new().with(aggregation);

    let queried: Vec<_> = cluster
        .iter()
        .filter(|shard| shards.contains(&shard.id()))
        .cloned()
        .collect();
    let coordinator = TopKCoordinator::new(transport.clone(), shards, config.coordinator.clone());
    let outcome = coordinator.execute(&query, &CancellationToken::new()).await?;

    let exact = if parse_arg("--prefix").is_none() {
        let expected = ground_truth_top(
            &queried,
            SIM_FIELD,
            SortSpec::new(sort_type, direction),
            number,
        );
        Some(outcome.top("top") == expected)
    } else {
        None
    };

    let report = json!({
        "result": outcome.result.to_json(),
        "states": outcome.states,
        "rounds": outcome.rounds,
        "sub_requests": outcome.sub_requests.len(),
        "requests_sent": transport.requests().await.len(),
        "diagnostics": outcome.diagnostics,
        "matches_unbounded_merge": exact,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
