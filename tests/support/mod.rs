use shardmerge_rs::config::CoordinatorConfig;
use shardmerge_rs::test_support::LocalShard;
use shardmerge_rs::{Numeric, ShardId, TopKAggregation, TopKQuery};

#[allow(dead_code)]
pub fn shard(id: u32, entries: &[(&str, u64)]) -> LocalShard {
    let mut local = LocalShard::new(ShardId(id));
    for (key, count) in entries {
        local.add_count("text", key, *count);
    }
    local
}

/// Two shards that each report three of five keys. `g` sits below both local
/// cutoffs but ties for first place globally.
#[allow(dead_code)]
pub fn hidden_key_shards() -> Vec<LocalShard> {
    vec![
        shard(0, &[("a", 10), ("b", 9), ("c", 8), ("g", 6), ("y", 1)]),
        shard(1, &[("d", 12), ("e", 11), ("f", 10), ("g", 6), ("z", 1)]),
    ]
}

/// Shards are asked for exactly `number` entries up front.
#[allow(dead_code)]
pub fn tight_config() -> CoordinatorConfig {
    CoordinatorConfig {
        shard_number_multiplier: 1,
        ..CoordinatorConfig::default()
    }
}

#[allow(dead_code)]
pub fn words(number: i64) -> TopKQuery {
    TopKQuery::new().with(TopKAggregation::new("words", "text", number))
}

#[allow(dead_code)]
pub fn expected(pairs: &[(&str, i64)]) -> Vec<(String, Numeric)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Numeric::Long(*v)))
        .collect()
}

#[allow(dead_code)]
pub fn shard_ids(count: u32) -> Vec<ShardId> {
    (0..count).map(ShardId).collect()
}
