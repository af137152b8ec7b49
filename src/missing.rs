//! Which keys each shard still owes for a ranked aggregation.

use std::collections::{BTreeMap, BTreeSet};

use crate::aggregate::RankedList;
use crate::transport::ShardId;

/// Keys a shard reported for one aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardKeys {
    pub shard: ShardId,
    pub keys: BTreeSet<String>,
    /// The shard reported every key it has; anything absent counts as zero.
    pub authoritative: bool,
}

impl ShardKeys {
    pub fn from_ranked(shard: ShardId, list: &RankedList) -> Self {
        Self {
            shard,
            keys: list.key_set(),
            authoritative: list.is_complete(),
        }
    }
}

/// Union of every shard's keys.
pub fn key_union(shards: &[ShardKeys]) -> BTreeSet<String> {
    shards
        .iter()
        .flat_map(|s| s.keys.iter().cloned())
        .collect()
}

/// Per shard, the keys of the union it did not report. Shards that owe
/// nothing are left out.
pub fn missing_keys(shards: &[ShardKeys]) -> BTreeMap<ShardId, BTreeSet<String>> {
    let union = key_union(shards);
    shards
        .iter()
        .filter(|s| !s.authoritative)
        .filter_map(|s| {
            let missing: BTreeSet<String> = union.difference(&s.keys).cloned().collect();
            (!missing.is_empty()).then_some((s.shard, missing))
        })
        .collect()
}
