//! Properties of structural merging over shard answers.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use shardmerge_rs::test_support::random_cluster;
use shardmerge_rs::tree::OrderedMap;
use shardmerge_rs::{merge, merge_all, ResultTree, TopKAggregation, TopKQuery};

fn answers(seed: u64) -> Vec<ResultTree> {
    let params = TopKQuery::new()
        .with(TopKAggregation::new("top", "text", 10).full())
        .with(TopKAggregation::new("all", "text", 0).with_total())
        .initial_params(2);
    random_cluster(seed, 5, 60, 25, 9)
        .iter()
        .map(|shard| shard.answer(&params))
        .collect::<Result<_, _>>()
        .expect("local answers")
}

#[test]
fn merge_is_order_independent() {
    let trees = answers(3);
    let (baseline, report) = merge_all(&trees);
    assert!(report.is_clean());

    let mut rng = StdRng::seed_from_u64(17);
    for _ in 0..10 {
        let mut shuffled = trees.clone();
        shuffled.shuffle(&mut rng);
        let (merged, _) = merge_all(&shuffled);
        for id in ["top", "all"] {
            let ranked = |tree: &ResultTree| {
                tree.get_path(&["agg", id])
                    .and_then(ResultTree::as_aggregate)
                    .and_then(|a| a.as_ranked())
                    .map(|list| list.ranked_values())
            };
            assert_eq!(ranked(&merged), ranked(&baseline), "aggregation {id}");
        }
        assert_eq!(merged.to_json(), baseline.to_json());
    }
}

#[test]
fn merging_empty_tree_changes_nothing() {
    let trees = answers(8);
    let (merged, _) = merge_all(&trees);

    let mut with_empty = merged.clone();
    let report = merge(&mut with_empty, &ResultTree::Map(OrderedMap::new())).expect("maps merge");
    assert!(report.is_clean());
    assert_eq!(with_empty, merged);

    let mut from_empty = ResultTree::empty_map();
    merge(&mut from_empty, &merged).expect("maps merge");
    assert_eq!(from_empty.to_json(), merged.to_json());
}

#[test]
fn counters_sum_across_shards() {
    let trees = answers(11);
    let (merged, _) = merge_all(&trees);
    let responses = merged
        .get_path(&["responses"])
        .and_then(ResultTree::as_counter)
        .map(|c| c.value());
    assert_eq!(responses, Some(5));

    let total = merged
        .get_path(&["agg", "all"])
        .map(ResultTree::to_json)
        .and_then(|json| json["total"].as_i64());
    let keys = merged
        .get_path(&["agg", "all"])
        .and_then(ResultTree::as_aggregate)
        .and_then(|a| a.as_ranked())
        .map(|list| list.key_set().len() as i64);
    assert_eq!(total, keys);
}
