//! Wire form of mergeable leaves.
//!
//! A leaf that has to cross a hop before it is merged travels as an opaque
//! base64 string (bincode underneath). Inside a tree such a string sits under
//! a map key carrying the [`ENCODED_PREFIX`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;

use crate::aggregate::Aggregate;
use crate::error::{CodecError, Diagnostic};
use crate::tree::{ResultTree, Scalar};

/// Map keys holding an encoded leaf are the plain key with this prefix.
pub const ENCODED_PREFIX: &str = "_encoded_";

pub fn encode(leaf: &Aggregate) -> Result<String, CodecError> {
    let bytes = bincode::serialize(leaf)?;
    Ok(STANDARD.encode(bytes))
}

/// Best effort: a corrupt payload yields `None`.
pub fn decode(payload: &str) -> Option<Aggregate> {
    let bytes = STANDARD.decode(payload.trim()).ok()?;
    bincode::deserialize(&bytes).ok()
}

/// Replace every mergeable value stored in a map by its encoded string under
/// a prefixed key. Recurses through maps and keyed lists.
pub fn encode_leaves(tree: &mut ResultTree) -> Result<(), CodecError> {
    match tree {
        ResultTree::Map(map) => {
            let keys: Vec<String> = map.keys().map(str::to_string).collect();
            for key in keys {
                let encoded = match map.get_mut(&key) {
                    Some(ResultTree::Mergeable(leaf)) => Some(encode(leaf)?),
                    Some(child) => {
                        encode_leaves(child)?;
                        None
                    }
                    None => None,
                };
                if let Some(payload) = encoded {
                    map.remove(&key);
                    map.insert(format!("{ENCODED_PREFIX}{key}"), ResultTree::text(payload));
                }
            }
            Ok(())
        }
        ResultTree::KeyedList(items) => {
            for item in items {
                encode_leaves(&mut item.value)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Inverse of [`encode_leaves`]. Payloads that fail to decode are dropped and
/// reported; the rest of the tree is kept.
pub fn decode_leaves(tree: &mut ResultTree) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    decode_at(tree, String::new(), &mut diagnostics);
    diagnostics
}

fn decode_at(tree: &mut ResultTree, path: String, diagnostics: &mut Vec<Diagnostic>) {
    match tree {
        ResultTree::Map(map) => {
            let keys: Vec<String> = map.keys().map(str::to_string).collect();
            for key in keys {
                let Some(plain) = key.strip_prefix(ENCODED_PREFIX) else {
                    if let Some(child) = map.get_mut(&key) {
                        decode_at(child, join(&path, &key), diagnostics);
                    }
                    continue;
                };
                let plain = plain.to_string();
                let decoded = match map.get(&key) {
                    Some(ResultTree::Scalar(Scalar::Text(payload))) => decode(payload),
                    _ => None,
                };
                map.remove(&key);
                match decoded {
                    Some(leaf) => {
                        map.insert(plain, ResultTree::Mergeable(leaf));
                    }
                    None => {
                        let at = join(&path, &plain);
                        debug!(path = %at, "dropping undecodable aggregate");
                        diagnostics.push(Diagnostic::DecodeFailure { path: at });
                    }
                }
            }
        }
        ResultTree::KeyedList(items) => {
            for item in items {
                decode_at(&mut item.value, join(&path, &item.key), diagnostics);
            }
        }
        _ => {}
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{RankedList, SortSpec, StatsAccumulator};
    use crate::numeric::Numeric;
    use crate::tree::OrderedMap;

    fn sample_list() -> Aggregate {
        let mut list = RankedList::new(SortSpec::default(), 10);
        list.observe("alpha", Numeric::Long(3));
        list.observe("beta", Numeric::Double(1.5));
        list.truncate_local(1);
        Aggregate::Ranked(list)
    }

    #[test]
    fn encoded_leaf_decodes_to_same_value() {
        let leaf = sample_list();
        let payload = encode(&leaf).unwrap();
        assert_eq!(decode(&payload), Some(leaf));
    }

    #[test]
    fn corrupt_payload_is_absent() {
        assert_eq!(decode("not base64 at all!"), None);
        assert_eq!(decode(&STANDARD.encode([0xffu8; 3])), None);
    }

    #[test]
    fn tree_helpers_rewrite_keys() {
        let mut inner = OrderedMap::new();
        inner.insert("terms", ResultTree::Mergeable(sample_list()));
        inner.insert("hits", ResultTree::long_counter(2));
        let mut tree = ResultTree::Map(
            [("agg".to_string(), ResultTree::Map(inner))]
                .into_iter()
                .collect(),
        );
        let original = tree.clone();

        encode_leaves(&mut tree).unwrap();
        assert!(matches!(
            tree.get_path(&["agg", "_encoded_terms"]),
            Some(ResultTree::Scalar(Scalar::Text(_)))
        ));
        assert!(decode_leaves(&mut tree).is_empty());
        assert_eq!(
            tree.get_path(&["agg", "terms"]),
            original.get_path(&["agg", "terms"])
        );
    }

    #[test]
    fn undecodable_entry_is_dropped_with_diagnostic() {
        let mut map = OrderedMap::new();
        map.insert("_encoded_stats", ResultTree::text("garbage"));
        map.insert(
            "_encoded_ok",
            ResultTree::text(encode(&Aggregate::Stats(StatsAccumulator::new())).unwrap()),
        );
        let mut tree = ResultTree::Map(map);
        let diagnostics = decode_leaves(&mut tree);
        assert_eq!(
            diagnostics,
            vec![Diagnostic::DecodeFailure {
                path: "stats".to_string()
            }]
        );
        let map = tree.as_map().unwrap();
        assert!(map.contains_key("ok"));
        assert!(!map.contains_key("stats"));
    }
}
