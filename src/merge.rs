//! Structural merge of two result trees.
//!
//! `dest` is coordinator-owned and updated in place; `src` is only read. A
//! key that `dest` does not have yet is inserted as a detached clone. Kind
//! mismatches below the root are skipped and reported, never fatal.

use std::collections::HashMap;

use tracing::debug;

use crate::aggregate::Mergeable;
use crate::error::{Diagnostic, MergeError};
use crate::tree::{KeyedItem, OrderedMap, ResultTree};

/// Positions that were skipped while merging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub diagnostics: Vec<Diagnostic>,
}

impl MergeReport {
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Merge `src` into `dest`.
///
/// Fails only when the roots themselves differ in kind, in which case `dest`
/// is left untouched and the caller should treat `src` as absent.
pub fn merge(dest: &mut ResultTree, src: &ResultTree) -> Result<MergeReport, MergeError> {
    let mut report = MergeReport::default();
    merge_at(dest, src, "", &mut report)?;
    Ok(report)
}

/// Merge a sequence of trees into a fresh map, in order. Sources whose root
/// is not a map are reported and skipped.
pub fn merge_all<'a, I>(sources: I) -> (ResultTree, MergeReport)
where
    I: IntoIterator<Item = &'a ResultTree>,
{
    let mut merged = ResultTree::empty_map();
    let mut report = MergeReport::default();
    for src in sources {
        match merge(&mut merged, src) {
            Ok(mut partial) => report.diagnostics.append(&mut partial.diagnostics),
            Err(err) => {
                debug!(error = %err, "skipping source with mismatched root");
                report.diagnostics.push(err.into());
            }
        }
    }
    (merged, report)
}

fn merge_at(
    dest: &mut ResultTree,
    src: &ResultTree,
    path: &str,
    report: &mut MergeReport,
) -> Result<(), MergeError> {
    match (dest, src) {
        (ResultTree::Counter(a), ResultTree::Counter(b)) => {
            *a = a.add(*b);
        }
        (ResultTree::Map(a), ResultTree::Map(b)) => merge_maps(a, b, path, report),
        (ResultTree::KeyedList(a), ResultTree::KeyedList(b)) => {
            merge_keyed_lists(a, b, path, report)
        }
        (ResultTree::Set(a), ResultTree::Set(b)) => {
            a.extend(b.iter().cloned());
        }
        (ResultTree::Mergeable(a), ResultTree::Mergeable(b)) => {
            if b.with_total() {
                a.set_with_total(true);
            }
            a.merge(b).map_err(|err| match err {
                MergeError::KindMismatch { dest, src, .. } => MergeError::KindMismatch {
                    path: path.to_string(),
                    dest,
                    src,
                },
            })?;
        }
        (ResultTree::Scalar(_), ResultTree::Scalar(_)) => {}
        (d, s) => {
            return Err(MergeError::KindMismatch {
                path: path.to_string(),
                dest: d.kind(),
                src: s.kind(),
            });
        }
    }
    Ok(())
}

fn merge_child(dest: &mut ResultTree, src: &ResultTree, path: String, report: &mut MergeReport) {
    if let Err(err) = merge_at(dest, src, &path, report) {
        debug!(error = %err, "skipping mismatched value");
        report.diagnostics.push(err.into());
    }
}

fn merge_maps(dest: &mut OrderedMap, src: &OrderedMap, path: &str, report: &mut MergeReport) {
    for (key, value) in src.iter() {
        match dest.get_mut(key) {
            Some(existing) => merge_child(existing, value, child_path(path, key), report),
            None => {
                dest.insert(key, value.detached_clone());
            }
        }
    }
}

fn merge_keyed_lists(
    dest: &mut Vec<KeyedItem>,
    src: &[KeyedItem],
    path: &str,
    report: &mut MergeReport,
) {
    let mut index: HashMap<String, usize> = dest
        .iter()
        .enumerate()
        .map(|(idx, item)| (item.key.clone(), idx))
        .collect();
    for item in src {
        match index.get(&item.key) {
            Some(&idx) => merge_child(
                &mut dest[idx].value,
                &item.value,
                child_path(path, &item.key),
                report,
            ),
            None => {
                index.insert(item.key.clone(), dest.len());
                dest.push(KeyedItem::new(item.key.clone(), item.value.detached_clone()));
            }
        }
    }
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}
