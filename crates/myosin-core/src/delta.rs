//! Structural deltas between serialized model snapshots.
//!
//! A delta keeps only the keys of the incoming document that are absent
//! from, or differ from, the base document. Nested objects are diffed
//! recursively so only the changed leaves survive.

use serde_json::Value;

use crate::model::Document;

/// Compute the delta of `incoming` with respect to `base`.
///
/// Keys removed in `incoming` are not reported; an empty result means the
/// two snapshots are reconciled.
pub fn filter_delta(base: &Document, incoming: &Document) -> Document {
    let mut delta = Document::new();

    for (key, value) in incoming {
        match base.get(key) {
            None => {
                delta.insert(key.clone(), value.clone());
            }
            Some(Value::Object(base_child)) => {
                if let Value::Object(incoming_child) = value {
                    let diff = filter_delta(base_child, incoming_child);
                    if !diff.is_empty() {
                        delta.insert(key.clone(), Value::Object(diff));
                    }
                } else {
                    delta.insert(key.clone(), value.clone());
                }
            }
            Some(previous) => {
                if previous != value {
                    delta.insert(key.clone(), value.clone());
                }
            }
        }
    }

    delta
}

/// Count the leaf values in a delta.
pub fn leaf_count(delta: &Document) -> usize {
    delta
        .values()
        .map(|value| match value {
            Value::Object(child) => leaf_count(child),
            _ => 1,
        })
        .sum()
}

/// Flatten a delta into dot-separated paths, e.g. `"config.setpoint"`.
pub fn changed_paths(delta: &Document) -> Vec<String> {
    let mut paths = Vec::new();
    collect_paths(delta, "", &mut paths);
    paths
}

fn collect_paths(delta: &Document, prefix: &str, paths: &mut Vec<String>) {
    for (key, value) in delta {
        let path = if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Object(child) if !child.is_empty() => collect_paths(child, &path, paths),
            _ => paths.push(path),
        }
    }
}
