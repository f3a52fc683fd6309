//! Snapshot diffing for render hosts.
//!
//! The host's update call only accepts "set this path to this value", so a
//! [`Patch`] can express replacements but never deletions. Whenever a record
//! loses keys or a sequence gets shorter, the whole subtree is resent at its
//! path. Reordering within a sequence of the same length is seen as a
//! per-index change, not a move.
//!
//! Paths use `.` between record keys and `[i]` for sequence indices, e.g.
//! `list[2].title`. The empty path stands for the root itself.

use crate::value::Value;
use indexmap::IndexMap;
use serde::Serialize;

/// Flat path → value mapping, in depth-first discovery order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Patch {
    entries: IndexMap<String, Value>,
}

impl Patch {
    /// Whether there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of paths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The value set at `path`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.entries.get(path)
    }

    /// Iterate `(path, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(path, value)| (path.as_str(), value))
    }

    /// The JSON object handed to the host.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.entries
                .iter()
                .map(|(path, value)| (path.clone(), value.clone().into()))
                .collect(),
        )
    }

    /// Take the underlying map.
    pub fn into_inner(self) -> IndexMap<String, Value> {
        self.entries
    }

    fn set(&mut self, path: String, value: &Value) {
        self.entries.insert(path, value.clone());
    }
}

impl IntoIterator for Patch {
    type Item = (String, Value);
    type IntoIter = indexmap::map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Compute the patch that brings a host holding `previous` up to `current`.
///
/// The root is expected to be a record and is diffed key by key. A root
/// that lost keys, or a non-record root that changed, is resent whole under
/// the empty path `""`, which replaces the host's entire state.
///
/// Never fails: mismatched shapes degrade to a whole-subtree resend.
pub fn diff(current: &Value, previous: &Value) -> Patch {
    let mut patch = Patch::default();
    match (current, previous) {
        (Value::Record(fields), Value::Record(before)) if fields.len() < before.len() => {
            cov_mark::hit!(root_resent);
            patch.set(String::new(), current);
        }
        (Value::Record(fields), _) => {
            let previous = previous.as_record();
            for (key, value) in fields {
                let before = previous.and_then(|fields| fields.get(key));
                diff_at(value, before, key.clone(), &mut patch);
            }
        }
        _ => diff_at(current, Some(previous), String::new(), &mut patch),
    }
    tracing::trace!(entries = patch.len(), "diffed snapshot");
    patch
}

fn diff_at(current: &Value, previous: Option<&Value>, path: String, patch: &mut Patch) {
    match current {
        Value::Scalar(scalar) => {
            if previous.and_then(Value::as_scalar) != Some(scalar) {
                patch.set(path, current);
            }
        }
        Value::Sequence(items) => match previous.and_then(Value::as_sequence) {
            Some(before) if items.len() >= before.len() => {
                for (index, item) in items.iter().enumerate() {
                    diff_at(item, before.get(index), format!("{path}[{index}]"), patch);
                }
            }
            _ => {
                cov_mark::hit!(sequence_resent);
                patch.set(path, current);
            }
        },
        Value::Record(fields) => match previous.and_then(Value::as_record) {
            Some(before) if fields.len() >= before.len() => {
                for (key, value) in fields {
                    diff_at(value, before.get(key), format!("{path}.{key}"), patch);
                }
            }
            _ => {
                cov_mark::hit!(record_resent);
                patch.set(path, current);
            }
        },
    }
}
