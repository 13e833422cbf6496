//! Document diff and merge utilities for defaults layering.
//!
//! Effective entity data is `merge_defaults(stored, defaults)`; what gets
//! stored is `subtract_defaults(effective, defaults)`. The pair round-trips
//! for any document derivable from the defaults plus overrides.

use cairn_core::{Document, DocumentMap};
use serde_json::Value;
use std::collections::BTreeMap;

/// Layer `doc` over `defaults`.
///
/// Objects merge recursively and `doc` wins on conflicts. Arrays keep the
/// default elements first, followed by the elements of `doc` that are not
/// defaults. A `null` in `doc` falls back to the default.
pub fn merge_defaults(doc: &Document, defaults: &Document) -> Document {
    match (doc, defaults) {
        (Value::Null, _) => defaults.clone(),
        (Value::Object(overlay), Value::Object(base)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                let layered = match base.get(key) {
                    Some(default) => merge_defaults(value, default),
                    None => value.clone(),
                };
                merged.insert(key.clone(), layered);
            }
            Value::Object(merged)
        }
        (Value::Array(overlay), Value::Array(base)) => {
            let mut merged = base.clone();
            merged.extend(overlay.iter().filter(|v| !base.contains(v)).cloned());
            Value::Array(merged)
        }
        _ => doc.clone(),
    }
}

/// Remove from `full` everything `defaults` would supply again.
///
/// Values equal to their default are dropped, objects recurse, and arrays
/// keep only the elements that are not defaults.
pub fn subtract_defaults(full: &Document, defaults: &Document) -> Document {
    match (full, defaults) {
        (Value::Object(full_map), Value::Object(base)) => {
            let mut remaining = DocumentMap::new();
            for (key, value) in full_map {
                let Some(default) = base.get(key) else {
                    remaining.insert(key.clone(), value.clone());
                    continue;
                };
                if value == default {
                    continue;
                }
                match (value, default) {
                    (Value::Object(_), Value::Object(_)) => {
                        let nested = subtract_defaults(value, default);
                        if nested.as_object().is_some_and(|m| !m.is_empty()) {
                            remaining.insert(key.clone(), nested);
                        }
                    }
                    (Value::Array(items), Value::Array(base_items)) => {
                        let extra: Vec<Value> = items
                            .iter()
                            .filter(|v| !base_items.contains(v))
                            .cloned()
                            .collect();
                        if !extra.is_empty() {
                            remaining.insert(key.clone(), Value::Array(extra));
                        }
                    }
                    _ => {
                        remaining.insert(key.clone(), value.clone());
                    }
                }
            }
            Value::Object(remaining)
        }
        _ if full == defaults => Value::Object(DocumentMap::new()),
        _ => full.clone(),
    }
}

/// Merge patch turning `from` into `to`.
///
/// Keys missing from `to` become `null`, so applying the result with
/// merge-patch semantics removes them.
pub fn merge_diff(from: &Document, to: &Document) -> Document {
    let (Value::Object(from_map), Value::Object(to_map)) = (from, to) else {
        return to.clone();
    };
    let mut patch = DocumentMap::new();
    for key in from_map.keys() {
        if !to_map.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    for (key, value) in to_map {
        match from_map.get(key) {
            Some(previous) if previous == value => {}
            Some(previous) if previous.is_object() && value.is_object() => {
                patch.insert(key.clone(), merge_diff(previous, value));
            }
            _ => {
                patch.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(patch)
}

/// One difference between two documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    /// Key path of the changed value.
    pub path: Vec<String>,
    pub kind: ChangeType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
}

/// Differences between two documents, by key path, sorted.
///
/// Objects are compared key by key; any other value (arrays included) is
/// compared whole.
pub fn diff(left: &Document, right: &Document) -> Vec<DocumentChange> {
    let mut changes = Vec::new();
    diff_into(&mut Vec::new(), left, right, &mut changes);
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}

fn diff_into(
    path: &mut Vec<String>,
    left: &Document,
    right: &Document,
    changes: &mut Vec<DocumentChange>,
) {
    match (left, right) {
        (Value::Object(l), Value::Object(r)) => {
            for (key, value) in l {
                path.push(key.clone());
                match r.get(key) {
                    Some(other) => diff_into(path, value, other, changes),
                    None => changes.push(DocumentChange {
                        path: path.clone(),
                        kind: ChangeType::Removed,
                    }),
                }
                path.pop();
            }
            for key in r.keys().filter(|k| !l.contains_key(*k)) {
                let mut added = path.clone();
                added.push(key.clone());
                changes.push(DocumentChange {
                    path: added,
                    kind: ChangeType::Added,
                });
            }
        }
        _ if left == right => {}
        _ => changes.push(DocumentChange {
            path: path.clone(),
            kind: ChangeType::Modified,
        }),
    }
}

/// Key-path aliasing rules.
///
/// An alias lets one logical key stand for several physical keys holding
/// the same value, such as one setting repeated across building blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyAliases {
    rules: BTreeMap<String, Vec<String>>,
}

impl KeyAliases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `logical` to `physical` keys.
    pub fn with_alias<I, S>(mut self, logical: impl Into<String>, physical: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules
            .insert(logical.into(), physical.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Physical keys of a logical key, if it is aliased.
    pub fn physical_keys(&self, logical: &str) -> Option<Vec<String>> {
        self.rules.get(logical).cloned()
    }

    /// Replace every logical key by its physical keys, recursively.
    pub fn expand(&self, doc: &Document) -> Document {
        let Value::Object(map) = doc else {
            return doc.clone();
        };
        let mut out = DocumentMap::new();
        for (key, value) in map {
            let value = self.expand(value);
            match self.rules.get(key) {
                Some(physical) if !physical.is_empty() => {
                    for name in physical {
                        out.insert(name.clone(), value.clone());
                    }
                }
                _ => {
                    out.insert(key.clone(), value);
                }
            }
        }
        Value::Object(out)
    }

    /// Fold physical keys back into their logical key, recursively.
    ///
    /// The first physical key present supplies the value. Physical keys
    /// that disagree with it are kept as-is.
    pub fn canonicalize(&self, doc: &Document) -> Document {
        let Value::Object(map) = doc else {
            return doc.clone();
        };
        let mut folded: DocumentMap = map
            .iter()
            .map(|(k, v)| (k.clone(), self.canonicalize(v)))
            .collect();
        for (logical, physical) in &self.rules {
            let Some(value) = physical.iter().find_map(|p| folded.get(p).cloned()) else {
                continue;
            };
            for name in physical {
                if folded.get(name) == Some(&value) {
                    folded.remove(name);
                }
            }
            folded.insert(logical.clone(), value);
        }
        Value::Object(folded)
    }
}

/// Bring two documents into the same logical shape before comparing them.
pub fn align(left: &Document, right: &Document, aliases: &KeyAliases) -> (Document, Document) {
    (aliases.canonicalize(left), aliases.canonicalize(right))
}

/// [`diff`] after [`align`].
pub fn diff_aligned(left: &Document, right: &Document, aliases: &KeyAliases) -> Vec<DocumentChange> {
    let (left, right) = align(left, right, aliases);
    diff(&left, &right)
}
