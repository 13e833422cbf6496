//! Generic documents.
//!
//! Records travel through decoding and layering as a JSON-compatible
//! [`Document`]. Both supported formats map onto it losslessly for the value
//! shapes configuration records use.

use serde_json::{Map, Value};

/// A JSON-compatible document tree.
pub type Document = Value;

/// A document known to be an object.
pub type DocumentMap = Map<String, Value>;

/// Apply `patch` onto `target` with RFC 7396 merge-patch semantics.
///
/// Objects merge recursively, a `null` member removes the key, anything else
/// replaces the target value.
pub fn merge_patch(target: &mut Document, patch: &Document) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target_map) = target else {
        return;
    };

    for (key, value) in patch_map {
        if value.is_null() {
            target_map.remove(key);
            continue;
        }
        match target_map.get_mut(key) {
            Some(existing) => merge_patch(existing, value),
            None => {
                let mut fresh = Value::Null;
                merge_patch(&mut fresh, value);
                target_map.insert(key.clone(), fresh);
            }
        }
    }
}

/// Whether a document carries no information (`null` or an empty object).
pub fn is_empty_document(doc: &Document) -> bool {
    match doc {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Look up a nested value by key path.
pub fn get_path<'a>(doc: &'a Document, path: &[&str]) -> Option<&'a Document> {
    path.iter().try_fold(doc, |current, key| current.get(*key))
}
