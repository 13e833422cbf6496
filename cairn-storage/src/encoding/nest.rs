//! Nesting partial documents under key paths.

use super::format;
use cairn_core::{Document, DocumentMap, Format, Identifier, StoreResult};
use serde_json::Value;

/// Maps a logical key to the physical keys it fans out to.
///
/// Returning `None` (or an empty list) keeps the key as-is.
pub type KeyAlias = dyn Fn(&str) -> Option<Vec<String>> + Send + Sync;

/// Wrap `doc` so it sits at `key_path`.
///
/// Segments are wrapped from the innermost outward. When `alias` maps a
/// segment to several physical keys, the wrapped value is copied under each
/// of them as siblings.
pub fn nest_document(doc: Document, key_path: &[String], alias: Option<&KeyAlias>) -> Document {
    key_path.iter().rev().fold(doc, |inner, segment| {
        let keys = alias
            .and_then(|alias| alias(segment))
            .filter(|keys| !keys.is_empty())
            .unwrap_or_else(|| vec![segment.clone()]);
        let mut map = DocumentMap::new();
        for key in keys {
            map.insert(key, inner.clone());
        }
        Value::Object(map)
    })
}

/// Re-encode a raw payload nested under `key_path`, in the same format.
pub fn nest_payload(
    bytes: &[u8],
    format: Format,
    identifier: &Identifier,
    key_path: &[String],
    alias: Option<&KeyAlias>,
) -> StoreResult<Vec<u8>> {
    if key_path.is_empty() {
        return Ok(bytes.to_vec());
    }
    let doc = if format::is_null(format, bytes) {
        Value::Null
    } else {
        format::parse(format, identifier, bytes)?
    };
    Ok(format::render(format, &nest_document(doc, key_path, alias))?)
}

/// Expand `a.b.c` keys into nested objects.
///
/// Expanded and literal keys that land on the same object are merged.
/// `null` values are kept, so the result still removes keys when merged.
pub fn expand_dotted_keys(doc: Document) -> Document {
    let Value::Object(map) = doc else {
        return doc;
    };
    let mut out = DocumentMap::new();
    for (key, value) in map {
        let value = expand_dotted_keys(value);
        let segments: Vec<&str> = key.split('.').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            insert_merged(&mut out, key, value);
        } else {
            insert_at(&mut out, &segments, value);
        }
    }
    Value::Object(out)
}

fn insert_at(map: &mut DocumentMap, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [last] => insert_merged(map, last.to_string(), value),
        [first, rest @ ..] => {
            let slot = map
                .entry(first.to_string())
                .or_insert_with(|| Value::Object(DocumentMap::new()));
            if !slot.is_object() {
                *slot = Value::Object(DocumentMap::new());
            }
            if let Value::Object(next) = slot {
                insert_at(next, rest, value);
            }
        }
    }
}

fn insert_merged(map: &mut DocumentMap, key: String, value: Value) {
    if let Value::Object(incoming) = value {
        if let Some(Value::Object(existing)) = map.get_mut(&key) {
            for (k, v) in incoming {
                insert_merged(existing, k, v);
            }
            return;
        }
        map.insert(key, Value::Object(incoming));
        return;
    }
    map.insert(key, value);
}
