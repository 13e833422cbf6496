//! Decoder middleware stages.
//!
//! A stage transforms the parsed document on its way to the typed value.
//! Stages run in registration order. A stage that reports
//! [`DecoderMiddleware::can_recover`] may be asked to rebuild the document
//! from the raw payload when itself or a later stage fails.

use cairn_core::{
    merge_patch, DecodeError, Document, EventType, Format, Identifier, MutationEvent, StoreError,
    StoreResult,
};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};

/// `${NAME}` or `${NAME:-fallback}`.
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("Invalid placeholder regex")
});

/// Everything a stage may need to know about the record being decoded.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    pub event_type: &'a EventType,
    pub identifier: &'a Identifier,
    pub format: Format,
    /// Raw payload, for recovery.
    pub payload: &'a [u8],
    /// Cached document this record merges onto, if any.
    pub prior: Option<&'a Document>,
    /// Set when decoding a tentative value that will not be applied.
    pub preview: bool,
}

/// One stage of the decode pipeline.
pub trait DecoderMiddleware: Send + Sync {
    /// Stage name, used in errors and diagnostics.
    fn name(&self) -> &str;

    fn apply(&self, ctx: &DecodeContext<'_>, doc: Document) -> StoreResult<Document>;

    /// Whether this stage can rebuild a document after a failure.
    fn can_recover(&self) -> bool {
        false
    }

    /// Rebuild a document from the raw payload.
    fn recover(&self, ctx: &DecodeContext<'_>) -> StoreResult<Document> {
        Err(DecodeError::Middleware {
            stage: self.name().to_string(),
            identifier: ctx.identifier.clone(),
            reason: "stage cannot recover".to_string(),
        }
        .into())
    }
}

/// Queue of events produced while decoding, drained by the owning engine.
#[derive(Debug, Clone, Default)]
pub struct AdditionalEvents {
    queue: Arc<Mutex<Vec<MutationEvent>>>,
}

impl AdditionalEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, events: impl IntoIterator<Item = MutationEvent>) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(events);
    }

    pub fn drain(&self) -> Vec<MutationEvent> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Looks up a placeholder name.
pub type PlaceholderResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Substitutes `${NAME}` references in string values.
///
/// Names resolve through the configured resolver (the process environment
/// by default). A reference that resolves to nothing and has no
/// `:-fallback` fails the record.
pub struct PlaceholderMiddleware {
    resolver: PlaceholderResolver,
}

impl PlaceholderMiddleware {
    /// Resolve names from the process environment.
    pub fn from_env() -> Self {
        Self::new(Arc::new(|name: &str| std::env::var(name).ok()))
    }

    pub fn new(resolver: PlaceholderResolver) -> Self {
        Self { resolver }
    }

    fn substitute(&self, identifier: &Identifier, value: &mut Value) -> Result<(), DecodeError> {
        match value {
            Value::String(text) if text.contains("${") => {
                let mut missing = None;
                let replaced = PLACEHOLDER.replace_all(text, |caps: &Captures<'_>| {
                    let name = &caps[1];
                    match (self.resolver)(name) {
                        Some(resolved) => resolved,
                        None => match caps.get(2) {
                            Some(fallback) => fallback.as_str().to_string(),
                            None => {
                                missing.get_or_insert_with(|| name.to_string());
                                String::new()
                            }
                        },
                    }
                });
                if let Some(placeholder) = missing {
                    return Err(DecodeError::UnresolvedPlaceholder {
                        identifier: identifier.clone(),
                        placeholder,
                    });
                }
                *text = replaced.into_owned();
                Ok(())
            }
            Value::Array(items) => items
                .iter_mut()
                .try_for_each(|item| self.substitute(identifier, item)),
            Value::Object(map) => map
                .values_mut()
                .try_for_each(|item| self.substitute(identifier, item)),
            _ => Ok(()),
        }
    }
}

impl DecoderMiddleware for PlaceholderMiddleware {
    fn name(&self) -> &str {
        "placeholder"
    }

    fn apply(&self, ctx: &DecodeContext<'_>, mut doc: Document) -> StoreResult<Document> {
        self.substitute(ctx.identifier, &mut doc)?;
        Ok(doc)
    }
}

/// Merges the incoming document onto the cached one (merge-on-read).
///
/// `null` members remove keys; a record with no cached predecessor is merged
/// onto nothing, which strips its `null` members.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeMiddleware;

impl DecoderMiddleware for MergeMiddleware {
    fn name(&self) -> &str {
        "merge"
    }

    fn apply(&self, ctx: &DecodeContext<'_>, doc: Document) -> StoreResult<Document> {
        let mut merged = ctx.prior.cloned().unwrap_or(Value::Null);
        merge_patch(&mut merged, &doc);
        Ok(merged)
    }
}

/// Drops records whose identity field disagrees with their location.
#[derive(Debug, Clone)]
pub struct IdentityMiddleware {
    field: String,
}

impl IdentityMiddleware {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl DecoderMiddleware for IdentityMiddleware {
    fn name(&self) -> &str {
        "identity"
    }

    fn apply(&self, ctx: &DecodeContext<'_>, doc: Document) -> StoreResult<Document> {
        let found = match doc.get(&self.field) {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) if *id == ctx.identifier.id => None,
            Some(Value::String(id)) => Some(id.clone()),
            Some(other) => Some(other.to_string()),
        };
        match found {
            None => Ok(doc),
            Some(found) => Err(StoreError::IdentifierMismatch {
                expected: ctx.identifier.clone(),
                found,
            }),
        }
    }
}

/// Computes a value from the record's context.
pub type DerivedValueFn = Arc<dyn Fn(&DecodeContext<'_>, &Document) -> Option<Value> + Send + Sync>;

/// Sets one key of the decoded document to a computed value.
pub struct DerivedValueMiddleware {
    name: String,
    key: String,
    compute: DerivedValueFn,
}

impl DerivedValueMiddleware {
    pub fn new(name: impl Into<String>, key: impl Into<String>, compute: DerivedValueFn) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            compute,
        }
    }
}

impl DecoderMiddleware for DerivedValueMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, ctx: &DecodeContext<'_>, mut doc: Document) -> StoreResult<Document> {
        let Some(value) = (self.compute)(ctx, &doc) else {
            return Ok(doc);
        };
        match doc.as_object_mut() {
            Some(map) => {
                map.insert(self.key.clone(), value);
                Ok(doc)
            }
            None => Err(DecodeError::Middleware {
                stage: self.name.clone(),
                identifier: ctx.identifier.clone(),
                reason: format!("cannot set {} on a non-object document", self.key),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn with_ctx<R>(prior: Option<&Document>, f: impl FnOnce(&DecodeContext<'_>) -> R) -> R {
        let event_type = EventType::entities();
        let identifier = Identifier::new(["providers"], "svc1");
        let ctx = DecodeContext {
            event_type: &event_type,
            identifier: &identifier,
            format: Format::Yaml,
            payload: b"",
            prior,
            preview: false,
        };
        f(&ctx)
    }

    fn resolver(vars: &[(&str, &str)]) -> PlaceholderResolver {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Arc::new(move |name: &str| vars.get(name).cloned())
    }

    #[test]
    fn test_placeholder_substitutes_nested_strings() {
        let stage = PlaceholderMiddleware::new(resolver(&[("HOST", "db.local")]));
        let doc = json!({"url": "http://${HOST}:${PORT:-5432}", "tags": ["${HOST}"], "n": 1});
        let out = with_ctx(None, |ctx| stage.apply(ctx, doc)).expect("apply");
        assert_eq!(
            out,
            json!({"url": "http://db.local:5432", "tags": ["db.local"], "n": 1})
        );
    }

    #[test]
    fn test_placeholder_unresolved_fails() {
        let stage = PlaceholderMiddleware::new(resolver(&[]));
        let err = with_ctx(None, |ctx| stage.apply(ctx, json!({"url": "${MISSING}"}))).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Decode(DecodeError::UnresolvedPlaceholder { ref placeholder, .. }) if placeholder == "MISSING"
        ));
    }

    #[test]
    fn test_merge_onto_prior() {
        let prior = json!({"url": "http://a", "timeout": 5});
        let out = with_ctx(Some(&prior), |ctx| {
            MergeMiddleware.apply(ctx, json!({"timeout": null, "retries": 3}))
        })
        .expect("merge");
        assert_eq!(out, json!({"url": "http://a", "retries": 3}));
    }

    #[test]
    fn test_merge_without_prior_strips_nulls() {
        let out = with_ctx(None, |ctx| MergeMiddleware.apply(ctx, json!({"a": null, "b": 1})))
            .expect("merge");
        assert_eq!(out, json!({"b": 1}));
    }

    #[test]
    fn test_identity_mismatch_drops_record() {
        let stage = IdentityMiddleware::new("id");
        let ok = with_ctx(None, |ctx| stage.apply(ctx, json!({"id": "svc1"})));
        assert!(ok.is_ok());
        let absent = with_ctx(None, |ctx| stage.apply(ctx, json!({"url": "x"})));
        assert!(absent.is_ok());

        let err = with_ctx(None, |ctx| stage.apply(ctx, json!({"id": "svc2"}))).unwrap_err();
        assert!(err.is_dropped_record());
    }

    #[test]
    fn test_derived_value_sets_key() {
        let stage = DerivedValueMiddleware::new(
            "owner",
            "owner",
            Arc::new(|ctx: &DecodeContext<'_>, _doc: &Document| {
                ctx.identifier.entity_type().map(|t| json!(t))
            }),
        );
        let out = with_ctx(None, |ctx| stage.apply(ctx, json!({"a": 1}))).expect("apply");
        assert_eq!(out, json!({"a": 1, "owner": "providers"}));
    }

    #[test]
    fn test_additional_events_drain() {
        let queue = AdditionalEvents::new();
        let handle = queue.clone();
        handle.push([MutationEvent::touch(
            EventType::entities(),
            Identifier::new(["a"], "b"),
            Format::Yaml,
        )]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }
}
