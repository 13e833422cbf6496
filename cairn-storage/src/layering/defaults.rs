//! Layered defaults.
//!
//! Defaults live in their own event type and engine, keyed by entity type
//! and optional subtype:
//!
//! ```text
//! defaults/providers/_type.yml   type level, inherited by every subtype
//! defaults/providers/http.yml    subtype "http"
//! ```
//!
//! The effective defaults of a subtype are computed on read, so a change at
//! the type level reaches every subtype without writing subtype records.

use super::diff::merge_defaults;
use crate::cache::{
    CacheChange, CacheEngine, EventProcessor, IdentifierIndex, PendingWrite,
};
use crate::encoding::{MergeMiddleware, PlaceholderMiddleware, ValueEncoding};
use cairn_core::{
    DiagnosticSink, Document, DocumentMap, EventType, Identifier, MutationEvent, StoreConfig,
    StoreResult,
};
use cairn_events::EventLog;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Id of the type-level defaults record of an entity type.
pub const TYPE_LEVEL_ID: &str = "_type";

/// Marks a required field no default was configured for.
pub const PLACEHOLDER: &str = "<cairn:unset>";

/// One field of an entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub required: bool,
    pub default: Option<Value>,
}

/// Field layout of an entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySchema {
    pub entity_type: String,
    pub fields: Vec<FieldSpec>,
    /// Field selecting the subtype, e.g. `kind`.
    pub subtype_field: Option<String>,
    pub schema_version: u32,
}

impl EntitySchema {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            fields: Vec::new(),
            subtype_field: None,
            schema_version: 0,
        }
    }

    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            required: true,
            default: None,
        });
        self
    }

    pub fn required_with_default(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            required: true,
            default: Some(default.into()),
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, default: Option<Value>) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            required: false,
            default,
        });
        self
    }

    pub fn subtype_field(mut self, field: impl Into<String>) -> Self {
        self.subtype_field = Some(field.into());
        self
    }

    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Every required field set to its default or [`PLACEHOLDER`], plus
    /// optional fields that have a default.
    pub fn skeleton(&self) -> Document {
        let mut map = DocumentMap::new();
        for field in &self.fields {
            match (&field.default, field.required) {
                (Some(default), _) => {
                    map.insert(field.name.clone(), default.clone());
                }
                (None, true) => {
                    map.insert(field.name.clone(), Value::String(PLACEHOLDER.to_string()));
                }
                (None, false) => {}
            }
        }
        Value::Object(map)
    }

    /// Subtype named by a document, if the schema has a subtype field.
    pub fn subtype_of<'a>(&self, doc: &'a Document) -> Option<&'a str> {
        let field = self.subtype_field.as_deref()?;
        doc.get(field).and_then(Value::as_str)
    }
}

/// Entity schemas keyed by entity type.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, EntitySchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema, replacing any previous one for the entity type.
    pub fn register(&mut self, schema: EntitySchema) -> Option<EntitySchema> {
        self.schemas.insert(schema.entity_type.clone(), schema)
    }

    pub fn with(mut self, schema: EntitySchema) -> Self {
        self.register(schema);
        self
    }

    pub fn deregister(&mut self, entity_type: &str) -> Option<EntitySchema> {
        self.schemas.remove(entity_type)
    }

    pub fn get(&self, entity_type: &str) -> Option<&EntitySchema> {
        self.schemas.get(entity_type)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntitySchema> {
        self.schemas.values()
    }

    /// Highest schema version over all registered entity types.
    pub fn max_schema_version(&self) -> u32 {
        self.schemas.values().map(|s| s.schema_version).max().unwrap_or(0)
    }
}

/// Drop every member still holding [`PLACEHOLDER`], recursively.
pub fn strip_placeholders(doc: Document) -> Document {
    match doc {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| v.as_str() != Some(PLACEHOLDER))
                .map(|(k, v)| (k, strip_placeholders(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Fans a type-level defaults event out to the subtypes inheriting it.
///
/// The incoming event is kept and one touch event follows per cached
/// subtype, so their listeners see a reload.
pub struct DefaultsFanOut;

impl EventProcessor for DefaultsFanOut {
    fn process(&self, event: MutationEvent, index: &dyn IdentifierIndex) -> Vec<MutationEvent> {
        if event.identifier.id != TYPE_LEVEL_ID || event.is_touch() {
            return vec![event];
        }
        let subtypes: Vec<Identifier> = index
            .identifiers_under(&event.identifier.path)
            .into_iter()
            .filter(|id| id.path == event.identifier.path && id.id != TYPE_LEVEL_ID)
            .collect();
        debug!(
            identifier = %event.identifier,
            subtypes = subtypes.len(),
            "Fanning type-level defaults out"
        );
        let mut events = Vec::with_capacity(subtypes.len() + 1);
        let (event_type, format) = (event.event_type.clone(), event.format);
        events.push(event);
        events.extend(
            subtypes
                .into_iter()
                .map(|id| MutationEvent::touch(event_type.clone(), id, format)),
        );
        events
    }
}

/// Store of type-level and subtype defaults.
#[derive(Clone)]
pub struct DefaultsStore {
    engine: Arc<CacheEngine<DocumentMap>>,
}

impl DefaultsStore {
    /// Build the defaults engine on `log`.
    pub fn new(
        log: Arc<EventLog>,
        config: &StoreConfig,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> StoreResult<Self> {
        let mut encoding = ValueEncoding::new(config.default_format);
        if config.substitute_placeholders {
            encoding = encoding.with_middleware(PlaceholderMiddleware::from_env());
        }
        let engine = CacheEngine::builder("defaults", log)
            .event_type(EventType::defaults())
            .encoding(encoding.with_middleware(MergeMiddleware))
            .processor(Arc::new(DefaultsFanOut))
            .diagnostics(diagnostics)
            .change_capacity(config.change_channel_capacity)
            .build()?;
        Ok(Self { engine })
    }

    pub fn engine(&self) -> &Arc<CacheEngine<DocumentMap>> {
        &self.engine
    }

    pub fn changes(&self) -> broadcast::Receiver<CacheChange> {
        self.engine.changes()
    }

    /// Identifier of the defaults record for a type, or one of its subtypes.
    pub fn identifier(entity_type: &str, subtype: Option<&str>) -> Identifier {
        Identifier::new([entity_type], subtype.unwrap_or(TYPE_LEVEL_ID))
    }

    /// Subtype defaults identifiers of an entity type, sorted.
    pub fn get_identifiers(&self, entity_type: &str) -> Vec<Identifier> {
        self.engine
            .identifiers_under(&[entity_type.to_string()])
            .into_iter()
            .filter(|id| id.path.len() == 1 && id.id != TYPE_LEVEL_ID)
            .collect()
    }

    pub fn get(&self, entity_type: &str, subtype: Option<&str>) -> Option<DocumentMap> {
        self.engine.get(&Self::identifier(entity_type, subtype))
    }

    pub fn type_defaults(&self, entity_type: &str) -> Option<DocumentMap> {
        self.get(entity_type, None)
    }

    /// Subtype defaults merged over the type-level defaults.
    pub fn effective(&self, entity_type: &str, subtype: Option<&str>) -> Document {
        let type_level = self
            .type_defaults(entity_type)
            .map(Value::Object)
            .unwrap_or_else(|| Value::Object(DocumentMap::new()));
        match subtype.and_then(|s| self.get(entity_type, Some(s))) {
            Some(own) => merge_defaults(&Value::Object(own), &type_level),
            None => type_level,
        }
    }

    /// Effective defaults over the schema skeleton, with unset required
    /// fields dropped.
    pub fn resolve(&self, schema: &EntitySchema, subtype: Option<&str>) -> Document {
        let stored = self.effective(&schema.entity_type, subtype);
        strip_placeholders(merge_defaults(&stored, &schema.skeleton()))
    }

    pub async fn put(
        &self,
        entity_type: &str,
        subtype: Option<&str>,
        defaults: &DocumentMap,
    ) -> StoreResult<PendingWrite<DocumentMap>> {
        self.engine
            .put(Self::identifier(entity_type, subtype), defaults)
            .await
    }

    pub async fn patch(
        &self,
        entity_type: &str,
        subtype: Option<&str>,
        partial: Document,
        key_path: &[String],
    ) -> StoreResult<PendingWrite<DocumentMap>> {
        self.engine
            .patch(Self::identifier(entity_type, subtype), partial, key_path)
            .await
    }

    pub async fn delete(
        &self,
        entity_type: &str,
        subtype: Option<&str>,
    ) -> StoreResult<PendingWrite<DocumentMap>> {
        self.engine
            .delete(Self::identifier(entity_type, subtype))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ChangeKind;
    use cairn_core::TracingDiagnostics;
    use cairn_events::{EventLogOptions, InMemoryLogDriver};
    use serde_json::json;

    fn map(doc: Value) -> DocumentMap {
        match doc {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    async fn started() -> (Arc<EventLog>, DefaultsStore) {
        let log = Arc::new(EventLog::new(
            Arc::new(InMemoryLogDriver::new()),
            EventLogOptions::default(),
        ));
        let store = DefaultsStore::new(log.clone(), &StoreConfig::default(), Arc::new(TracingDiagnostics))
            .expect("build");
        log.start().await.expect("start");
        (log, store)
    }

    #[test]
    fn test_skeleton_and_placeholder_stripping() {
        let schema = EntitySchema::new("providers")
            .required("url")
            .required_with_default("timeout", 30)
            .optional("retries", Some(json!(3)))
            .optional("proxy", None);
        assert_eq!(
            schema.skeleton(),
            json!({"url": PLACEHOLDER, "timeout": 30, "retries": 3})
        );
        assert_eq!(
            strip_placeholders(schema.skeleton()),
            json!({"timeout": 30, "retries": 3})
        );
    }

    #[test]
    fn test_registry_lookup() {
        let registry = SchemaRegistry::new()
            .with(EntitySchema::new("providers").with_schema_version(2))
            .with(EntitySchema::new("routes"));
        assert_eq!(registry.entity_types().collect::<Vec<_>>(), vec!["providers", "routes"]);
        assert_eq!(registry.max_schema_version(), 2);
        assert!(registry.get("unknown").is_none());
    }

    #[tokio::test]
    async fn test_subtypes_listed_without_type_level() {
        let (_log, store) = started().await;
        for subtype in [None, Some("x"), Some("y")] {
            store
                .put("a", subtype, &map(json!({"level": subtype.unwrap_or("type")})))
                .await
                .expect("put")
                .await
                .expect("applied");
        }
        assert_eq!(
            store.get_identifiers("a"),
            vec![Identifier::new(["a"], "x"), Identifier::new(["a"], "y")]
        );
    }

    #[tokio::test]
    async fn test_type_level_change_reaches_subtypes() {
        let (_log, store) = started().await;
        store
            .put("a", None, &map(json!({"timeout": 10, "tls": {"verify": true}})))
            .await
            .expect("put")
            .await
            .expect("applied");
        store
            .put("a", Some("x"), &map(json!({"timeout": 20})))
            .await
            .expect("put")
            .await
            .expect("applied");
        assert_eq!(
            store.effective("a", Some("x")),
            json!({"timeout": 20, "tls": {"verify": true}})
        );

        let mut changes = store.changes();
        store
            .patch("a", None, json!({"tls.verify": false}), &[])
            .await
            .expect("patch")
            .await
            .expect("applied");
        assert_eq!(
            store.effective("a", Some("x")),
            json!({"timeout": 20, "tls": {"verify": false}})
        );

        let changes: Vec<CacheChange> = std::iter::from_fn(|| changes.try_recv().ok()).collect();
        assert!(changes.contains(&CacheChange {
            identifier: Identifier::new(["a"], "x"),
            kind: ChangeKind::Reloaded,
        }));
    }

    #[tokio::test]
    async fn test_resolve_fills_schema_defaults() {
        let (_log, store) = started().await;
        store
            .put("providers", None, &map(json!({"timeout": 5})))
            .await
            .expect("put")
            .await
            .expect("applied");
        let schema = EntitySchema::new("providers")
            .required("url")
            .required_with_default("timeout", 30)
            .required_with_default("retries", 1);
        assert_eq!(
            store.resolve(&schema, None),
            json!({"timeout": 5, "retries": 1})
        );
    }
}
