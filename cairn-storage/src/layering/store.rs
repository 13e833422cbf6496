//! Layered entity store.
//!
//! Composes one event log with two engines:
//!
//! ```text
//!               ┌─▶ entities engine  (entities + relocated overrides)
//! EventLog ─────┤
//!               └─▶ defaults engine  (type level + subtypes)
//!
//! effective(id) = merge_defaults(entity, resolved defaults of its type)
//! ```
//!
//! Entities are persisted minus their defaults, so a later change to a
//! shared default reaches every entity that never overrode it.

use super::defaults::{DefaultsStore, SchemaRegistry};
use super::diff::{merge_defaults, merge_diff, subtract_defaults, KeyAliases};
use super::migration::{Migration, MigrationMiddleware, SCHEMA_VERSION_FIELD};
use super::overrides::{
    override_identifier, override_key_path, take_at, OverrideIndex, OverrideRelocator,
};
use crate::cache::{CacheChange, CacheEngine, PendingWrite, Validator};
use crate::encoding::{nest_document, ValueEncoding};
use cairn_core::{
    DiagnosticSink, Document, DocumentMap, EventType, Identifier, MutationEvent, StoreConfig,
    StoreResult, TracingDiagnostics, ValidationError,
};
use cairn_events::{EventLog, LogDriver};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Builder for [`LayeredStore`].
pub struct LayeredStoreBuilder {
    driver: Arc<dyn LogDriver>,
    config: StoreConfig,
    schemas: SchemaRegistry,
    migrations: Vec<Arc<dyn Migration>>,
    validator: Option<Validator<Document>>,
    diagnostics: Arc<dyn DiagnosticSink>,
    aliases: KeyAliases,
}

impl LayeredStoreBuilder {
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    /// Register a migration step. Records are upgraded to the schema version
    /// of their entity type's registered schema.
    pub fn migration(mut self, step: impl Migration + 'static) -> Self {
        self.migrations.push(Arc::new(step));
        self
    }

    pub fn validator(mut self, validator: Validator<Document>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn aliases(mut self, aliases: KeyAliases) -> Self {
        self.aliases = aliases;
        self
    }

    /// Validate the configuration and wire the log and both engines.
    ///
    /// # Errors
    ///
    /// Returns [`cairn_core::ConfigError`] for an invalid configuration.
    pub fn build(self) -> StoreResult<LayeredStore> {
        self.config.validate()?;
        let log = Arc::new(
            EventLog::from_config(self.driver, &self.config)
                .with_diagnostics(self.diagnostics.clone()),
        );

        let mut encoding = ValueEncoding::<Document>::standard(&self.config);
        let target_version = self.schemas.max_schema_version();
        if target_version > 0 {
            let mut stage = MigrationMiddleware::new(encoding.additional_events())
                .with_diagnostics(self.diagnostics.clone());
            for schema in self.schemas.iter().filter(|s| s.schema_version > 0) {
                stage = stage.with_target(schema.entity_type.clone(), schema.schema_version);
            }
            for step in self.migrations {
                stage = stage.with_shared_migration(step);
            }
            encoding = encoding.with_middleware(stage);
        }

        let relocator = OverrideRelocator::new().with_aliases(self.aliases.clone());
        let overrides = relocator.index();
        let mut entities = CacheEngine::builder("entities", log.clone())
            .event_type(EventType::entities())
            .event_type(EventType::overrides())
            .write_type(EventType::entities())
            .encoding(encoding)
            .processor(Arc::new(relocator))
            .diagnostics(self.diagnostics.clone())
            .change_capacity(self.config.change_channel_capacity);
        if let Some(validator) = self.validator {
            entities = entities.validator(validator);
        }
        let entities = entities.build()?;
        let defaults = DefaultsStore::new(log.clone(), &self.config, self.diagnostics)?;

        info!(
            schemas = self.schemas.entity_types().count(),
            target_version,
            read_only = self.config.read_only,
            "Layered store built"
        );
        Ok(LayeredStore {
            log,
            entities,
            overrides,
            defaults,
            schemas: self.schemas,
            aliases: self.aliases,
            config: self.config,
        })
    }
}

/// Entities with layered defaults and overrides over one event log.
pub struct LayeredStore {
    log: Arc<EventLog>,
    entities: Arc<CacheEngine<Document>>,
    overrides: Arc<OverrideIndex>,
    defaults: DefaultsStore,
    schemas: SchemaRegistry,
    aliases: KeyAliases,
    config: StoreConfig,
}

impl LayeredStore {
    pub fn builder(driver: Arc<dyn LogDriver>) -> LayeredStoreBuilder {
        LayeredStoreBuilder {
            driver,
            config: StoreConfig::default(),
            schemas: SchemaRegistry::new(),
            migrations: Vec::new(),
            validator: None,
            diagnostics: Arc::new(TracingDiagnostics),
            aliases: KeyAliases::new(),
        }
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn entities(&self) -> &Arc<CacheEngine<Document>> {
        &self.entities
    }

    /// Override records applied to each entity.
    pub fn overrides(&self) -> &OverrideIndex {
        &self.overrides
    }

    pub fn defaults(&self) -> &DefaultsStore {
        &self.defaults
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Replay the log into both engines.
    pub async fn start(&self) -> StoreResult<()> {
        self.log.start().await
    }

    /// Wait until both engines finished replay.
    pub async fn ready(&self) {
        self.entities.ready().await;
        self.defaults.engine().ready().await;
    }

    pub fn changes(&self) -> broadcast::Receiver<CacheChange> {
        self.entities.changes()
    }

    /// The entity as stored, without defaults.
    pub fn get(&self, identifier: &Identifier) -> Option<Document> {
        self.entities.get(identifier)
    }

    pub fn identifiers(&self) -> Vec<Identifier> {
        self.entities.identifiers()
    }

    /// Defaults applying to `entity_type`, narrowed to `subtype`.
    pub fn resolved_defaults(&self, entity_type: &str, subtype: Option<&str>) -> Document {
        match self.schemas.get(entity_type) {
            Some(schema) => self.defaults.resolve(schema, subtype),
            None => self.defaults.effective(entity_type, subtype),
        }
    }

    /// Defaults applying to a document stored at `identifier`.
    fn defaults_for(&self, identifier: &Identifier, doc: &Document) -> Document {
        let Some(entity_type) = identifier.entity_type() else {
            return Value::Object(DocumentMap::new());
        };
        let subtype = self
            .schemas
            .get(entity_type)
            .and_then(|schema| schema.subtype_of(doc));
        self.resolved_defaults(entity_type, subtype)
    }

    /// Mark a document as current so the migration stage leaves it alone.
    fn stamp_schema_version(&self, identifier: &Identifier, doc: &mut Document) {
        let version = identifier
            .entity_type()
            .and_then(|t| self.schemas.get(t))
            .map(|schema| schema.schema_version)
            .unwrap_or(0);
        if let (true, Some(map)) = (version > 0, doc.as_object_mut()) {
            map.insert(SCHEMA_VERSION_FIELD.to_string(), Value::from(version));
        }
    }

    /// The entity with its defaults filled in.
    pub fn effective(&self, identifier: &Identifier) -> Option<Document> {
        let stored = self.entities.get(identifier)?;
        let defaults = self.defaults_for(identifier, &stored);
        Some(merge_defaults(&stored, &defaults))
    }

    /// Store a fully resolved entity.
    ///
    /// Only what differs from its defaults is kept, and keys the new
    /// document no longer has are removed from the stored record. Values at
    /// overridden key paths are written to their override records instead,
    /// and an override whose key the document drops is deleted.
    pub async fn put_effective(
        &self,
        identifier: Identifier,
        full: &Document,
    ) -> StoreResult<PendingWrite<Document>> {
        let mut full = self.aliases.canonicalize(full);
        self.stamp_schema_version(&identifier, &mut full);
        let defaults = self.defaults_for(&identifier, &full);
        let mut prior = self
            .entities
            .get(&identifier)
            .unwrap_or_else(|| Value::Object(DocumentMap::new()));

        for record in self.overrides.overrides_of(&identifier) {
            let key_path = override_key_path(&record);
            let current = take_at(&mut prior, &key_path);
            let pending = match take_at(&mut full, &key_path) {
                None => self.remove_override_record(record).await?,
                Some(value) if Some(&value) == current.as_ref() => continue,
                Some(value) => {
                    let change = match current {
                        Some(current) => merge_diff(&current, &value),
                        None => value,
                    };
                    self.put_override(&identifier, &key_path, &change).await?
                }
            };
            // Apply failures are reported by the engine.
            let _ = pending.await;
        }

        let minimal = subtract_defaults(&full, &defaults);
        let change = merge_diff(&prior, &minimal);
        self.entities.merge(identifier, &change).await
    }

    /// Set the value at `key_path` of `owner` through an override record.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::ConstraintViolation`] if `owner` does not
    /// exist.
    pub async fn put_override(
        &self,
        owner: &Identifier,
        key_path: &[String],
        value: &Document,
    ) -> StoreResult<PendingWrite<Document>> {
        if !self.entities.has(owner) {
            return Err(ValidationError::ConstraintViolation {
                constraint: "override_owner".to_string(),
                reason: format!("entity {} does not exist", owner),
            }
            .into());
        }
        let encoding = self.entities.encoding();
        let format = encoding.default_format();
        let nested = nest_document(value.clone(), key_path, None);
        self.entities
            .check(owner, &encoding.render(&nested)?, format)?;

        let event = MutationEvent::write(
            EventType::overrides(),
            override_identifier(owner, key_path),
            encoding.render(value)?,
            format,
        );
        self.entities.write_event(event).await
    }

    /// Remove the override of `owner` at `key_path`.
    pub async fn delete_override(
        &self,
        owner: &Identifier,
        key_path: &[String],
    ) -> StoreResult<PendingWrite<Document>> {
        self.remove_override_record(override_identifier(owner, key_path))
            .await
    }

    async fn remove_override_record(
        &self,
        record: Identifier,
    ) -> StoreResult<PendingWrite<Document>> {
        let event = MutationEvent::delete(
            EventType::overrides(),
            record,
            self.entities.encoding().default_format(),
        );
        self.entities.write_event(event).await
    }

    /// Delete an entity together with its override records.
    pub async fn delete(&self, identifier: Identifier) -> StoreResult<PendingWrite<Document>> {
        for record in self.overrides.overrides_of(&identifier) {
            // The owner is deleted next.
            let _ = self.remove_override_record(record).await?.await;
        }
        self.entities.delete(identifier).await
    }
}
