//! Storage schema migration.
//!
//! Every stored record carries a `schema_version` field (missing means 0).
//! Each entity type (the first identifier path segment) has a target
//! version; when a record is older, the [`Migration`] steps registered for
//! its entity type upgrade it one version at a time. A step may also produce
//! records for other identifiers; those are queued as additional events and
//! replayed before startup completes.

use crate::encoding::{format, AdditionalEvents, DecodeContext, DecoderMiddleware};
use cairn_core::{
    DecodeError, DiagnosticEvent, DiagnosticSink, Document, Identifier, MutationEvent,
    StoreResult, TracingDiagnostics,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Field holding a record's storage schema version.
pub const SCHEMA_VERSION_FIELD: &str = "schema_version";

/// Storage schema version of a document; 0 when absent or not a number.
pub fn schema_version(doc: &Document) -> u32 {
    doc.get(SCHEMA_VERSION_FIELD)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

/// Output of one migration step.
#[derive(Debug, Clone, PartialEq)]
pub struct MigratedRecord {
    pub document: Document,
    /// Records for other identifiers produced by the step.
    pub additional: Vec<MutationEvent>,
}

impl MigratedRecord {
    pub fn new(document: Document) -> Self {
        Self {
            document,
            additional: Vec::new(),
        }
    }

    pub fn with_event(mut self, event: MutationEvent) -> Self {
        self.additional.push(event);
        self
    }
}

/// One upgrade step of an entity type from `from_version()` to
/// `from_version() + 1`.
pub trait Migration: Send + Sync {
    fn entity_type(&self) -> &str;

    fn from_version(&self) -> u32;

    fn migrate(&self, identifier: &Identifier, doc: Document) -> StoreResult<MigratedRecord>;
}

/// Decoder stage upgrading outdated records to the target version.
///
/// Recoverable: if a later stage or binding fails, the raw payload is
/// migrated on its own and decoding resumes from the result.
pub struct MigrationMiddleware {
    targets: BTreeMap<String, u32>,
    steps: BTreeMap<(String, u32), Arc<dyn Migration>>,
    additional: AdditionalEvents,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl MigrationMiddleware {
    /// `additional` is the queue of the engine whose encoding this stage
    /// belongs to.
    pub fn new(additional: AdditionalEvents) -> Self {
        Self {
            targets: BTreeMap::new(),
            steps: BTreeMap::new(),
            additional,
            diagnostics: Arc::new(TracingDiagnostics),
        }
    }

    /// Upgrade records of `entity_type` to `version`.
    pub fn with_target(mut self, entity_type: impl Into<String>, version: u32) -> Self {
        self.targets.insert(entity_type.into(), version);
        self
    }

    pub fn with_migration(self, step: impl Migration + 'static) -> Self {
        self.with_shared_migration(Arc::new(step))
    }

    pub fn with_shared_migration(mut self, step: Arc<dyn Migration>) -> Self {
        self.steps
            .insert((step.entity_type().to_string(), step.from_version()), step);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Target version of an entity type, if it has one.
    pub fn target_version(&self, entity_type: &str) -> Option<u32> {
        self.targets.get(entity_type).copied()
    }

    fn upgrade(&self, ctx: &DecodeContext<'_>, doc: Document) -> StoreResult<Document> {
        let Some(entity_type) = ctx.identifier.entity_type() else {
            return Ok(doc);
        };
        let Some(target_version) = self.target_version(entity_type) else {
            return Ok(doc);
        };
        let from_version = schema_version(&doc);
        if from_version >= target_version || doc.is_null() {
            return Ok(doc);
        }

        let mut doc = doc;
        let mut produced = Vec::new();
        for version in from_version..target_version {
            let Some(step) = self.steps.get(&(entity_type.to_string(), version)) else {
                return Err(DecodeError::Middleware {
                    stage: self.name().to_string(),
                    identifier: ctx.identifier.clone(),
                    reason: format!(
                        "no {} migration registered from version {}",
                        entity_type, version
                    ),
                }
                .into());
            };
            let migrated = step.migrate(ctx.identifier, doc)?;
            doc = migrated.document;
            produced.extend(migrated.additional);
        }
        if let Some(map) = doc.as_object_mut() {
            map.insert(
                SCHEMA_VERSION_FIELD.to_string(),
                Value::from(target_version),
            );
        }

        if !ctx.preview {
            self.diagnostics.emit(DiagnosticEvent::Migrated {
                identifier: ctx.identifier.clone(),
                from_version,
                to_version: target_version,
                produced: produced.len(),
            });
            // The upgraded record itself is rewritten too, so persisting
            // migrations stores it at the current version.
            let rewritten = format::render(ctx.format, &doc)?;
            produced.push(MutationEvent::write(
                ctx.event_type.clone(),
                ctx.identifier.clone(),
                rewritten,
                ctx.format,
            ));
            self.additional.push(produced);
        }
        Ok(doc)
    }
}

impl DecoderMiddleware for MigrationMiddleware {
    fn name(&self) -> &str {
        "migration"
    }

    fn apply(&self, ctx: &DecodeContext<'_>, doc: Document) -> StoreResult<Document> {
        self.upgrade(ctx, doc)
    }

    fn can_recover(&self) -> bool {
        true
    }

    fn recover(&self, ctx: &DecodeContext<'_>) -> StoreResult<Document> {
        let doc = format::parse(ctx.format, ctx.identifier, ctx.payload)?;
        self.upgrade(ctx, doc)
    }
}
