//! cairn Test Utilities
//!
//! Centralized test infrastructure for the cairn workspace:
//! - Proptest generators for identifiers, events and documents
//! - Mock log drivers for testing
//! - Test fixtures for common scenarios

// Re-export the in-memory driver from its source crate
pub use cairn_events::InMemoryLogDriver;

// Re-export core types for convenience
pub use cairn_core::{
    Document, DocumentMap, EventType, Format, Identifier, LogError, MutationEvent, StoreConfig,
    StoreError, StoreResult,
};

use async_trait::async_trait;
use cairn_events::LogDriver;
use std::sync::Arc;
use tokio::sync::Mutex;

// ============================================================================
// MOCK DRIVERS
// ============================================================================

/// A call observed by [`RecordingLogDriver`].
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Append(MutationEvent),
    Delete {
        event_type: EventType,
        identifier: Identifier,
    },
}

/// In-memory driver that records every append and delete it receives.
#[derive(Debug, Default)]
pub struct RecordingLogDriver {
    inner: InMemoryLogDriver,
    calls: Mutex<Vec<DriverCall>>,
}

impl RecordingLogDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver whose replay starts with `events`.
    pub fn with_records(events: impl IntoIterator<Item = MutationEvent>) -> Self {
        Self {
            inner: InMemoryLogDriver::with_records(events),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().await.clone()
    }

    /// Events appended so far, in order.
    pub async fn appended(&self) -> Vec<MutationEvent> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|c| match c {
                DriverCall::Append(event) => Some(event.clone()),
                DriverCall::Delete { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl LogDriver for RecordingLogDriver {
    async fn replay(&self) -> StoreResult<Vec<MutationEvent>> {
        self.inner.replay().await
    }

    async fn append(&self, event: &MutationEvent) -> StoreResult<()> {
        self.inner.append(event).await?;
        self.calls.lock().await.push(DriverCall::Append(event.clone()));
        Ok(())
    }

    async fn delete(
        &self,
        event_type: &EventType,
        identifier: &Identifier,
        format: Format,
    ) -> StoreResult<()> {
        self.inner.delete(event_type, identifier, format).await?;
        self.calls.lock().await.push(DriverCall::Delete {
            event_type: event_type.clone(),
            identifier: identifier.clone(),
        });
        Ok(())
    }
}

/// Driver that replays its seed records but fails every write.
#[derive(Debug, Default)]
pub struct FailingLogDriver {
    records: Vec<MutationEvent>,
}

impl FailingLogDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(events: impl IntoIterator<Item = MutationEvent>) -> Self {
        Self {
            records: events.into_iter().collect(),
        }
    }

    fn failure(identifier: &Identifier) -> StoreError {
        LogError::Io {
            location: identifier.as_path(),
            reason: "disk full".to_string(),
        }
        .into()
    }
}

#[async_trait]
impl LogDriver for FailingLogDriver {
    async fn replay(&self) -> StoreResult<Vec<MutationEvent>> {
        Ok(self.records.clone())
    }

    async fn append(&self, event: &MutationEvent) -> StoreResult<()> {
        Err(Self::failure(&event.identifier))
    }

    async fn delete(
        &self,
        _event_type: &EventType,
        identifier: &Identifier,
        _format: Format,
    ) -> StoreResult<()> {
        Err(Self::failure(identifier))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating cairn types.

    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;

    /// One path segment or id: lowercase, no dots or slashes.
    pub fn arb_segment() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_-]{0,7}"
    }

    pub fn arb_event_type() -> impl Strategy<Value = EventType> {
        prop_oneof![
            Just(EventType::entities()),
            Just(EventType::overrides()),
            Just(EventType::defaults()),
        ]
    }

    pub fn arb_format() -> impl Strategy<Value = Format> {
        prop_oneof![Just(Format::Json), Just(Format::Yaml)]
    }

    /// Extension a record file may carry, `None` for the legacy layout.
    pub fn arb_extension() -> impl Strategy<Value = Option<&'static str>> {
        prop::option::of(prop::sample::select(vec!["json", "yml", "yaml"]))
    }

    /// Identifier with up to three path segments.
    pub fn arb_identifier() -> impl Strategy<Value = Identifier> {
        (prop::collection::vec(arb_segment(), 0..4), arb_segment())
            .prop_map(|(path, id)| Identifier::new(path, id))
    }

    /// Scalar document values that survive both formats unchanged.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            (-1000i64..1000).prop_map(Value::from),
            "[a-z]{1,8}".prop_map(Value::String),
            // Strings a YAML reader would take for another type unless quoted.
            prop::sample::select(vec!["true", "false", "null", "~", "1", "-5", "1.5"])
                .prop_map(|s| Value::String(s.to_string())),
        ]
    }

    /// Nested object documents.
    pub fn arb_document() -> impl Strategy<Value = Document> {
        let leaf = arb_scalar();
        let tree = leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..3).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        });
        prop::collection::btree_map("[a-z]{1,4}", tree, 0..5)
            .prop_map(|m| Value::Object(m.into_iter().collect()))
    }

    /// Write event carrying `arb_document` rendered as JSON.
    pub fn arb_write_event() -> impl Strategy<Value = MutationEvent> {
        (arb_event_type(), arb_identifier(), arb_document()).prop_map(|(event_type, identifier, doc)| {
            MutationEvent::write(event_type, identifier, doc.to_string().into_bytes(), Format::Json)
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built records for common scenarios.

    use super::*;
    use serde_json::json;

    /// `providers/svc1`.
    pub fn svc1() -> Identifier {
        Identifier::new(["providers"], "svc1")
    }

    pub fn provider_doc(url: &str) -> Document {
        json!({"url": url, "timeout": 30})
    }

    /// JSON write of `doc` to `identifier`.
    pub fn write_event(event_type: EventType, identifier: Identifier, doc: &Document) -> MutationEvent {
        MutationEvent::write(event_type, identifier, doc.to_string().into_bytes(), Format::Json)
    }

    /// Log driver whose history holds the given entity documents.
    pub fn seeded_driver<I>(entities: I) -> Arc<InMemoryLogDriver>
    where
        I: IntoIterator<Item = (Identifier, Document)>,
    {
        Arc::new(InMemoryLogDriver::with_records(
            entities
                .into_iter()
                .map(|(id, doc)| write_event(EventType::entities(), id, &doc)),
        ))
    }
}
