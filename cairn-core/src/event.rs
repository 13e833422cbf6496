//! Event payload shapes.
//!
//! Everything that happens to the store is one of the [`StoreEvent`]
//! variants. Mutations are the only variant ever persisted; the others are
//! produced by the event log facade to drive the replay lifecycle and
//! selective reloads.

use crate::{EventFilter, Identifier, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Logical event type tag ("entities", "overrides", "defaults", ...).
///
/// Used to route events to the engines that care about them and as the
/// `{type}` segment of physical paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub const ENTITIES: &'static str = "entities";
    pub const OVERRIDES: &'static str = "overrides";
    pub const DEFAULTS: &'static str = "defaults";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn entities() -> Self {
        Self::new(Self::ENTITIES)
    }

    pub fn overrides() -> Self {
        Self::new(Self::OVERRIDES)
    }

    pub fn defaults() -> Self {
        Self::new(Self::DEFAULTS)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Serialization format of a record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Compact format; also the legacy format of records stored without an
    /// extension.
    Json,
    /// Human-editable format; the default write format.
    Yaml,
}

impl Format {
    /// Format assumed when a physical location carries no extension.
    pub const LEGACY: Format = Format::Json;

    /// Canonical file extension.
    pub fn extension(self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Yaml => "yml",
        }
    }

    /// Resolve a file extension, accepting `yaml` as an alias of `yml`.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "json" => Some(Format::Json),
            "yml" | "yaml" => Some(Format::Yaml),
            _ => None,
        }
    }
}

impl Default for Format {
    fn default() -> Self {
        Format::Yaml
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// A single durable write or delete against one identifier.
///
/// `payload == None` together with `deleted == Some(true)` is a delete.
/// `payload == None` without the delete flag is a touch: the record is
/// re-materialized from its cached value without new content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent {
    /// Correlates a pending write with the emitted event. Not part of the
    /// record's identity.
    pub event_id: Uuid,
    pub event_type: EventType,
    pub identifier: Identifier,
    pub payload: Option<Vec<u8>>,
    pub deleted: Option<bool>,
    pub format: Format,
    pub recorded_at: Timestamp,
}

impl MutationEvent {
    /// Build a write event with a fresh event id.
    pub fn write(
        event_type: EventType,
        identifier: Identifier,
        payload: Vec<u8>,
        format: Format,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type,
            identifier,
            payload: Some(payload),
            deleted: None,
            format,
            recorded_at: Utc::now(),
        }
    }

    /// Build a delete event with a fresh event id.
    pub fn delete(event_type: EventType, identifier: Identifier, format: Format) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type,
            identifier,
            payload: None,
            deleted: Some(true),
            format,
            recorded_at: Utc::now(),
        }
    }

    /// Build a content-free event that re-materializes a cached record.
    pub fn touch(event_type: EventType, identifier: Identifier, format: Format) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type,
            identifier,
            payload: None,
            deleted: None,
            format,
            recorded_at: Utc::now(),
        }
    }

    pub fn is_delete(&self) -> bool {
        self.payload.is_none() && self.deleted == Some(true)
    }

    pub fn is_touch(&self) -> bool {
        self.payload.is_none() && self.deleted != Some(true)
    }

    /// Same event relocated to another type and identifier, keeping the
    /// event id so a pending write still recognizes it.
    pub fn relocated(&self, event_type: EventType, identifier: Identifier) -> Self {
        Self {
            event_type,
            identifier,
            ..self.clone()
        }
    }
}

/// Replay lifecycle state of one event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Replaying,
    Listening,
}

/// Lifecycle marker, one per logical event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub event_type: EventType,
    pub state: LifecycleState,
}

/// Out-of-band request to re-validate a subset of records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReloadEvent {
    pub filter: EventFilter,
}

/// Everything delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A live write, delivered after durable persistence.
    Mutation(MutationEvent),
    /// A historical write, delivered during startup in identifier order.
    Replay(MutationEvent),
    StateChange(StateChangeEvent),
    Reload(ReloadEvent),
}

impl StoreEvent {
    /// The event type this event is routed by, if it has exactly one.
    pub fn event_type(&self) -> Option<&EventType> {
        match self {
            StoreEvent::Mutation(e) | StoreEvent::Replay(e) => Some(&e.event_type),
            StoreEvent::StateChange(e) => Some(&e.event_type),
            StoreEvent::Reload(_) => None,
        }
    }

    /// The mutation carried by this event, for both live and replayed writes.
    pub fn mutation(&self) -> Option<&MutationEvent> {
        match self {
            StoreEvent::Mutation(e) | StoreEvent::Replay(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, StoreEvent::Replay(_))
    }
}
