//! Event-sourcing cache engine.
//!
//! An engine materializes the events of one or more event types into an
//! in-memory map from [`Identifier`] to a typed value. It is both a reader
//! (`get`, `identifiers`) and a writer (`put`, `patch`, `delete`) whose
//! writes travel through the event log before they are visible.
//!
//! # Architecture
//!
//! ```text
//! put/patch/delete ─▶ EventLog::push ─▶ driver ─▶ CacheEngine::on_event
//!        │                                              │
//!        └──── PendingWrite ◀──── resolve(event id) ────┘
//! ```
//!
//! # Modules
//!
//! - `engine`: [`CacheEngine`] and its builder
//! - `pending`: [`PendingWrite`] futures keyed by event id
//! - `scoped`: [`ScopedStore`], a view under a path prefix

mod engine;
mod pending;
mod scoped;

pub use engine::{CacheEngine, CacheEngineBuilder};
pub use pending::PendingWrite;
pub use scoped::ScopedStore;

use async_trait::async_trait;
use cairn_core::{Document, Identifier, MutationEvent, StoreResult, ValidationError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Values an engine can hold.
///
/// Blanket-implemented for every type meeting the bounds.
pub trait CachedValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CachedValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Checks a decoded value before it becomes visible.
pub type Validator<T> = Arc<dyn Fn(&Identifier, &T) -> Result<(), ValidationError> + Send + Sync>;

/// What happened to a cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Upserted,
    Removed,
    /// Re-validated without new content (touch or reload).
    Reloaded,
}

/// Change notification broadcast by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheChange {
    pub identifier: Identifier,
    pub kind: ChangeKind,
}

/// Read access to the identifiers an engine currently holds.
pub trait IdentifierIndex {
    fn contains(&self, identifier: &Identifier) -> bool;

    /// Identifiers whose path starts with `prefix`, sorted.
    fn identifiers_under(&self, prefix: &[String]) -> Vec<Identifier>;
}

/// Rewrites one incoming event into the events the engine applies.
///
/// Runs before decoding. A processor may relocate the event, drop it, or add
/// derived events. A derived event that keeps the incoming event id stands
/// for the original when resolving the pending write.
pub trait EventProcessor: Send + Sync {
    fn process(&self, event: MutationEvent, index: &dyn IdentifierIndex) -> Vec<MutationEvent>;
}

/// Typed record store interface shared by engines and scoped views.
#[async_trait]
pub trait EntityStore<T: CachedValue>: Send + Sync {
    fn get(&self, identifier: &Identifier) -> Option<T>;

    fn has(&self, identifier: &Identifier) -> bool {
        self.get(identifier).is_some()
    }

    /// Every identifier held, sorted.
    fn identifiers(&self) -> Vec<Identifier>;

    /// Write a whole value.
    async fn put(&self, identifier: Identifier, value: &T) -> StoreResult<PendingWrite<T>>;

    /// Merge a partial document into the record, nested under `key_path`.
    async fn patch(
        &self,
        identifier: Identifier,
        partial: Document,
        key_path: &[String],
    ) -> StoreResult<PendingWrite<T>>;

    async fn delete(&self, identifier: Identifier) -> StoreResult<PendingWrite<T>>;
}
