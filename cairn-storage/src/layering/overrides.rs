//! Override relocation.
//!
//! An override is a partial document attached to one entity under a key
//! path. It is stored as its own record, one level below the entity it
//! belongs to, with the dotted key path as its id:
//!
//! ```text
//! overrides  {path: [providers, svc1], id: "tls.verify"}  payload: false
//!     │
//!     ▼ relocate
//! entities   {path: [providers], id: "svc1"}              payload: {tls: {verify: false}}
//! ```
//!
//! Deleting the override relocates to a write of `null` at the same key
//! path, which removes the key from the entity on merge. Overrides of an
//! entity that does not exist are dropped, so a deleted entity stays
//! deleted when its override records replay after it.

use crate::cache::{EventProcessor, IdentifierIndex};
use crate::encoding::{nest_payload, KeyAlias};
use crate::layering::KeyAliases;
use cairn_core::{Document, EventType, Identifier, MutationEvent};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Identifier of the override of `owner` at `key_path`.
pub fn override_identifier(owner: &Identifier, key_path: &[String]) -> Identifier {
    owner.child(key_path.join("."))
}

/// Key path encoded in an override record's id.
pub fn override_key_path(identifier: &Identifier) -> Vec<String> {
    identifier
        .id
        .split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// The value at `key_path`, if every segment resolves.
pub fn value_at<'a>(doc: &'a Document, key_path: &[String]) -> Option<&'a Document> {
    key_path
        .iter()
        .try_fold(doc, |current, key| current.as_object()?.get(key))
}

/// Remove and return the value at `key_path`. Parent objects stay.
pub fn take_at(doc: &mut Document, key_path: &[String]) -> Option<Document> {
    let (last, parents) = key_path.split_last()?;
    let mut current = doc;
    for key in parents {
        current = current.as_object_mut()?.get_mut(key)?;
    }
    current.as_object_mut()?.remove(last)
}

/// Override records currently applied, per owning entity.
#[derive(Debug, Default)]
pub struct OverrideIndex {
    by_owner: DashMap<Identifier, BTreeSet<String>>,
}

impl OverrideIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override record identifiers of `owner`, sorted.
    pub fn overrides_of(&self, owner: &Identifier) -> Vec<Identifier> {
        self.by_owner
            .get(owner)
            .map(|keys| keys.iter().map(|key| owner.child(key.clone())).collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_owner.is_empty()
    }

    fn record(&self, owner: &Identifier, key: &str) {
        self.by_owner
            .entry(owner.clone())
            .or_default()
            .insert(key.to_string());
    }

    fn forget(&self, owner: &Identifier, key: &str) {
        if let Some(mut keys) = self.by_owner.get_mut(owner) {
            keys.remove(key);
        }
        self.by_owner.remove_if(owner, |_, keys| keys.is_empty());
    }

    fn forget_owner(&self, owner: &Identifier) {
        self.by_owner.remove(owner);
    }
}

/// Rewrites override events into entity events on the owning entity.
pub struct OverrideRelocator {
    overrides: EventType,
    entities: EventType,
    alias: Option<Arc<KeyAlias>>,
    index: Arc<OverrideIndex>,
}

impl OverrideRelocator {
    pub fn new() -> Self {
        Self {
            overrides: EventType::overrides(),
            entities: EventType::entities(),
            alias: None,
            index: Arc::new(OverrideIndex::new()),
        }
    }

    /// Fan aliased key path segments out to their physical keys.
    pub fn with_aliases(mut self, aliases: KeyAliases) -> Self {
        if !aliases.is_empty() {
            let alias: Arc<KeyAlias> = Arc::new(move |segment: &str| aliases.physical_keys(segment));
            self.alias = Some(alias);
        }
        self
    }

    /// Overrides applied so far, shared with the relocator.
    pub fn index(&self) -> Arc<OverrideIndex> {
        self.index.clone()
    }

    fn relocate(&self, event: MutationEvent, cached: &dyn IdentifierIndex) -> Vec<MutationEvent> {
        let Some(owner) = event.identifier.parent() else {
            warn!(identifier = %event.identifier, "Override has no owning entity, applying in place");
            return vec![event];
        };
        let key_path = override_key_path(&event.identifier);
        if key_path.is_empty() {
            warn!(identifier = %event.identifier, "Override has an empty key path, applying in place");
            return vec![event];
        }
        if !cached.contains(&owner) {
            debug!(identifier = %event.identifier, owner = %owner, "Dropping override of a missing entity");
            self.index.forget(&owner, &event.identifier.id);
            return Vec::new();
        }

        if event.is_touch() {
            return vec![event.relocated(self.entities.clone(), owner)];
        }
        let payload = event.payload.as_deref().unwrap_or(b"null");
        let payload = if event.is_delete() { b"null".as_slice() } else { payload };

        match nest_payload(
            payload,
            event.format,
            &event.identifier,
            &key_path,
            self.alias.as_deref(),
        ) {
            Ok(nested) => {
                if event.is_delete() {
                    self.index.forget(&owner, &event.identifier.id);
                } else {
                    self.index.record(&owner, &event.identifier.id);
                }
                vec![MutationEvent {
                    event_type: self.entities.clone(),
                    identifier: owner,
                    payload: Some(nested),
                    deleted: None,
                    ..event
                }]
            }
            Err(e) => {
                // Left in place, the record fails to decode and is reported.
                warn!(identifier = %event.identifier, error = %e, "Cannot relocate override");
                vec![event]
            }
        }
    }
}

impl Default for OverrideRelocator {
    fn default() -> Self {
        Self::new()
    }
}

impl EventProcessor for OverrideRelocator {
    fn process(&self, event: MutationEvent, index: &dyn IdentifierIndex) -> Vec<MutationEvent> {
        if event.event_type == self.overrides {
            return self.relocate(event, index);
        }
        if event.event_type == self.entities && event.is_delete() {
            self.index.forget_owner(&event.identifier);
        }
        vec![event]
    }
}
