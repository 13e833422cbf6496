//! Scoped views over an engine.

use super::{CacheEngine, CachedValue, EntityStore, IdentifierIndex, PendingWrite};
use async_trait::async_trait;
use cairn_core::{Document, Identifier, StoreResult};
use std::sync::Arc;

/// A view of an engine restricted to identifiers under a path prefix.
///
/// Identifiers going in are relative to the prefix; identifiers coming out
/// have it stripped.
pub struct ScopedStore<T> {
    engine: Arc<CacheEngine<T>>,
    prefix: Vec<String>,
}

impl<T: CachedValue> ScopedStore<T> {
    pub fn new<I, S>(engine: Arc<CacheEngine<T>>, prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            engine,
            prefix: prefix.into_iter().map(Into::into).collect(),
        }
    }

    pub fn prefix(&self) -> &[String] {
        &self.prefix
    }

    /// A narrower view below this one.
    pub fn scoped<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut prefix = self.prefix.clone();
        prefix.extend(segments.into_iter().map(Into::into));
        Self {
            engine: self.engine.clone(),
            prefix,
        }
    }

    fn absolute(&self, identifier: &Identifier) -> Identifier {
        identifier.prefixed(&self.prefix)
    }
}

#[async_trait]
impl<T: CachedValue> EntityStore<T> for ScopedStore<T> {
    fn get(&self, identifier: &Identifier) -> Option<T> {
        self.engine.get(&self.absolute(identifier))
    }

    fn identifiers(&self) -> Vec<Identifier> {
        self.engine
            .identifiers_under(&self.prefix)
            .iter()
            .filter_map(|id| id.strip_prefix(&self.prefix))
            .collect()
    }

    async fn put(&self, identifier: Identifier, value: &T) -> StoreResult<PendingWrite<T>> {
        self.engine.put(self.absolute(&identifier), value).await
    }

    async fn patch(
        &self,
        identifier: Identifier,
        partial: Document,
        key_path: &[String],
    ) -> StoreResult<PendingWrite<T>> {
        self.engine
            .patch(self.absolute(&identifier), partial, key_path)
            .await
    }

    async fn delete(&self, identifier: Identifier) -> StoreResult<PendingWrite<T>> {
        self.engine.delete(self.absolute(&identifier)).await
    }
}
