//! Cache engine implementation.

use super::pending::{PendingWrite, PendingWrites};
use super::{
    CacheChange, CachedValue, ChangeKind, EntityStore, EventProcessor, IdentifierIndex, Validator,
};
use crate::encoding::{expand_dotted_keys, nest_document, DecodeRequest, ValueEncoding};
use async_trait::async_trait;
use cairn_core::{
    ConfigError, DiagnosticEvent, DiagnosticSink, Document, EventFilter, EventType, Format,
    Identifier, LifecycleState, MutationEvent, StateChangeEvent, StoreError, StoreEvent,
    StoreResult, TracingDiagnostics, ValidationError,
};
use cairn_events::{EventLog, EventSubscriber, MIGRATION_PASSES};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

const DEFAULT_CHANGE_CAPACITY: usize = 256;

type ReadyCallback = Box<dyn FnOnce() + Send>;

/// Builder for [`CacheEngine`].
pub struct CacheEngineBuilder<T> {
    name: String,
    log: Arc<EventLog>,
    event_types: Vec<EventType>,
    write_type: Option<EventType>,
    encoding: Option<ValueEncoding<T>>,
    validator: Option<Validator<T>>,
    processor: Option<Arc<dyn EventProcessor>>,
    diagnostics: Arc<dyn DiagnosticSink>,
    change_capacity: usize,
}

impl<T: CachedValue> CacheEngineBuilder<T> {
    /// Consume one more event type.
    pub fn event_type(mut self, event_type: EventType) -> Self {
        if !self.event_types.contains(&event_type) {
            self.event_types.push(event_type);
        }
        self
    }

    /// Event type writes are emitted with. Defaults to the first consumed type.
    pub fn write_type(mut self, event_type: EventType) -> Self {
        self.write_type = Some(event_type);
        self
    }

    pub fn encoding(mut self, encoding: ValueEncoding<T>) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn validator(mut self, validator: Validator<T>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn processor(mut self, processor: Arc<dyn EventProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn change_capacity(mut self, capacity: usize) -> Self {
        self.change_capacity = capacity;
        self
    }

    /// Build the engine and register it with the log.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingRequired`] if no event type was given.
    pub fn build(self) -> StoreResult<Arc<CacheEngine<T>>> {
        let Some(first) = self.event_types.first().cloned() else {
            return Err(ConfigError::MissingRequired {
                field: "event_types".to_string(),
            }
            .into());
        };
        if self.change_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "change_capacity".to_string(),
                value: "0".to_string(),
                reason: "change channel capacity must be greater than 0".to_string(),
            }
            .into());
        }

        let encoding = self
            .encoding
            .unwrap_or_else(|| ValueEncoding::new(Format::default()));
        let (ready_tx, _) = watch::channel(false);
        let (changes, _) = broadcast::channel(self.change_capacity);

        let engine = Arc::new(CacheEngine {
            name: self.name,
            write_type: self.write_type.unwrap_or(first),
            event_types: self.event_types,
            encoding,
            cache: DashMap::new(),
            pending: PendingWrites::default(),
            validator: self.validator,
            processor: self.processor,
            log: self.log.clone(),
            listening: Mutex::new(HashSet::new()),
            ready_tx,
            ready_callbacks: Mutex::new(Vec::new()),
            changes,
            diagnostics: self.diagnostics,
        });
        self.log.subscribe(engine.clone());
        info!(engine = %engine.name, event_types = ?engine.event_types, "Cache engine registered");
        Ok(engine)
    }
}

/// Materializes events into a typed, in-memory cache.
///
/// Writes are routed through the event log; the cache only ever changes in
/// response to delivered events. Readers never block on writers.
pub struct CacheEngine<T> {
    name: String,
    event_types: Vec<EventType>,
    write_type: EventType,
    encoding: ValueEncoding<T>,
    cache: DashMap<Identifier, T>,
    pending: PendingWrites<T>,
    validator: Option<Validator<T>>,
    processor: Option<Arc<dyn EventProcessor>>,
    log: Arc<EventLog>,
    /// Event types that reached LISTENING.
    listening: Mutex<HashSet<EventType>>,
    ready_tx: watch::Sender<bool>,
    ready_callbacks: Mutex<Vec<ReadyCallback>>,
    changes: broadcast::Sender<CacheChange>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl<T: CachedValue> CacheEngine<T> {
    /// Start building an engine named `name` on top of `log`.
    pub fn builder(name: impl Into<String>, log: Arc<EventLog>) -> CacheEngineBuilder<T> {
        CacheEngineBuilder {
            name: name.into(),
            log,
            event_types: Vec::new(),
            write_type: None,
            encoding: None,
            validator: None,
            processor: None,
            diagnostics: Arc::new(TracingDiagnostics),
            change_capacity: DEFAULT_CHANGE_CAPACITY,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn write_type(&self) -> &EventType {
        &self.write_type
    }

    pub fn encoding(&self) -> &ValueEncoding<T> {
        &self.encoding
    }

    pub fn get(&self, identifier: &Identifier) -> Option<T> {
        self.cache.get(identifier).map(|v| v.value().clone())
    }

    pub fn has(&self, identifier: &Identifier) -> bool {
        self.cache.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Every cached identifier, sorted.
    pub fn identifiers(&self) -> Vec<Identifier> {
        let mut ids: Vec<Identifier> = self.cache.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Every cached record, sorted by identifier.
    pub fn snapshot(&self) -> Vec<(Identifier, T)> {
        let mut records: Vec<(Identifier, T)> = self
            .cache
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        records
    }

    /// Whether every consumed event type reached LISTENING.
    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    /// Wait until every consumed event type reached LISTENING.
    pub async fn ready(&self) {
        let mut ready = self.ready_tx.subscribe();
        // The sender lives as long as the engine, so this only ends when ready.
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Run `callback` once the engine is ready, immediately if it already is.
    pub fn on_ready(&self, callback: impl FnOnce() + Send + 'static) {
        let mut callbacks = self
            .ready_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_ready() {
            drop(callbacks);
            callback();
        } else {
            callbacks.push(Box::new(callback));
        }
    }

    /// Receive a notification for every cache change.
    pub fn changes(&self) -> broadcast::Receiver<CacheChange> {
        self.changes.subscribe()
    }

    /// Write a whole value.
    ///
    /// Returns once the event is durable; await the returned
    /// [`PendingWrite`] for the decoded value.
    pub async fn put(&self, identifier: Identifier, value: &T) -> StoreResult<PendingWrite<T>> {
        let payload = self.encoding.serialize(value)?;
        let event = MutationEvent::write(
            self.write_type.clone(),
            identifier,
            payload,
            self.encoding.default_format(),
        );
        self.submit(event).await
    }

    /// Write a raw payload. A format-specific `null` payload is a delete.
    pub async fn put_raw(
        &self,
        identifier: Identifier,
        payload: Vec<u8>,
        format: Format,
    ) -> StoreResult<PendingWrite<T>> {
        let event = if self.encoding.is_null(&payload, format) {
            MutationEvent::delete(self.write_type.clone(), identifier, format)
        } else {
            MutationEvent::write(self.write_type.clone(), identifier, payload, format)
        };
        self.submit(event).await
    }

    /// Merge a partial document into the record.
    ///
    /// Dotted keys expand into nested objects and the result is nested under
    /// `key_path`. The merged value is decoded and validated before anything
    /// is written; a `null` member removes a key.
    pub async fn patch(
        &self,
        identifier: Identifier,
        partial: Document,
        key_path: &[String],
    ) -> StoreResult<PendingWrite<T>> {
        let doc = nest_document(expand_dotted_keys(partial), key_path, None);
        self.merge(identifier, &doc).await
    }

    /// Merge an already shaped document into the record, keys taken
    /// verbatim.
    pub async fn merge(&self, identifier: Identifier, doc: &Document) -> StoreResult<PendingWrite<T>> {
        let format = self.encoding.default_format();
        let payload = self.encoding.render(doc)?;
        self.check(&identifier, &payload, format)?;
        let event = MutationEvent::write(self.write_type.clone(), identifier, payload, format);
        self.submit(event).await
    }

    /// Decode `payload` against the cached record without side effects and
    /// validate the result.
    pub fn check(&self, identifier: &Identifier, payload: &[u8], format: Format) -> StoreResult<()> {
        let prior = self.get(identifier);
        let tentative = self.encoding.preview(
            DecodeRequest {
                event_type: &self.write_type,
                identifier,
                payload,
                format,
            },
            prior.as_ref(),
        )?;
        if let Some(value) = &tentative.value {
            self.validate(identifier, value)?;
        }
        Ok(())
    }

    pub async fn delete(&self, identifier: Identifier) -> StoreResult<PendingWrite<T>> {
        let event = MutationEvent::delete(
            self.write_type.clone(),
            identifier,
            self.encoding.default_format(),
        );
        self.submit(event).await
    }

    /// Push an arbitrary event through the log, tracking its outcome under
    /// the event's own identifier.
    ///
    /// The event may be of any type this engine consumes.
    pub async fn write_event(&self, event: MutationEvent) -> StoreResult<PendingWrite<T>> {
        if !self.event_types.contains(&event.event_type) {
            return Err(ConfigError::InvalidValue {
                field: "event_type".to_string(),
                value: event.event_type.to_string(),
                reason: format!("engine {} does not consume this event type", self.name),
            }
            .into());
        }
        self.submit(event).await
    }

    async fn submit(&self, event: MutationEvent) -> StoreResult<PendingWrite<T>> {
        let identifier = event.identifier.clone();
        let event_id = event.event_id;
        let pending = self.pending.register(identifier.clone(), event_id);
        if let Err(e) = self.log.push(event).await {
            self.pending.discard(&identifier, event_id);
            return Err(e);
        }
        Ok(pending)
    }

    fn validate(&self, identifier: &Identifier, value: &T) -> Result<(), ValidationError> {
        match &self.validator {
            Some(validator) => validator(identifier, value),
            None => Ok(()),
        }
    }

    /// Apply one delivered event. Live events resolve their pending write.
    fn apply_event(&self, event: MutationEvent, live: bool) {
        let origin = event.identifier.clone();
        let event_id = event.event_id;
        let derived = match &self.processor {
            Some(processor) => processor.process(event, self),
            None => vec![event],
        };

        let mut outcome = None;
        for item in derived {
            let result = self.apply_one(&item);
            if item.event_id == event_id {
                outcome = Some(result);
            }
        }

        if live {
            let outcome = outcome.unwrap_or_else(|| Ok(self.get(&origin)));
            self.pending.resolve(&origin, event_id, outcome);
            self.apply_local_additional();
        }
    }

    fn apply_one(&self, event: &MutationEvent) -> StoreResult<Option<T>> {
        let identifier = &event.identifier;
        if event.is_delete() {
            self.remove(identifier);
            return Ok(None);
        }
        let Some(payload) = event.payload.as_deref() else {
            return self.revalidate(identifier);
        };

        let prior = self.get(identifier);
        if prior.is_some() && self.encoding.is_empty(payload, event.format) {
            debug!(engine = %self.name, identifier = %identifier, "Skipping empty record");
            return Ok(prior);
        }

        let request = DecodeRequest {
            event_type: &event.event_type,
            identifier,
            payload,
            format: event.format,
        };
        let decoded = match self.encoding.decode(request, prior.as_ref()) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.report_failure(event, &e);
                return Err(e);
            }
        };
        if let Some(stage) = decoded.recovered_by {
            self.diagnostics.emit(DiagnosticEvent::DecodeRecovered {
                identifier: identifier.clone(),
                stage,
            });
        }

        let Some(value) = decoded.value else {
            self.remove(identifier);
            return Ok(None);
        };

        // Readers only ever see values that passed validation.
        if let Err(e) = self.validate(identifier, &value) {
            self.diagnostics.emit(DiagnosticEvent::ValidationRolledBack {
                identifier: identifier.clone(),
                reason: e.to_string(),
            });
            return Err(e.into());
        }
        self.cache.insert(identifier.clone(), value.clone());
        self.notify(identifier, ChangeKind::Upserted);
        Ok(Some(value))
    }

    /// Re-validate a cached record without new content.
    fn revalidate(&self, identifier: &Identifier) -> StoreResult<Option<T>> {
        let Some(value) = self.get(identifier) else {
            return Ok(None);
        };
        if let Err(e) = self.validate(identifier, &value) {
            warn!(engine = %self.name, identifier = %identifier, error = %e, "Cached record no longer validates");
            return Err(e.into());
        }
        self.notify(identifier, ChangeKind::Reloaded);
        Ok(Some(value))
    }

    fn remove(&self, identifier: &Identifier) {
        if self.cache.remove(identifier).is_some() {
            self.notify(identifier, ChangeKind::Removed);
        }
    }

    /// Records produced while applying a live event, such as migrated
    /// siblings, are applied locally without being persisted.
    ///
    /// Records they produce in turn are applied too, for at most as many
    /// passes as startup replay runs.
    fn apply_local_additional(&self) {
        let queue = self.encoding.additional_events();
        for pass in 0..MIGRATION_PASSES {
            let extras = queue.drain();
            if extras.is_empty() {
                return;
            }
            debug!(engine = %self.name, pass, records = extras.len(), "Applying derived records");
            for extra in extras {
                if self.event_types.contains(&extra.event_type) {
                    self.apply_event(extra, false);
                } else {
                    warn!(
                        engine = %self.name,
                        event_type = %extra.event_type,
                        identifier = %extra.identifier,
                        "Ignoring derived record of a foreign event type"
                    );
                }
            }
        }
        let leftover = queue.drain();
        if !leftover.is_empty() {
            warn!(
                engine = %self.name,
                records = leftover.len(),
                "Dropping derived records still outdated after final pass"
            );
        }
    }

    fn report_failure(&self, event: &MutationEvent, error: &StoreError) {
        let diagnostic = if error.is_dropped_record() {
            DiagnosticEvent::RecordDropped {
                identifier: event.identifier.clone(),
                reason: error.to_string(),
            }
        } else {
            DiagnosticEvent::DecodeFailed {
                event_type: event.event_type.clone(),
                identifier: event.identifier.clone(),
                reason: error.to_string(),
            }
        };
        self.diagnostics.emit(diagnostic);
    }

    fn notify(&self, identifier: &Identifier, kind: ChangeKind) {
        // No receivers is fine.
        let _ = self.changes.send(CacheChange {
            identifier: identifier.clone(),
            kind,
        });
    }

    fn on_state_change(&self, change: &StateChangeEvent) {
        if !self.event_types.contains(&change.event_type) {
            return;
        }
        let all_listening = {
            let mut listening = self.listening.lock().unwrap_or_else(PoisonError::into_inner);
            match change.state {
                LifecycleState::Replaying => {
                    listening.remove(&change.event_type);
                }
                LifecycleState::Listening => {
                    listening.insert(change.event_type.clone());
                }
            }
            self.event_types.iter().all(|t| listening.contains(t))
        };
        if all_listening && !self.is_ready() {
            self.mark_ready();
        }
    }

    fn mark_ready(&self) {
        let callbacks = {
            let mut callbacks = self
                .ready_callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.ready_tx.send_replace(true);
            std::mem::take(&mut *callbacks)
        };
        info!(engine = %self.name, records = self.cache.len(), "Cache engine ready");
        for callback in callbacks {
            callback();
        }
    }

    fn on_reload(&self, filter: &EventFilter) {
        if !self.event_types.iter().any(|t| filter.matches_event_type(t)) {
            return;
        }
        for identifier in self.identifiers() {
            if filter.matches_identifier(&identifier) {
                // Failures are logged by revalidate.
                let _ = self.revalidate(&identifier);
            }
        }
    }
}

impl<T: CachedValue> IdentifierIndex for CacheEngine<T> {
    fn contains(&self, identifier: &Identifier) -> bool {
        self.has(identifier)
    }

    fn identifiers_under(&self, prefix: &[String]) -> Vec<Identifier> {
        let mut ids: Vec<Identifier> = self
            .cache
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }
}

impl<T: CachedValue> EventSubscriber for CacheEngine<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn event_types(&self) -> Vec<EventType> {
        self.event_types.clone()
    }

    fn on_event(&self, event: &StoreEvent) {
        match event {
            StoreEvent::Mutation(mutation) => self.apply_event(mutation.clone(), true),
            StoreEvent::Replay(mutation) => self.apply_event(mutation.clone(), false),
            StoreEvent::StateChange(change) => self.on_state_change(change),
            StoreEvent::Reload(reload) => self.on_reload(&reload.filter),
        }
    }

    fn take_additional_events(&self) -> Vec<MutationEvent> {
        self.encoding.additional_events().drain()
    }
}

#[async_trait]
impl<T: CachedValue> EntityStore<T> for CacheEngine<T> {
    fn get(&self, identifier: &Identifier) -> Option<T> {
        CacheEngine::get(self, identifier)
    }

    fn has(&self, identifier: &Identifier) -> bool {
        CacheEngine::has(self, identifier)
    }

    fn identifiers(&self) -> Vec<Identifier> {
        CacheEngine::identifiers(self)
    }

    async fn put(&self, identifier: Identifier, value: &T) -> StoreResult<PendingWrite<T>> {
        CacheEngine::put(self, identifier, value).await
    }

    async fn patch(
        &self,
        identifier: Identifier,
        partial: Document,
        key_path: &[String],
    ) -> StoreResult<PendingWrite<T>> {
        CacheEngine::patch(self, identifier, partial, key_path).await
    }

    async fn delete(&self, identifier: Identifier) -> StoreResult<PendingWrite<T>> {
        CacheEngine::delete(self, identifier).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::MergeMiddleware;
    use cairn_core::{CollectingDiagnostics, ReloadEvent};
    use cairn_events::{EventLogOptions, InMemoryLogDriver};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Provider {
        url: String,
        #[serde(default)]
        timeout: u32,
    }

    fn provider(url: &str, timeout: u32) -> Provider {
        Provider {
            url: url.to_string(),
            timeout,
        }
    }

    fn svc(id: &str) -> Identifier {
        Identifier::new(["providers"], id)
    }

    fn log_over(driver: Arc<InMemoryLogDriver>) -> Arc<EventLog> {
        Arc::new(EventLog::new(driver, EventLogOptions::default()))
    }

    fn engine(log: &Arc<EventLog>) -> Arc<CacheEngine<Provider>> {
        CacheEngine::builder("providers", log.clone())
            .event_type(EventType::entities())
            .encoding(ValueEncoding::new(Format::Yaml).with_middleware(MergeMiddleware))
            .build()
            .expect("build")
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let log = log_over(Arc::new(InMemoryLogDriver::new()));
        let engine = engine(&log);
        log.start().await.expect("start");

        let pending = engine.put(svc("svc1"), &provider("http://a", 5)).await.expect("put");
        assert_eq!(pending.await, Ok(Some(provider("http://a", 5))));
        assert_eq!(engine.get(&svc("svc1")), Some(provider("http://a", 5)));
        assert_eq!(engine.identifiers(), vec![svc("svc1")]);
    }

    #[tokio::test]
    async fn test_replay_materializes_history_before_ready() {
        let driver = Arc::new(InMemoryLogDriver::with_records([MutationEvent::write(
            EventType::entities(),
            svc("svc1"),
            b"url: http://replayed".to_vec(),
            Format::Yaml,
        )]));
        let log = log_over(driver);
        let engine = engine(&log);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        engine.on_ready(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!engine.is_ready());

        log.start().await.expect("start");
        engine.ready().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(engine.get(&svc("svc1")).map(|p| p.url), Some("http://replayed".to_string()));

        // Registered after ready: runs immediately.
        let counter = fired.clone();
        engine.on_ready(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_patch_merges_and_is_idempotent() {
        let log = log_over(Arc::new(InMemoryLogDriver::new()));
        let engine = engine(&log);
        log.start().await.expect("start");
        engine
            .put(svc("svc1"), &provider("http://a", 5))
            .await
            .expect("put")
            .await
            .expect("applied");

        for _ in 0..2 {
            let value = engine
                .patch(svc("svc1"), json!({"timeout": 30}), &[])
                .await
                .expect("patch")
                .await
                .expect("applied");
            assert_eq!(value, Some(provider("http://a", 30)));
        }
    }

    #[tokio::test]
    async fn test_delete_resolves_to_none() {
        let log = log_over(Arc::new(InMemoryLogDriver::new()));
        let engine = engine(&log);
        log.start().await.expect("start");
        engine
            .put(svc("svc1"), &provider("http://a", 5))
            .await
            .expect("put")
            .await
            .expect("applied");

        let deleted = engine.delete(svc("svc1")).await.expect("delete").await;
        assert_eq!(deleted, Ok(None));
        assert!(!engine.has(&svc("svc1")));
    }

    #[tokio::test]
    async fn test_null_payload_is_delete_sentinel() {
        let log = log_over(Arc::new(InMemoryLogDriver::new()));
        let engine = engine(&log);
        log.start().await.expect("start");
        engine
            .put(svc("svc1"), &provider("http://a", 5))
            .await
            .expect("put")
            .await
            .expect("applied");

        let outcome = engine
            .put_raw(svc("svc1"), b"null".to_vec(), Format::Json)
            .await
            .expect("put")
            .await;
        assert_eq!(outcome, Ok(None));
        assert!(engine.get(&svc("svc1")).is_none());
    }

    #[tokio::test]
    async fn test_validation_failure_rolls_back() {
        let diagnostics = CollectingDiagnostics::new();
        let log = log_over(Arc::new(InMemoryLogDriver::new()));
        let engine = CacheEngine::<Provider>::builder("providers", log.clone())
            .event_type(EventType::entities())
            .encoding(ValueEncoding::new(Format::Yaml).with_middleware(MergeMiddleware))
            .validator(Arc::new(|_id: &Identifier, p: &Provider| {
                if p.url.starts_with("http") {
                    Ok(())
                } else {
                    Err(ValidationError::InvalidValue {
                        field: "url".to_string(),
                        reason: "must be http".to_string(),
                    })
                }
            }))
            .diagnostics(Arc::new(diagnostics.clone()))
            .build()
            .expect("build");
        log.start().await.expect("start");
        engine
            .put(svc("svc1"), &provider("http://a", 5))
            .await
            .expect("put")
            .await
            .expect("applied");

        // Patches are checked before they are written.
        let rejected = engine.patch(svc("svc1"), json!({"url": "ftp://b"}), &[]).await;
        assert!(matches!(rejected, Err(StoreError::Validation(_))));

        // Raw writes are checked when applied, and rolled back.
        let outcome = engine
            .put_raw(svc("svc1"), b"url: ftp://b".to_vec(), Format::Yaml)
            .await
            .expect("persisted")
            .await;
        assert!(matches!(outcome, Err(StoreError::Validation(_))));
        assert_eq!(engine.get(&svc("svc1")), Some(provider("http://a", 5)));
        assert!(diagnostics
            .events()
            .iter()
            .any(|e| matches!(e, DiagnosticEvent::ValidationRolledBack { .. })));
    }

    #[tokio::test]
    async fn test_decode_failure_keeps_previous_value() {
        let log = log_over(Arc::new(InMemoryLogDriver::new()));
        let engine = engine(&log);
        log.start().await.expect("start");
        engine
            .put(svc("svc1"), &provider("http://a", 5))
            .await
            .expect("put")
            .await
            .expect("applied");

        let outcome = engine
            .put_raw(svc("svc1"), b"timeout: [1".to_vec(), Format::Yaml)
            .await
            .expect("persisted")
            .await;
        assert!(matches!(outcome, Err(StoreError::Decode(_))));
        assert_eq!(engine.get(&svc("svc1")), Some(provider("http://a", 5)));
    }

    #[tokio::test]
    async fn test_read_only_write_fails_synchronously() {
        let log = Arc::new(EventLog::new(
            Arc::new(InMemoryLogDriver::new()),
            EventLogOptions {
                read_only: true,
                persist_migrations: false,
            },
        ));
        let engine = engine(&log);
        log.start().await.expect("start");

        let err = engine.put(svc("svc1"), &provider("http://a", 5)).await.unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly { .. }));
        assert!(engine.get(&svc("svc1")).is_none());
    }

    #[tokio::test]
    async fn test_change_notifications() {
        let log = log_over(Arc::new(InMemoryLogDriver::new()));
        let engine = engine(&log);
        let mut changes = engine.changes();
        log.start().await.expect("start");

        engine
            .put(svc("svc1"), &provider("http://a", 5))
            .await
            .expect("put")
            .await
            .expect("applied");
        log.reload(EventFilter::all().with_ids(["svc1"]))
            .await
            .expect("reload");
        engine.delete(svc("svc1")).await.expect("delete").await.expect("applied");

        let kinds: Vec<ChangeKind> = std::iter::from_fn(|| changes.try_recv().ok())
            .map(|c| c.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Upserted, ChangeKind::Reloaded, ChangeKind::Removed]
        );
    }

    #[tokio::test]
    async fn test_rejected_value_is_never_visible() {
        let log = log_over(Arc::new(InMemoryLogDriver::new()));
        let slot: Arc<Mutex<Option<std::sync::Weak<CacheEngine<Provider>>>>> =
            Arc::new(Mutex::new(None));
        let seen: Arc<Mutex<Vec<Option<Provider>>>> = Arc::new(Mutex::new(Vec::new()));
        let (engine_slot, observed) = (slot.clone(), seen.clone());
        let engine = CacheEngine::<Provider>::builder("providers", log.clone())
            .event_type(EventType::entities())
            .encoding(ValueEncoding::new(Format::Yaml).with_middleware(MergeMiddleware))
            .validator(Arc::new(move |id: &Identifier, p: &Provider| {
                let cached = engine_slot
                    .lock()
                    .expect("lock")
                    .as_ref()
                    .and_then(|weak| weak.upgrade())
                    .and_then(|engine| engine.get(id));
                observed.lock().expect("lock").push(cached);
                if p.url.starts_with("http") {
                    Ok(())
                } else {
                    Err(ValidationError::InvalidValue {
                        field: "url".to_string(),
                        reason: "must be http".to_string(),
                    })
                }
            }))
            .build()
            .expect("build");
        *slot.lock().expect("lock") = Some(Arc::downgrade(&engine));
        log.start().await.expect("start");

        engine
            .put(svc("svc1"), &provider("http://a", 5))
            .await
            .expect("put")
            .await
            .expect("applied");
        let outcome = engine
            .put_raw(svc("svc1"), b"url: ftp://b".to_vec(), Format::Yaml)
            .await
            .expect("persisted")
            .await;
        assert!(matches!(outcome, Err(StoreError::Validation(_))));

        // While the bad value was validated, the cache still held the old one.
        let seen = seen.lock().expect("lock").clone();
        assert_eq!(seen.last(), Some(&Some(provider("http://a", 5))));
        assert_eq!(engine.get(&svc("svc1")), Some(provider("http://a", 5)));
    }

    /// Emits a record for `gen{n+1}` whenever `gen{n}` is decoded, up to `gen2`.
    struct Generations {
        queue: crate::encoding::AdditionalEvents,
    }

    impl crate::encoding::DecoderMiddleware for Generations {
        fn name(&self) -> &str {
            "generations"
        }

        fn apply(
            &self,
            ctx: &crate::encoding::DecodeContext<'_>,
            doc: Document,
        ) -> StoreResult<Document> {
            let next = ctx
                .identifier
                .id
                .strip_prefix("gen")
                .and_then(|n| n.parse::<u32>().ok())
                .filter(|n| *n < 2)
                .map(|n| n + 1);
            if let (false, Some(next)) = (ctx.preview, next) {
                self.queue.push([MutationEvent::write(
                    EventType::entities(),
                    svc(&format!("gen{next}")),
                    format!("url: http://gen{next}").into_bytes(),
                    Format::Yaml,
                )]);
            }
            Ok(doc)
        }
    }

    #[tokio::test]
    async fn test_live_write_applies_every_generation_of_derived_records() {
        let log = log_over(Arc::new(InMemoryLogDriver::new()));
        let encoding = ValueEncoding::new(Format::Yaml).with_middleware(MergeMiddleware);
        let queue = encoding.additional_events();
        let engine = CacheEngine::<Provider>::builder("providers", log.clone())
            .event_type(EventType::entities())
            .encoding(encoding.with_middleware(Generations { queue: queue.clone() }))
            .build()
            .expect("build");
        log.start().await.expect("start");

        engine
            .put(svc("gen0"), &provider("http://gen0", 0))
            .await
            .expect("put")
            .await
            .expect("applied");
        assert_eq!(engine.get(&svc("gen1")).map(|p| p.url), Some("http://gen1".to_string()));
        assert_eq!(engine.get(&svc("gen2")).map(|p| p.url), Some("http://gen2".to_string()));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_reload_skips_foreign_event_types() {
        let log = log_over(Arc::new(InMemoryLogDriver::new()));
        let engine = engine(&log);
        let mut changes = engine.changes();
        log.start().await.expect("start");
        engine
            .put(svc("svc1"), &provider("http://a", 5))
            .await
            .expect("put")
            .await
            .expect("applied");
        let _ = changes.try_recv();

        engine.on_event(&StoreEvent::Reload(ReloadEvent {
            filter: EventFilter::all().with_event_types(["defaults"]),
        }));
        assert!(changes.try_recv().is_err());
    }
}
