//! Event log facade.
//!
//! The single point of truth for "what happened, in order". The facade owns
//! the log driver, the subscriber registry and the read-only gate:
//!
//! ```text
//! start():  driver.replay() ─▶ sort by identifier ─▶ subscribers (Replay)
//!                              migrations ───────▶ subscribers (Replay)
//!                              per type ─────────▶ subscribers (LISTENING)
//! push():   read-only gate ─▶ driver.append/delete ─▶ subscribers (Mutation)
//! ```
//!
//! Subscribers only ever see an event after the driver accepted it.

use crate::{EventSubscriber, LogDriver};
use cairn_core::{
    DiagnosticEvent, DiagnosticSink, EventFilter, EventType, LifecycleState, LogError,
    MutationEvent, ReloadEvent, StateChangeEvent, StoreConfig, StoreError, StoreEvent,
    StoreResult, TracingDiagnostics,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Number of times migration output is drained and replayed at startup.
pub const MIGRATION_PASSES: usize = 2;

/// Options controlling the facade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventLogOptions {
    /// Reject every write before it reaches the driver.
    pub read_only: bool,
    /// Append migrated records to the driver during startup.
    pub persist_migrations: bool,
}

impl From<&StoreConfig> for EventLogOptions {
    fn from(config: &StoreConfig) -> Self {
        Self {
            read_only: config.read_only,
            persist_migrations: config.persist_migrations,
        }
    }
}

/// Event log facade: append, replay-on-start, fan-out and the read-only gate.
pub struct EventLog {
    driver: Arc<dyn LogDriver>,
    options: EventLogOptions,
    /// Held weakly so engines holding the log do not form a cycle with it.
    subscribers: RwLock<Vec<Weak<dyn EventSubscriber>>>,
    /// Serializes starts, pushes and reloads into one ordered stream.
    write_lock: Mutex<()>,
    listening: AtomicBool,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl EventLog {
    /// Create a facade over a driver.
    pub fn new(driver: Arc<dyn LogDriver>, options: EventLogOptions) -> Self {
        Self {
            driver,
            options,
            subscribers: RwLock::new(Vec::new()),
            write_lock: Mutex::new(()),
            listening: AtomicBool::new(false),
            diagnostics: Arc::new(TracingDiagnostics),
        }
    }

    /// Create a facade configured from a [`StoreConfig`].
    pub fn from_config(driver: Arc<dyn LogDriver>, config: &StoreConfig) -> Self {
        Self::new(driver, EventLogOptions::from(config))
    }

    /// Replace the diagnostics sink.
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    /// Whether startup replay has completed.
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Register a subscriber. A subscriber with the same name is replaced.
    ///
    /// The log keeps only a weak reference; the caller owns the subscriber.
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|s| {
            s.upgrade()
                .is_some_and(|live| live.name() != subscriber.name())
        });
        debug!(subscriber = subscriber.name(), "Registered subscriber");
        subscribers.push(Arc::downgrade(&subscriber));
    }

    /// Deregister a subscriber by name. Returns whether one was removed.
    pub fn unsubscribe(&self, name: &str) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        subscribers.retain(|s| match s.upgrade() {
            Some(live) if live.name() == name => {
                removed = true;
                false
            }
            Some(_) => true,
            None => false,
        });
        removed
    }

    /// Distinct event types of all registered subscribers, sorted.
    pub fn event_types(&self) -> Vec<EventType> {
        let types: BTreeSet<EventType> = self
            .snapshot()
            .iter()
            .flat_map(|s| s.event_types())
            .collect();
        types.into_iter().collect()
    }

    /// Replay the full history through every subscriber, then flip to
    /// listening. Calling `start` again once listening is a no-op.
    pub async fn start(&self) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        if self.is_listening() {
            return Ok(());
        }

        self.driver.start().await?;
        let event_types = self.event_types();
        for event_type in &event_types {
            self.change_state(event_type, LifecycleState::Replaying);
        }

        let mut history = self.driver.replay().await?;
        sort_for_replay(&mut history);
        info!(records = history.len(), "Replaying event log");
        for event in history {
            self.deliver(&StoreEvent::Replay(event));
        }

        for pass in 0..MIGRATION_PASSES {
            let mut additional = self.drain_additional_events();
            if additional.is_empty() {
                break;
            }
            sort_for_replay(&mut additional);
            info!(pass, records = additional.len(), "Replaying migrated records");
            for event in additional {
                if self.options.persist_migrations && !self.options.read_only {
                    self.persist(&event).await?;
                }
                self.deliver(&StoreEvent::Replay(event));
            }
        }

        let leftover = self.drain_additional_events();
        if !leftover.is_empty() {
            warn!(
                records = leftover.len(),
                "Dropping migrated records still outdated after final migration pass"
            );
        }

        for event_type in &event_types {
            self.change_state(event_type, LifecycleState::Listening);
        }
        self.listening.store(true, Ordering::Release);
        Ok(())
    }

    /// Persist an event and, only once persisted, fan it out.
    ///
    /// # Errors
    ///
    /// - [`StoreError::ReadOnly`] if the store is read-only
    /// - [`StoreError::NotReady`] before `start` completed
    /// - driver errors, in which case no subscriber sees the event
    pub async fn push(&self, event: MutationEvent) -> StoreResult<()> {
        if self.options.read_only {
            let operation = if event.is_delete() { "delete" } else { "append" };
            return Err(StoreError::ReadOnly {
                operation: operation.to_string(),
            });
        }
        if !self.is_listening() {
            return Err(StoreError::NotReady);
        }

        let _guard = self.write_lock.lock().await;
        self.persist(&event).await?;
        debug!(
            event_type = %event.event_type,
            identifier = %event.identifier,
            deleted = event.is_delete(),
            "Event persisted"
        );
        self.deliver(&StoreEvent::Mutation(event));
        Ok(())
    }

    /// Ask subscribers to re-validate the records matching `filter`.
    ///
    /// Nothing is written, so this is allowed in read-only mode.
    pub async fn reload(&self, filter: EventFilter) -> StoreResult<()> {
        if !self.is_listening() {
            return Err(StoreError::NotReady);
        }
        let _guard = self.write_lock.lock().await;
        self.deliver(&StoreEvent::Reload(ReloadEvent { filter }));
        Ok(())
    }

    async fn persist(&self, event: &MutationEvent) -> StoreResult<()> {
        if event.is_delete() {
            self.driver
                .delete(&event.event_type, &event.identifier, event.format)
                .await
        } else if event.is_touch() {
            Err(LogError::Rejected {
                event_type: event.event_type.clone(),
                identifier: event.identifier.clone(),
                reason: "event carries neither a payload nor a delete flag".to_string(),
            }
            .into())
        } else {
            self.driver.append(event).await
        }
    }

    fn change_state(&self, event_type: &EventType, state: LifecycleState) {
        self.diagnostics.emit(DiagnosticEvent::StateChanged {
            event_type: event_type.clone(),
            state,
        });
        self.deliver(&StoreEvent::StateChange(StateChangeEvent {
            event_type: event_type.clone(),
            state,
        }));
    }

    fn deliver(&self, event: &StoreEvent) {
        for subscriber in self.snapshot() {
            if subscriber.wants(event) {
                subscriber.on_event(event);
            }
        }
    }

    fn drain_additional_events(&self) -> Vec<MutationEvent> {
        self.snapshot()
            .iter()
            .flat_map(|s| s.take_additional_events())
            .collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn EventSubscriber>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

/// Replay order: identifier first, event type second. The sort is stable,
/// so equal keys keep log order.
fn sort_for_replay(events: &mut [MutationEvent]) {
    events.sort_by(|a, b| {
        a.identifier
            .cmp(&b.identifier)
            .then_with(|| a.event_type.cmp(&b.event_type))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryLogDriver;
    use async_trait::async_trait;
    use cairn_core::{Format, Identifier};
    use std::sync::Mutex as StdMutex;

    /// Subscriber recording every event it receives.
    struct Recorder {
        name: String,
        types: Vec<EventType>,
        seen: StdMutex<Vec<StoreEvent>>,
        additional: StdMutex<Vec<MutationEvent>>,
    }

    impl Recorder {
        fn new(name: &str, types: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                types: types.iter().map(|t| EventType::new(*t)).collect(),
                seen: StdMutex::new(Vec::new()),
                additional: StdMutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<StoreEvent> {
            self.seen.lock().expect("lock").clone()
        }
    }

    impl EventSubscriber for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn event_types(&self) -> Vec<EventType> {
            self.types.clone()
        }

        fn on_event(&self, event: &StoreEvent) {
            self.seen.lock().expect("lock").push(event.clone());
        }

        fn take_additional_events(&self) -> Vec<MutationEvent> {
            std::mem::take(&mut *self.additional.lock().expect("lock"))
        }
    }

    /// Driver whose writes always fail.
    struct BrokenDriver;

    #[async_trait]
    impl LogDriver for BrokenDriver {
        async fn replay(&self) -> StoreResult<Vec<MutationEvent>> {
            Ok(Vec::new())
        }

        async fn append(&self, event: &MutationEvent) -> StoreResult<()> {
            Err(LogError::Io {
                location: event.identifier.as_path(),
                reason: "disk full".to_string(),
            }
            .into())
        }

        async fn delete(
            &self,
            _event_type: &EventType,
            identifier: &Identifier,
            _format: Format,
        ) -> StoreResult<()> {
            Err(LogError::Io {
                location: identifier.as_path(),
                reason: "disk full".to_string(),
            }
            .into())
        }
    }

    fn write(event_type: &str, id: &str) -> MutationEvent {
        MutationEvent::write(
            EventType::new(event_type),
            Identifier::new(["providers"], id),
            b"{}".to_vec(),
            Format::Json,
        )
    }

    #[tokio::test]
    async fn test_start_replays_in_identifier_order_then_listens() {
        let driver = InMemoryLogDriver::new();
        driver.append(&write("entities", "b")).await.expect("append");
        driver.append(&write("entities", "a")).await.expect("append");
        let log = EventLog::new(Arc::new(driver), EventLogOptions::default());
        let recorder = Recorder::new("entities", &["entities"]);
        log.subscribe(recorder.clone());

        log.start().await.expect("start");
        assert!(log.is_listening());

        let seen = recorder.seen();
        assert_eq!(seen.len(), 4);
        assert!(matches!(
            &seen[0],
            StoreEvent::StateChange(StateChangeEvent { state: LifecycleState::Replaying, .. })
        ));
        assert_eq!(seen[1].mutation().map(|e| e.identifier.id.as_str()), Some("a"));
        assert_eq!(seen[2].mutation().map(|e| e.identifier.id.as_str()), Some("b"));
        assert!(matches!(
            &seen[3],
            StoreEvent::StateChange(StateChangeEvent { state: LifecycleState::Listening, .. })
        ));
    }

    #[tokio::test]
    async fn test_push_before_start_is_rejected() {
        let log = EventLog::new(Arc::new(InMemoryLogDriver::new()), EventLogOptions::default());
        let err = log.push(write("entities", "a")).await.unwrap_err();
        assert_eq!(err, StoreError::NotReady);
    }

    #[tokio::test]
    async fn test_read_only_rejects_before_driver() {
        let driver = Arc::new(InMemoryLogDriver::new());
        let log = EventLog::new(
            driver.clone(),
            EventLogOptions {
                read_only: true,
                persist_migrations: false,
            },
        );
        log.start().await.expect("start");

        let err = log.push(write("entities", "a")).await.unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly { .. }));
        assert!(driver.is_empty().await);

        // Reload does not write, so it is still allowed.
        log.reload(EventFilter::all()).await.expect("reload");
    }

    #[tokio::test]
    async fn test_failed_persistence_is_not_fanned_out() {
        let log = EventLog::new(Arc::new(BrokenDriver), EventLogOptions::default());
        let recorder = Recorder::new("entities", &["entities"]);
        log.subscribe(recorder.clone());
        log.start().await.expect("start");
        let before = recorder.seen().len();

        let err = log.push(write("entities", "a")).await.unwrap_err();
        assert!(matches!(err, StoreError::Log(LogError::Io { .. })));
        assert_eq!(recorder.seen().len(), before);
    }

    #[tokio::test]
    async fn test_fan_out_respects_event_types() {
        let log = EventLog::new(Arc::new(InMemoryLogDriver::new()), EventLogOptions::default());
        let entities = Recorder::new("entities", &["entities", "overrides"]);
        let defaults = Recorder::new("defaults", &["defaults"]);
        log.subscribe(entities.clone());
        log.subscribe(defaults.clone());
        log.start().await.expect("start");
        assert_eq!(
            log.event_types(),
            vec![
                EventType::defaults(),
                EventType::entities(),
                EventType::overrides()
            ]
        );

        log.push(write("defaults", "a")).await.expect("push");
        log.reload(EventFilter::all()).await.expect("reload");

        let defaults_seen = defaults.seen();
        assert!(defaults_seen
            .iter()
            .any(|e| matches!(e, StoreEvent::Mutation(m) if m.event_type == EventType::defaults())));
        assert!(!entities
            .seen()
            .iter()
            .any(|e| matches!(e, StoreEvent::Mutation(_))));
        assert!(matches!(entities.seen().last(), Some(StoreEvent::Reload(_))));
        assert!(matches!(defaults_seen.last(), Some(StoreEvent::Reload(_))));
    }

    #[tokio::test]
    async fn test_additional_events_replayed_and_optionally_persisted() {
        let driver = Arc::new(InMemoryLogDriver::new());
        let log = EventLog::new(
            driver.clone(),
            EventLogOptions {
                read_only: false,
                persist_migrations: true,
            },
        );
        let recorder = Recorder::new("entities", &["entities"]);
        recorder
            .additional
            .lock()
            .expect("lock")
            .push(write("entities", "migrated"));
        log.subscribe(recorder.clone());

        log.start().await.expect("start");

        assert!(recorder
            .seen()
            .iter()
            .any(|e| e.is_replay() && e.mutation().map(|m| m.identifier.id.as_str()) == Some("migrated")));
        assert_eq!(driver.len().await, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let log = EventLog::new(Arc::new(InMemoryLogDriver::new()), EventLogOptions::default());
        let recorder = Recorder::new("entities", &["entities"]);
        log.subscribe(recorder.clone());
        assert!(log.unsubscribe("entities"));
        assert!(!log.unsubscribe("entities"));
        log.start().await.expect("start");
        assert!(recorder.seen().is_empty());
    }
}
