//! Diagnostic events emitted by the store.
//!
//! Engines never log directly for record-level failures; they report a
//! [`DiagnosticEvent`] to a [`DiagnosticSink`]. The default sink forwards
//! everything to `tracing`.

use crate::{EventType, Identifier, LifecycleState};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Something worth reporting that does not fail the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    /// A record could not be decoded; the previous value was kept.
    DecodeFailed {
        event_type: EventType,
        identifier: Identifier,
        reason: String,
    },
    /// A decode failure was recovered by a recoverable middleware stage.
    DecodeRecovered {
        identifier: Identifier,
        stage: String,
    },
    /// A decoded value failed validation and the cache was rolled back.
    ValidationRolledBack {
        identifier: Identifier,
        reason: String,
    },
    /// A record disagreed with its physical location and was ignored.
    RecordDropped {
        identifier: Identifier,
        reason: String,
    },
    /// Schema migration produced additional records.
    Migrated {
        identifier: Identifier,
        from_version: u32,
        to_version: u32,
        produced: usize,
    },
    /// An event type changed lifecycle state.
    StateChanged {
        event_type: EventType,
        state: LifecycleState,
    },
}

/// Collaborator receiving diagnostic events.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, event: DiagnosticEvent);
}

/// Sink that writes every event to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn emit(&self, event: DiagnosticEvent) {
        match event {
            DiagnosticEvent::DecodeFailed {
                event_type,
                identifier,
                reason,
            } => {
                warn!(event_type = %event_type, identifier = %identifier, reason = %reason, "Failed to decode record, keeping previous value");
            }
            DiagnosticEvent::DecodeRecovered { identifier, stage } => {
                info!(identifier = %identifier, stage = %stage, "Recovered record after decode failure");
            }
            DiagnosticEvent::ValidationRolledBack { identifier, reason } => {
                warn!(identifier = %identifier, reason = %reason, "Record failed validation, rolled back");
            }
            DiagnosticEvent::RecordDropped { identifier, reason } => {
                warn!(identifier = %identifier, reason = %reason, "Dropped record");
            }
            DiagnosticEvent::Migrated {
                identifier,
                from_version,
                to_version,
                produced,
            } => {
                info!(
                    identifier = %identifier,
                    from_version,
                    to_version,
                    produced,
                    "Migrated record"
                );
            }
            DiagnosticEvent::StateChanged { event_type, state } => {
                debug!(event_type = %event_type, state = ?state, "Event type changed state");
            }
        }
    }
}

/// Sink that keeps every event in memory, for assertions in tests.
#[derive(Debug, Clone, Default)]
pub struct CollectingDiagnostics {
    events: Arc<Mutex<Vec<DiagnosticEvent>>>,
}

impl CollectingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events collected so far.
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl DiagnosticSink for CollectingDiagnostics {
    fn emit(&self, event: DiagnosticEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
