//! Subscriber contract.

use cairn_core::{EventType, MutationEvent, StoreEvent};

/// Receiver of fanned-out events.
///
/// The facade delivers events to one subscriber sequentially, in append
/// order (replay order during startup), so implementations never see two
/// events at once.
pub trait EventSubscriber: Send + Sync {
    /// Name used for registration and diagnostics. Must be unique per log.
    fn name(&self) -> &str;

    /// Event types this subscriber consumes. Reload events are delivered to
    /// every subscriber regardless.
    fn event_types(&self) -> Vec<EventType>;

    /// Handle one event. Record-level failures are handled internally.
    fn on_event(&self, event: &StoreEvent);

    /// Events produced while decoding replayed records (schema migration)
    /// that must be replayed before startup completes. Draining.
    fn take_additional_events(&self) -> Vec<MutationEvent> {
        Vec::new()
    }

    /// Whether this subscriber consumes the given event.
    fn wants(&self, event: &StoreEvent) -> bool {
        match event.event_type() {
            Some(event_type) => self.event_types().contains(event_type),
            None => true,
        }
    }
}
