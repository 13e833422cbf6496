//! Durable log driver contract.
//!
//! A driver persists raw mutation events and replays them in order. It knows
//! nothing about decoding, caching or subscribers; the event log facade owns
//! all of that.

use async_trait::async_trait;
use cairn_core::{EventType, Format, Identifier, LogError, MutationEvent, StoreResult};
use tokio::sync::RwLock;

/// Trait for durable log drivers.
///
/// Implementations must be safe to share across tasks. The facade guarantees
/// a single writer: `append` and `delete` are never called concurrently.
///
/// A driver may compact its history, as long as replaying the compacted
/// history materializes the same records as replaying every appended event.
#[async_trait]
pub trait LogDriver: Send + Sync {
    /// Prepare the driver before the first replay.
    async fn start(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Every previously appended record, in log order.
    ///
    /// Replay is not resumable; a failed replay requires a full restart.
    async fn replay(&self) -> StoreResult<Vec<MutationEvent>>;

    /// Persist a write.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Io`] if the event could not be made durable.
    async fn append(&self, event: &MutationEvent) -> StoreResult<()>;

    /// Persist a delete.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Io`] if the delete could not be made durable.
    async fn delete(
        &self,
        event_type: &EventType,
        identifier: &Identifier,
        format: Format,
    ) -> StoreResult<()>;
}

/// In-memory log driver.
///
/// An append-only sequence: every write and every delete is kept and
/// replayed in append order. Uses `tokio::sync::RwLock` for safe async
/// access.
#[derive(Debug, Default)]
pub struct InMemoryLogDriver {
    events: RwLock<Vec<MutationEvent>>,
}

impl InMemoryLogDriver {
    /// Create an empty driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a driver pre-populated with events, as if appended in order.
    pub fn with_records(events: impl IntoIterator<Item = MutationEvent>) -> Self {
        Self {
            events: RwLock::new(events.into_iter().collect()),
        }
    }

    /// Number of events appended so far, deletes included.
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    /// Whether nothing was appended yet.
    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    /// The most recent event for a key, if any.
    pub async fn latest(
        &self,
        event_type: &EventType,
        identifier: &Identifier,
    ) -> Option<MutationEvent> {
        self.events
            .read()
            .await
            .iter()
            .rev()
            .find(|e| e.event_type == *event_type && e.identifier == *identifier)
            .cloned()
    }
}

#[async_trait]
impl LogDriver for InMemoryLogDriver {
    async fn replay(&self) -> StoreResult<Vec<MutationEvent>> {
        Ok(self.events.read().await.clone())
    }

    async fn append(&self, event: &MutationEvent) -> StoreResult<()> {
        if event.payload.is_none() {
            return Err(LogError::Rejected {
                event_type: event.event_type.clone(),
                identifier: event.identifier.clone(),
                reason: "append requires a payload".to_string(),
            }
            .into());
        }
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn delete(
        &self,
        event_type: &EventType,
        identifier: &Identifier,
        format: Format,
    ) -> StoreResult<()> {
        self.events.write().await.push(MutationEvent::delete(
            event_type.clone(),
            identifier.clone(),
            format,
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(id: &str, body: &str) -> MutationEvent {
        MutationEvent::write(
            EventType::entities(),
            Identifier::new(["providers"], id),
            body.as_bytes().to_vec(),
            Format::Yaml,
        )
    }

    #[tokio::test]
    async fn test_append_keeps_every_event_in_order() {
        let driver = InMemoryLogDriver::new();
        driver.append(&write("svc1", "a: 1")).await.expect("append");
        driver.append(&write("svc1", "a: 2")).await.expect("append");
        driver.append(&write("svc0", "a: 0")).await.expect("append");

        let replayed = driver.replay().await.expect("replay");
        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[0].payload.as_deref(), Some(b"a: 1".as_slice()));
        assert_eq!(replayed[2].identifier.id, "svc0");
    }

    #[tokio::test]
    async fn test_delete_is_appended_as_tombstone() {
        let driver = InMemoryLogDriver::with_records([write("svc1", "a: 1")]);
        let ident = Identifier::new(["providers"], "svc1");
        driver
            .delete(&EventType::entities(), &ident, Format::Yaml)
            .await
            .expect("delete");
        assert_eq!(driver.len().await, 2);
        let latest = driver
            .latest(&EventType::entities(), &ident)
            .await
            .expect("latest");
        assert!(latest.is_delete());
    }

    #[tokio::test]
    async fn test_append_rejects_missing_payload() {
        let driver = InMemoryLogDriver::new();
        let event = MutationEvent::delete(
            EventType::entities(),
            Identifier::new(["providers"], "svc1"),
            Format::Yaml,
        );
        assert!(driver.append(&event).await.is_err());
    }
}
