//! Pending writes.
//!
//! A write returns once its event is durable; the decoded value arrives
//! later, when the engine applies the emitted event. Each pending write is
//! tagged with the id of the event it waits for, so overlapping writes to one
//! identifier resolve independently and in emission order.

use cairn_core::{Identifier, StoreError, StoreResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use uuid::Uuid;

type Outcome<T> = StoreResult<Option<T>>;

/// Future resolving to the value materialized by a write.
///
/// Resolves to `Ok(None)` for deletes, to the decode or validation error if
/// the emitted event could not be applied, and to
/// [`StoreError::WriteAbandoned`] if the engine went away first.
#[derive(Debug)]
#[must_use = "a pending write does nothing unless awaited or dropped deliberately"]
pub struct PendingWrite<T> {
    identifier: Identifier,
    event_id: Uuid,
    receiver: oneshot::Receiver<Outcome<T>>,
}

impl<T> PendingWrite<T> {
    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// Id of the event this write waits for.
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }
}

impl<T> Future for PendingWrite<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(StoreError::WriteAbandoned {
                identifier: this.identifier.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Per-identifier queues of writes awaiting their event.
#[derive(Debug)]
pub(crate) struct PendingWrites<T> {
    queues: DashMap<Identifier, VecDeque<(Uuid, oneshot::Sender<Outcome<T>>)>>,
}

impl<T> Default for PendingWrites<T> {
    fn default() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }
}

impl<T> PendingWrites<T> {
    /// Register a write before its event is pushed.
    pub(crate) fn register(&self, identifier: Identifier, event_id: Uuid) -> PendingWrite<T> {
        let (sender, receiver) = oneshot::channel();
        self.queues
            .entry(identifier.clone())
            .or_default()
            .push_back((event_id, sender));
        PendingWrite {
            identifier,
            event_id,
            receiver,
        }
    }

    /// Resolve the write waiting for `event_id`. Returns whether one was.
    pub(crate) fn resolve(&self, identifier: &Identifier, event_id: Uuid, outcome: Outcome<T>) -> bool {
        let Some(sender) = self.take(identifier, event_id) else {
            return false;
        };
        // The caller may have dropped the future; that is not an error.
        let _ = sender.send(outcome);
        true
    }

    /// Forget a write whose event was never persisted.
    pub(crate) fn discard(&self, identifier: &Identifier, event_id: Uuid) {
        self.take(identifier, event_id);
    }

    /// Number of unresolved writes for an identifier.
    pub(crate) fn len(&self, identifier: &Identifier) -> usize {
        self.queues.get(identifier).map(|q| q.len()).unwrap_or(0)
    }

    fn take(&self, identifier: &Identifier, event_id: Uuid) -> Option<oneshot::Sender<Outcome<T>>> {
        let Entry::Occupied(mut entry) = self.queues.entry(identifier.clone()) else {
            return None;
        };
        let queue = entry.get_mut();
        let position = queue.iter().position(|(id, _)| *id == event_id)?;
        let (_, sender) = queue.remove(position)?;
        if queue.is_empty() {
            entry.remove();
        }
        Some(sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident() -> Identifier {
        Identifier::new(["providers"], "svc1")
    }

    #[tokio::test]
    async fn test_overlapping_writes_resolve_independently() {
        let pending: PendingWrites<u32> = PendingWrites::default();
        let first_id = Uuid::now_v7();
        let second_id = Uuid::now_v7();
        let first = pending.register(ident(), first_id);
        let second = pending.register(ident(), second_id);
        assert_eq!(pending.len(&ident()), 2);

        assert!(pending.resolve(&ident(), second_id, Ok(Some(2))));
        assert!(pending.resolve(&ident(), first_id, Ok(Some(1))));
        assert_eq!(pending.len(&ident()), 0);

        assert_eq!(first.await, Ok(Some(1)));
        assert_eq!(second.await, Ok(Some(2)));
    }

    #[tokio::test]
    async fn test_unknown_event_resolves_nothing() {
        let pending: PendingWrites<u32> = PendingWrites::default();
        let write = pending.register(ident(), Uuid::now_v7());
        assert!(!pending.resolve(&ident(), Uuid::now_v7(), Ok(Some(9))));
        assert_eq!(pending.len(&ident()), 1);
        drop(write);
    }

    #[tokio::test]
    async fn test_dropped_sender_reports_abandoned_write() {
        let pending: PendingWrites<u32> = PendingWrites::default();
        let event_id = Uuid::now_v7();
        let write = pending.register(ident(), event_id);
        pending.discard(&ident(), event_id);
        assert_eq!(
            write.await,
            Err(StoreError::WriteAbandoned {
                identifier: ident()
            })
        );
    }
}
