//! Store events and the subscription channel that carries them.
//!
//! Events are published after an operation has settled. Publishing never
//! fails the operation: with no subscribers the event is simply dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{MemoryId, SessionId};

/// Something observable that happened inside the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StoreEvent {
    /// A session was opened.
    SessionCreated {
        /// The new session.
        session_id: SessionId,
    },
    /// A session was closed.
    SessionClosed {
        /// The closed session.
        session_id: SessionId,
    },
    /// A memory was written to one or more backends.
    MemoryStored {
        /// The stored memory.
        memory_id: MemoryId,
        /// Session the write was issued under.
        session_id: SessionId,
        /// Backends that hold the memory, in write order.
        backends: Vec<String>,
    },
    /// A retrieval returned a page of results.
    MemoryRetrieved {
        /// Session the query was issued under.
        session_id: SessionId,
        /// Records in the returned page.
        returned: usize,
        /// Matching records before pagination.
        total_count: usize,
    },
    /// A memory was updated.
    MemoryUpdated {
        /// The updated memory.
        memory_id: MemoryId,
        /// Backends that applied the update.
        backends: Vec<String>,
    },
    /// A memory was deleted.
    MemoryDeleted {
        /// The deleted memory.
        memory_id: MemoryId,
        /// Backends that removed it.
        backends: Vec<String>,
    },
    /// A consolidation pass finished on a backend.
    Consolidated {
        /// Backend that was consolidated.
        backend: String,
        /// Records considered.
        examined: usize,
        /// Records folded into another.
        folded: usize,
    },
    /// Every backend was closed.
    BackendsClosed {
        /// Backends that were closed.
        backends: Vec<String>,
    },
}

/// Fan-out channel for [`StoreEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per lagging subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to current subscribers.
    pub fn publish(&self, event: StoreEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("no event subscribers");
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(StoreEvent::SessionCreated {
            session_id: SessionId::new(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let session_id = SessionId::new();
        bus.publish(StoreEvent::SessionCreated { session_id });
        bus.publish(StoreEvent::SessionClosed { session_id });

        assert_eq!(
            rx.recv().await.expect("first"),
            StoreEvent::SessionCreated { session_id }
        );
        assert_eq!(
            rx.recv().await.expect("second"),
            StoreEvent::SessionClosed { session_id }
        );
    }
}
