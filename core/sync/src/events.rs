//! Typed notifications for UI badges, toasts and audit views.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::connectivity::ConnectivityState;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Event published by the sync engine.
///
/// Payloads are advisory. Consumers should re-read the authoritative
/// queue length rather than accumulate deltas; a subscriber that falls
/// behind loses the oldest events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SyncEvent {
    /// The queue length changed.
    QueueChanged { length: usize },
    /// A replay or resolution left the queue empty.
    SyncComplete,
    /// A replay produced conflicts; `count` is the total pending.
    ConflictsPending { count: usize },
    /// The connectivity monitor observed a transition.
    ConnectivityChanged { state: ConnectivityState },
}

impl SyncEvent {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::QueueChanged { .. } => "queue-changed",
            SyncEvent::SyncComplete => "sync-complete",
            SyncEvent::ConflictsPending { .. } => "conflicts-pending",
            SyncEvent::ConnectivityChanged { .. } => "connectivity-changed",
        }
    }
}

/// Publish point for [`SyncEvent`]s.
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to current subscribers.
    ///
    /// # Returns
    /// Number of subscribers that received it.
    pub fn publish(&self, event: SyncEvent) -> usize {
        trace!("Publishing {}", event.name());
        // No subscribers is fine
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
