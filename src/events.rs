//! Process-wide event channel.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::session::SessionId;

/// Default number of buffered events per subscriber.
pub const DEFAULT_CAPACITY: usize = 256;

/// Why a session left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Closed by its last holder or removed explicitly.
    Closed,
    /// Idle or lifetime limit exceeded.
    Expired,
    /// The reload strategy dropped it.
    Evicted,
}

/// Notifications exchanged between the registry and other subsystems.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A session left the registry.
    Removed {
        id: SessionId,
        token: String,
        reason: RemovalReason,
    },
    /// A lookup found a session past its limits.
    Stale { id: SessionId, token: String },
    /// Upstream identity data (users, groups, roles) changed.
    IdentityChanged,
}

/// Broadcast channel shared by every subsystem that cares about sessions.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: SessionEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("session event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
