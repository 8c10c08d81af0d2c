use serde::Serialize;
use tokio::sync::broadcast;

use souk_shared::constants::EVENT_QUEUE_CAPACITY;
use souk_shared::{ConnectionState, RoomId};

use crate::effects::Toast;
use crate::notifications::NotificationKind;

/// Events pushed to the rendering layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum UiEvent {
    /// Drives the passive "disconnected" indicator.
    ConnectionStateChanged { state: ConnectionState },
    /// Per-row online dots should re-read presence.
    PresenceChanged { online: usize },
    NotificationReceived {
        id: String,
        kind: NotificationKind,
        unread: usize,
    },
    UnreadReset,
    /// The message stream of `room` changed.
    ChatUpdated { room: RoomId },
    ToastRaised { toast: Toast },
}

/// Broadcast bus of [`UiEvent`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UiEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_QUEUE_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }

    /// Publish to every current subscriber. Never fails the caller.
    pub fn emit_event(&self, event: UiEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::trace!(event = ?e.0, "No UI subscribers, event dropped");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
