//! Session lifecycle.
//!
//! A [`Session`] is the only owner of the [`ConnectionManager`]: it opens the
//! connection at sign-in, reopens it on an identity switch and closes it at
//! sign-out. Presence, notifications and chat are consumers that only ever
//! see a [`ConnectionHandle`].

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use souk_net::{ConnectionHandle, ConnectionManager, Connector, PresenceTracker, WsConnector};
use souk_shared::{ConnectionState, Identity};

use crate::api::{ChatApi, HttpChatApi};
use crate::chat::ChatHub;
use crate::config::ClientConfig;
use crate::effects::SideEffects;
use crate::events::{EventBus, UiEvent};
use crate::notifications::{DeliveryLedger, NotificationRouter};

/// Builds the REST collaborator for a signed-in identity.
pub type ChatApiFactory = Arc<dyn Fn(&Identity) -> Arc<dyn ChatApi> + Send + Sync>;

/// External collaborators a session is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub chat_api: ChatApiFactory,
    pub effects: SideEffects,
}

impl Collaborators {
    /// WebSocket hub, HTTP backend and log-only side effects.
    pub fn from_config(config: &ClientConfig) -> Self {
        let api_url = config.api_url.clone();
        Self {
            connector: Arc::new(WsConnector::new(config.socket_url.clone())),
            chat_api: Arc::new(move |identity: &Identity| {
                Arc::new(HttpChatApi::new(api_url.clone(), identity.token.clone()))
                    as Arc<dyn ChatApi>
            }),
            effects: SideEffects::logging(),
        }
    }
}

/// Identity-scoped consumers, rebuilt on every identity switch.
struct Consumers {
    presence: PresenceTracker,
    router: NotificationRouter,
    chat: ChatHub,
    tasks: Vec<JoinHandle<()>>,
}

impl Consumers {
    /// Subscribe every consumer to the current connection generation.
    fn spawn(
        connection: &ConnectionHandle,
        identity: &Identity,
        config: &ClientConfig,
        collaborators: &Collaborators,
        ledger: &DeliveryLedger,
        bus: &EventBus,
    ) -> Self {
        let (presence, presence_task) = PresenceTracker::spawn(connection);

        let router = NotificationRouter::new(
            collaborators.effects.clone(),
            ledger.clone(),
            bus.clone(),
            config.sound_path.clone(),
            config.notification_log_cap,
        );
        let router_task = router.spawn(connection);

        let chat = ChatHub::new(
            connection.clone(),
            (collaborators.chat_api)(identity),
            identity.user_id.clone(),
            bus.clone(),
        );

        let state_task = tokio::spawn(forward_connection_state(
            connection.watch_state(),
            bus.clone(),
        ));
        let presence_changes = tokio::spawn(forward_presence(presence.clone(), bus.clone()));

        Self {
            presence,
            router,
            chat,
            tasks: vec![presence_task, router_task, state_task, presence_changes],
        }
    }
}

impl Drop for Consumers {
    fn drop(&mut self) {
        self.chat.close_all();
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn forward_connection_state(mut state: watch::Receiver<ConnectionState>, bus: EventBus) {
    loop {
        let current = *state.borrow_and_update();
        bus.emit_event(UiEvent::ConnectionStateChanged { state: current });
        if state.changed().await.is_err() {
            break;
        }
    }
}

async fn forward_presence(presence: PresenceTracker, bus: EventBus) {
    let mut changes = presence.changes();
    while changes.changed().await.is_ok() {
        bus.emit_event(UiEvent::PresenceChanged {
            online: presence.online_count(),
        });
    }
}

/// One authenticated console session.
pub struct Session {
    config: ClientConfig,
    collaborators: Collaborators,
    manager: ConnectionManager,
    ledger: DeliveryLedger,
    bus: EventBus,
    consumers: Consumers,
}

impl Session {
    /// Build the connection, start every consumer and open the connection
    /// for `identity`.
    pub async fn start(config: ClientConfig, identity: Identity, collaborators: Collaborators) -> Self {
        let manager =
            ConnectionManager::new(collaborators.connector.clone(), config.reconnect_policy());
        let ledger = DeliveryLedger::new();
        let bus = EventBus::new();

        // Consumers subscribe before the first open so they see its first events.
        let consumers = Consumers::spawn(
            &manager.handle(),
            &identity,
            &config,
            &collaborators,
            &ledger,
            &bus,
        );

        info!(user = %identity.user_id.short(), "Starting session");
        manager.open(identity).await;

        Self {
            config,
            collaborators,
            manager,
            ledger,
            bus,
            consumers,
        }
    }

    /// Reopen the connection for another identity. Presence, notifications
    /// and chat start over; nothing of the previous identity carries over.
    pub async fn switch_identity(&mut self, identity: Identity) {
        if self.manager.handle().identity().as_ref() == Some(&identity) {
            debug!("Identity unchanged");
            return;
        }

        info!(user = %identity.user_id.short(), "Switching identity");
        self.consumers.chat.close_all();
        self.manager.close().await;

        self.consumers = Consumers::spawn(
            &self.manager.handle(),
            &identity,
            &self.config,
            &self.collaborators,
            &self.ledger,
            &self.bus,
        );
        self.manager.open(identity).await;
    }

    /// Close every chat room, then the connection.
    pub async fn shutdown(self) {
        info!("Shutting down session");
        self.consumers.chat.close_all();
        self.manager.close().await;
    }

    pub fn identity(&self) -> Option<Identity> {
        self.manager.handle().identity()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.manager.handle().watch_state()
    }

    /// Consumer view of the connection, for extra subscribers.
    pub fn connection(&self) -> ConnectionHandle {
        self.manager.handle()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.consumers.presence
    }

    pub fn notifications(&self) -> &NotificationRouter {
        &self.consumers.router
    }

    pub fn chat(&self) -> &ChatHub {
        &self.consumers.chat
    }

    /// Ledger to hand to [`crate::push::PushFallback::register`].
    pub fn delivery_ledger(&self) -> &DeliveryLedger {
        &self.ledger
    }

    pub fn subscribe_ui(&self) -> broadcast::Receiver<UiEvent> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use souk_net::{memory_transport, MemoryHub, Presence};
    use souk_shared::constants::{EVENT_NOTIFICATION, EVENT_ONLINE_USERS};
    use souk_shared::{RoomId, UserId, WireChatMessage};

    use crate::error::Result;

    struct EmptyApi;

    #[async_trait]
    impl ChatApi for EmptyApi {
        async fn fetch_history(&self, _room: &RoomId) -> Result<Vec<WireChatMessage>> {
            Ok(Vec::new())
        }

        async fn persist_message(&self, room: &RoomId, body: &str) -> Result<WireChatMessage> {
            Ok(WireChatMessage {
                id: "m1".into(),
                room_id: room.clone(),
                sender_id: UserId::from("admin"),
                body: body.to_string(),
                created_at: chrono::Utc::now(),
            })
        }
    }

    fn collaborators() -> (Collaborators, MemoryHub) {
        let (connector, hub) = memory_transport();
        (
            Collaborators {
                connector: Arc::new(connector),
                chat_api: Arc::new(|_: &Identity| Arc::new(EmptyApi) as Arc<dyn ChatApi>),
                effects: SideEffects::logging(),
            },
            hub,
        )
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_session_wires_consumers() {
        let (collaborators, mut hub) = collaborators();
        let session = Session::start(
            ClientConfig::default(),
            Identity::new("admin", None),
            collaborators,
        )
        .await;
        let mut ui = session.subscribe_ui();

        let peer = hub.accept().await.unwrap();
        peer.send_event(EVENT_ONLINE_USERS, json!(["u1", "u2"]));
        peer.send_event(EVENT_NOTIFICATION, json!({"type": "SYSTEM", "message": "hi"}));

        wait_until(|| session.notifications().unread_count() == 1).await;
        wait_until(|| session.presence().online_count() == 2).await;
        assert_eq!(
            session.presence().status(&UserId::from("u1")),
            Presence::Online
        );

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(UiEvent::PresenceChanged { online: 2 }) = ui.recv().await {
                    break;
                }
            }
        })
        .await
        .expect("presence change not published");
    }

    #[tokio::test]
    async fn test_switch_identity_starts_over() {
        let (collaborators, mut hub) = collaborators();
        let mut session = Session::start(
            ClientConfig::default(),
            Identity::new("u1", None),
            collaborators,
        )
        .await;
        let mut first = hub.accept().await.unwrap();
        first.send_event(EVENT_NOTIFICATION, json!({"type": "SYSTEM"}));
        wait_until(|| session.notifications().unread_count() == 1).await;
        session.chat().open(RoomId::from("r1")).await.unwrap();

        session.switch_identity(Identity::new("u2", None)).await;

        // The old link is gone before the new one exists.
        while first.recv_frame().await.is_some() {}
        let second = hub.accept().await.unwrap();
        assert_eq!(second.identity.user_id, UserId::from("u2"));
        assert_eq!(session.notifications().unread_count(), 0);
        assert!(session.chat().open_rooms().is_empty());

        second.send_event(EVENT_NOTIFICATION, json!({"type": "JOB"}));
        wait_until(|| session.notifications().unread_count() == 1).await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_connection() {
        let (collaborators, mut hub) = collaborators();
        let session = Session::start(
            ClientConfig::default(),
            Identity::new("admin", None),
            collaborators,
        )
        .await;
        let mut peer = hub.accept().await.unwrap();
        let mut state = session.watch_connection();

        session.shutdown().await;

        assert_eq!(*state.borrow_and_update(), ConnectionState::Idle);
        while peer.recv_frame().await.is_some() {}
    }
}
