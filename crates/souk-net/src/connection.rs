//! The single live connection of an authenticated session.
//!
//! A dedicated tokio task owns the transport. The rest of the application
//! talks to it through an outbound command channel and reads inbound events
//! from a broadcast fan-out, so presence, notifications and every open chat
//! room are independent subscribers of the same stream.
//!
//! Every event is stamped with the connection *generation*. `close()` and an
//! identity switch advance the generation, which voids all older
//! subscriptions and anything a dying task may still publish.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use souk_shared::constants::EVENT_QUEUE_CAPACITY;
use souk_shared::{ClientEvent, ConnectionState, Identity, RoomId, ServerEvent};

use crate::backoff::ReconnectPolicy;
use crate::transport::{Connector, Link};

/// How long `open`/`close` wait for a previous connection task to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// What subscribers receive.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The transport is up (first connect or a reconnect).
    Opened,
    /// The transport went away; a retry may follow.
    Closed,
    Server(ServerEvent),
}

#[derive(Debug, Clone)]
struct Stamped {
    generation: u64,
    event: ConnectionEvent,
}

struct Control {
    identity: Option<Identity>,
    cmd_tx: Option<mpsc::UnboundedSender<ClientEvent>>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    generation: AtomicU64,
    events_tx: broadcast::Sender<Stamped>,
    state_tx: watch::Sender<ConnectionState>,
    control: Mutex<Control>,
    rooms: Mutex<BTreeSet<RoomId>>,
    /// Serialises `open` and `close`.
    lifecycle: tokio::sync::Mutex<()>,
}

impl Inner {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rooms(&self) -> MutexGuard<'_, BTreeSet<RoomId>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, generation: u64, event: ConnectionEvent) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.events_tx.send(Stamped { generation, event });
    }

    /// Update the state unless `generation` has been superseded.
    fn set_state(&self, generation: u64, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if self.generation() != generation || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Void every subscription and state write of the current generation.
    fn advance_generation(&self) {
        let next = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state_tx.send_replace(ConnectionState::Idle);
        // Fence: wakes old subscribers so they observe the new generation.
        self.publish(next, ConnectionEvent::Closed);
    }

    fn emit(&self, event: ClientEvent) {
        let control = self.control();
        match &control.cmd_tx {
            Some(tx) if self.state_tx.borrow().is_open() => {
                if tx.send(event).is_err() {
                    debug!("Connection task gone, outbound event dropped");
                }
            }
            _ => debug!(event = ?event, "Connection not open, outbound event dropped"),
        }
    }
}

/// Owner of the session's live connection.
///
/// Only the session lifecycle holds this; everything else gets a
/// [`ConnectionHandle`], which cannot open or close the connection.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_QUEUE_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                generation: AtomicU64::new(0),
                events_tx,
                state_tx,
                control: Mutex::new(Control {
                    identity: None,
                    cmd_tx: None,
                    task: None,
                }),
                rooms: Mutex::new(BTreeSet::new()),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Shared, consumer-facing handle to this connection.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            inner: self.inner.clone(),
        }
    }

    /// Open the connection for `identity`.
    ///
    /// No-op while a connection for the same identity is running. A different
    /// identity tears the old connection down first, so two identities never
    /// hold a connection at the same time. After `Disconnected`, calling this
    /// again with the same identity restarts the retry cycle.
    pub async fn open(&self, identity: Identity) {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let previous = {
            let mut control = self.inner.control();
            let same_identity = control.identity.as_ref() == Some(&identity);
            let running = control
                .task
                .as_ref()
                .is_some_and(|task| !task.is_finished());

            if same_identity && running {
                debug!(user = %identity.user_id.short(), "Connection already open");
                return;
            }

            if !same_identity && control.identity.is_some() {
                info!(user = %identity.user_id.short(), "Identity changed, replacing connection");
                self.inner.rooms().clear();
                self.inner.advance_generation();
            }

            control.cmd_tx = None;
            control.task.take()
        };

        if let Some(task) = previous {
            wait_for_shutdown(task).await;
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let generation = self.inner.generation();
        let task = tokio::spawn(run_connection(
            self.inner.clone(),
            identity.clone(),
            generation,
            cmd_rx,
        ));

        let mut control = self.inner.control();
        control.identity = Some(identity);
        control.cmd_tx = Some(cmd_tx);
        control.task = Some(task);
    }

    /// Release the connection. Every existing subscription ends; events a
    /// dying task still produces are never delivered.
    pub async fn close(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let task = {
            let mut control = self.inner.control();
            if let Some(identity) = control.identity.take() {
                info!(user = %identity.user_id.short(), "Closing connection");
            }
            control.cmd_tx = None;
            control.task.take()
        };

        self.inner.rooms().clear();
        self.inner.advance_generation();

        if let Some(task) = task {
            wait_for_shutdown(task).await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe(&self) -> Subscription {
        self.handle().subscribe()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let mut control = self.inner.control();
        control.cmd_tx = None;
        if let Some(task) = control.task.take() {
            task.abort();
        }
    }
}

/// Consumer view of the live connection: publish, subscribe, observe state.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl ConnectionHandle {
    /// Fire-and-forget send. Dropped (and logged) while the connection is
    /// not open.
    pub fn emit(&self, event: ClientEvent) {
        self.inner.emit(event);
    }

    /// Subscribe to inbound events of the current connection generation.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.inner.events_tx.subscribe(),
            generation: self.inner.generation(),
            inner: self.inner.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Identity the connection is currently opened for.
    pub fn identity(&self) -> Option<Identity> {
        self.inner.control().identity.clone()
    }

    /// Register interest in a room's messages. Returns false (and sends
    /// nothing) if the room was already joined. Joined rooms are re-joined
    /// automatically after every reconnect.
    pub fn join_room(&self, room: &RoomId) -> bool {
        if !self.inner.rooms().insert(room.clone()) {
            return false;
        }
        debug!(room = %room, "Joining room");
        self.inner.emit(ClientEvent::JoinRoom(room.clone()));
        true
    }

    /// Forget a room. Returns false if it was not joined.
    pub fn leave_room(&self, room: &RoomId) -> bool {
        if !self.inner.rooms().remove(room) {
            return false;
        }
        debug!(room = %room, "Leaving room");
        self.inner.emit(ClientEvent::LeaveRoom(room.clone()));
        true
    }

    pub fn joined_rooms(&self) -> Vec<RoomId> {
        self.inner.rooms().iter().cloned().collect()
    }
}

/// Receiving end of one subscriber. Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<Stamped>,
    generation: u64,
    inner: Arc<Inner>,
}

impl Subscription {
    /// Next event, or `None` once the connection this subscription belongs
    /// to has been closed or replaced.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        loop {
            if !self.is_current() {
                return None;
            }

            match self.rx.recv().await {
                Ok(stamped) if stamped.generation == self.generation => {
                    return Some(stamped.event)
                }
                Ok(stamped) if stamped.generation > self.generation => return None,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber fell behind, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Whether the connection generation this subscription belongs to is
    /// still the live one.
    pub fn is_current(&self) -> bool {
        self.inner.generation() == self.generation
    }

    /// Explicit form of dropping the subscription.
    pub fn unsubscribe(self) {}
}

enum PumpOutcome {
    /// The manager asked us to stop.
    Shutdown,
    /// The link failed or the hub hung up.
    Dropped(String),
}

/// Connection task: dial, pump frames, and retry with backoff until the
/// ceiling is reached or the manager shuts us down.
async fn run_connection(
    inner: Arc<Inner>,
    identity: Identity,
    generation: u64,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientEvent>,
) {
    let mut attempt: u32 = 0;

    loop {
        inner.set_state(generation, ConnectionState::Connecting { attempt });

        let connected = unless_shutdown(inner.connector.connect(&identity), &mut cmd_rx).await;
        let Some(connected) = connected else {
            debug!("Shutdown requested while dialing");
            return;
        };

        match connected {
            Ok(mut link) => {
                attempt = 0;
                inner.set_state(generation, ConnectionState::Open);
                inner.publish(generation, ConnectionEvent::Opened);
                info!(user = %identity.user_id.short(), "Connection open");

                rejoin_rooms(&inner, &mut link).await;

                match pump(&inner, generation, &mut link, &mut cmd_rx).await {
                    PumpOutcome::Shutdown => {
                        let _ = link.sink.close().await;
                        info!("Connection closed");
                        return;
                    }
                    PumpOutcome::Dropped(reason) => {
                        warn!(reason = %reason, "Connection lost");
                        inner.publish(generation, ConnectionEvent::Closed);
                    }
                }
            }
            Err(e) => {
                warn!(attempt, error = %e, "Connection attempt failed");
            }
        }

        attempt += 1;
        if inner.policy.exhausted(attempt) {
            warn!(
                attempts = inner.policy.max_attempts,
                "Reconnection attempts exhausted, giving up"
            );
            inner.set_state(generation, ConnectionState::Disconnected);
            return;
        }

        let delay = inner.policy.delay_for(attempt);
        inner.set_state(generation, ConnectionState::Connecting { attempt });
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying connection");

        if unless_shutdown(tokio::time::sleep(delay), &mut cmd_rx)
            .await
            .is_none()
        {
            return;
        }
    }
}

/// Re-join every recorded room; membership does not survive the hub losing us.
async fn rejoin_rooms(inner: &Inner, link: &mut Link) {
    let rooms: Vec<RoomId> = inner.rooms().iter().cloned().collect();
    for room in rooms {
        let frame = ClientEvent::JoinRoom(room.clone()).to_frame();
        match frame.to_text() {
            Ok(text) => {
                if let Err(e) = link.sink.send(text).await {
                    warn!(room = %room, error = %e, "Failed to re-join room");
                    return;
                }
                debug!(room = %room, "Re-joined room");
            }
            Err(e) => warn!(room = %room, error = %e, "Failed to encode join"),
        }
    }
}

async fn pump(
    inner: &Inner,
    generation: u64,
    link: &mut Link,
    cmd_rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
) -> PumpOutcome {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    return PumpOutcome::Shutdown;
                };
                let text = match cmd.to_frame().to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode outbound event");
                        continue;
                    }
                };
                if let Err(e) = link.sink.send(text).await {
                    return PumpOutcome::Dropped(e.to_string());
                }
            }

            frame = link.stream.next() => {
                match frame {
                    Some(Ok(text)) => match ServerEvent::from_text(&text) {
                        Ok(event) => inner.publish(generation, ConnectionEvent::Server(event)),
                        Err(e) => debug!(error = %e, "Skipping unreadable frame"),
                    },
                    Some(Err(e)) => return PumpOutcome::Dropped(e.to_string()),
                    None => return PumpOutcome::Dropped("stream ended".into()),
                }
            }
        }
    }
}

/// Drive `fut` to completion, discarding outbound events (the connection
/// is not open) and bailing out with `None` if the command channel closes.
async fn unless_shutdown<F: Future>(
    fut: F,
    cmd_rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Some(out),
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => debug!(event = ?cmd, "Connection not open, outbound event dropped"),
                None => return None,
            },
        }
    }
}

async fn wait_for_shutdown(mut task: JoinHandle<()>) {
    if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
        warn!("Connection task did not stop in time, aborting");
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{memory_transport, MemoryHub};
    use serde_json::json;
    use souk_shared::constants::{EVENT_JOIN_CHAT, EVENT_ONLINE_USERS};
    use souk_shared::UserId;

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter: 0.0,
        }
    }

    fn setup(max_attempts: u32) -> (ConnectionManager, MemoryHub) {
        let (connector, hub) = memory_transport();
        (
            ConnectionManager::new(Arc::new(connector), fast_policy(max_attempts)),
            hub,
        )
    }

    async fn wait_for_state(handle: &ConnectionHandle, wanted: ConnectionState) {
        let mut rx = handle.watch_state();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == wanted))
            .await
            .expect("state not reached in time")
            .expect("state channel closed");
    }

    async fn next_event(sub: &mut Subscription) -> Option<ConnectionEvent> {
        tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("no event in time")
    }

    #[tokio::test]
    async fn test_open_delivers_events() {
        let (manager, mut hub) = setup(3);
        let mut sub = manager.subscribe();

        manager.open(Identity::new("u1", None)).await;
        let peer = hub.accept().await.unwrap();
        assert_eq!(peer.identity.user_id, UserId::from("u1"));

        assert_eq!(next_event(&mut sub).await, Some(ConnectionEvent::Opened));
        assert!(manager.state().is_open());

        peer.send_event(EVENT_ONLINE_USERS, json!(["u1", "u2"]));
        assert_eq!(
            next_event(&mut sub).await,
            Some(ConnectionEvent::Server(ServerEvent::PresenceSnapshot(vec![
                UserId::from("u1"),
                UserId::from("u2"),
            ])))
        );
    }

    #[tokio::test]
    async fn test_open_same_identity_is_noop() {
        let (manager, mut hub) = setup(3);
        manager.open(Identity::new("u1", None)).await;
        let _peer = hub.accept().await.unwrap();
        wait_for_state(&manager.handle(), ConnectionState::Open).await;

        manager.open(Identity::new("u1", None)).await;
        let second = tokio::time::timeout(Duration::from_millis(100), hub.accept()).await;
        assert!(second.is_err(), "no second connection expected");
    }

    #[tokio::test]
    async fn test_identity_switch_replaces_connection() {
        let (manager, mut hub) = setup(3);
        manager.open(Identity::new("u1", None)).await;
        let mut first = hub.accept().await.unwrap();
        let mut old_sub = manager.subscribe();

        manager.open(Identity::new("u2", None)).await;
        assert!(!old_sub.is_current());
        assert_eq!(next_event(&mut old_sub).await, None);

        // The first link was shut down before the second was dialed.
        assert!(first.recv_frame().await.is_none());
        let second = hub.accept().await.unwrap();
        assert_eq!(second.identity.user_id, UserId::from("u2"));
    }

    #[tokio::test]
    async fn test_events_after_close_are_void() {
        let (manager, mut hub) = setup(3);
        let mut sub = manager.subscribe();
        manager.open(Identity::new("u1", None)).await;
        let peer = hub.accept().await.unwrap();
        assert_eq!(next_event(&mut sub).await, Some(ConnectionEvent::Opened));

        manager.close().await;
        peer.send_event(EVENT_ONLINE_USERS, json!(["u9"]));

        assert_eq!(next_event(&mut sub).await, None);
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_reconnects_and_rejoins_rooms() {
        let (manager, mut hub) = setup(3);
        let handle = manager.handle();
        manager.open(Identity::new("u1", None)).await;
        let mut peer = hub.accept().await.unwrap();
        wait_for_state(&handle, ConnectionState::Open).await;

        assert!(handle.join_room(&RoomId::from("r1")));
        assert!(!handle.join_room(&RoomId::from("r1")));
        let frame = peer.recv_frame().await.unwrap();
        assert_eq!(frame.event, EVENT_JOIN_CHAT);

        peer.disconnect();
        let mut peer = hub.accept().await.unwrap();
        let frame = peer.recv_frame().await.unwrap();
        assert_eq!(frame.event, EVENT_JOIN_CHAT);
        assert_eq!(frame.data, json!("r1"));
        wait_for_state(&handle, ConnectionState::Open).await;
    }

    #[tokio::test]
    async fn test_gives_up_after_ceiling() {
        let (manager, hub) = setup(2);
        hub.refuse_connections(true);
        manager.open(Identity::new("u1", None)).await;

        wait_for_state(&manager.handle(), ConnectionState::Disconnected).await;

        // A manual open restarts the cycle.
        hub.refuse_connections(false);
        manager.open(Identity::new("u1", None)).await;
        wait_for_state(&manager.handle(), ConnectionState::Open).await;
    }

    #[tokio::test]
    async fn test_emit_while_closed_is_dropped() {
        let (manager, _hub) = setup(1);
        let handle = manager.handle();
        handle.emit(ClientEvent::JoinRoom(RoomId::from("r1")));
        assert_eq!(handle.state(), ConnectionState::Idle);
    }
}
