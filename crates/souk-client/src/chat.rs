//! Chat sessions with optimistic sends.
//!
//! [`ChatStream`] is the pure, ordered message list of one room and holds
//! all reconciliation rules. [`ChatHub`] opens a [`ChatSession`] per room,
//! wiring a stream to the live connection and the REST collaborator.
//!
//! A send is a two-phase record: a provisional entry keyed by a [`TempId`]
//! is appended at once and later replaced in the same slot by the
//! server-confirmed record, or marked failed. Persistence runs on its own
//! task and is tracked in the hub's pending-send registry keyed by
//! `(room, temp id)`, so closing a room never cancels an in-flight send.
//! A result that arrives while its room is not open stays in the registry
//! and is applied when the room is next opened.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use souk_net::{ConnectionEvent, ConnectionHandle, Subscription};
use souk_shared::{RoomId, ServerEvent, TempId, UserId, WireChatMessage};

use crate::api::ChatApi;
use crate::error::{ClientError, Result};
use crate::events::{EventBus, UiEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Server id; `None` until the send is confirmed.
    pub id: Option<String>,
    /// Set on messages sent from this client; kept after confirmation.
    pub temp_id: Option<TempId>,
    pub room: RoomId,
    pub sender: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
}

impl ChatMessage {
    fn remote(msg: WireChatMessage) -> Self {
        Self {
            id: Some(msg.id),
            temp_id: None,
            room: msg.room_id,
            sender: msg.sender_id,
            body: msg.body,
            created_at: msg.created_at,
            status: DeliveryStatus::Sent,
        }
    }

    /// Stable rendering key: the temp id for our own sends, else the server id.
    pub fn key(&self) -> String {
        match (&self.temp_id, &self.id) {
            (Some(temp), _) => temp.to_string(),
            (None, Some(id)) => id.clone(),
            (None, None) => String::new(),
        }
    }
}

/// Ordered message list of one room.
#[derive(Debug, Clone)]
pub struct ChatStream {
    room: RoomId,
    messages: Vec<ChatMessage>,
}

impl ChatStream {
    pub fn new(room: RoomId) -> Self {
        Self {
            room,
            messages: Vec::new(),
        }
    }

    /// Stream seeded from REST history, sorted by creation time.
    pub fn seeded(room: RoomId, mut history: Vec<WireChatMessage>) -> Self {
        history.sort_by_key(|m| m.created_at);
        let mut stream = Self::new(room);
        for msg in history {
            stream.apply_remote(msg);
        }
        stream
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, temp_id: TempId) -> Option<&ChatMessage> {
        self.position(temp_id).map(|idx| &self.messages[idx])
    }

    fn position(&self, temp_id: TempId) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.temp_id == Some(temp_id))
    }

    fn contains_id(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id.as_deref() == Some(id))
    }

    /// Append a provisional entry for our own send. Returns its index.
    pub fn insert_pending(
        &mut self,
        temp_id: TempId,
        sender: UserId,
        body: String,
        created_at: DateTime<Utc>,
    ) -> usize {
        self.restore(temp_id, sender, body, created_at, DeliveryStatus::Sending)
    }

    fn restore(
        &mut self,
        temp_id: TempId,
        sender: UserId,
        body: String,
        created_at: DateTime<Utc>,
        status: DeliveryStatus,
    ) -> usize {
        if let Some(idx) = self.position(temp_id) {
            return idx;
        }
        self.messages.push(ChatMessage {
            id: None,
            temp_id: Some(temp_id),
            room: self.room.clone(),
            sender,
            body,
            created_at,
            status,
        });
        self.messages.len() - 1
    }

    /// Replace the provisional entry in place with the confirmed record.
    ///
    /// If the live echo of this message got here first, that echo entry is
    /// dropped so the final id appears exactly once.
    pub fn confirm(&mut self, temp_id: TempId, record: WireChatMessage) -> bool {
        if self.position(temp_id).is_none() {
            return false;
        }

        self.messages
            .retain(|m| m.temp_id == Some(temp_id) || m.id.as_deref() != Some(record.id.as_str()));

        let Some(idx) = self.position(temp_id) else {
            return false;
        };
        let slot = &mut self.messages[idx];
        slot.id = Some(record.id);
        slot.sender = record.sender_id;
        slot.body = record.body;
        slot.created_at = record.created_at;
        slot.status = DeliveryStatus::Sent;
        true
    }

    /// Mark a provisional entry failed. Confirmed entries are left alone.
    pub fn fail(&mut self, temp_id: TempId) -> bool {
        match self.position(temp_id) {
            Some(idx) if self.messages[idx].status == DeliveryStatus::Sending => {
                self.messages[idx].status = DeliveryStatus::Failed;
                true
            }
            _ => false,
        }
    }

    /// Move a failed entry back to sending and return its body.
    pub fn begin_retry(&mut self, temp_id: TempId) -> Result<String> {
        match self.position(temp_id) {
            Some(idx) if self.messages[idx].status == DeliveryStatus::Failed => {
                self.messages[idx].status = DeliveryStatus::Sending;
                Ok(self.messages[idx].body.clone())
            }
            _ => Err(ClientError::NotRetryable(temp_id)),
        }
    }

    /// Append a message delivered by the hub. Messages for other rooms and
    /// ids already present are ignored.
    pub fn apply_remote(&mut self, msg: WireChatMessage) -> bool {
        if msg.room_id != self.room {
            return false;
        }
        if self.contains_id(&msg.id) {
            return false;
        }
        self.messages.push(ChatMessage::remote(msg));
        true
    }
}

/// A send not yet reflected in an open stream.
#[derive(Debug, Clone)]
struct PendingSend {
    sender: UserId,
    body: String,
    created_at: DateTime<Utc>,
    status: DeliveryStatus,
    /// Server record that arrived while the room was not open.
    confirmed: Option<WireChatMessage>,
}

struct RoomState {
    room: RoomId,
    stream: Mutex<ChatStream>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RoomState {
    fn stream(&self) -> MutexGuard<'_, ChatStream> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn receiver(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.receiver.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct HubInner {
    connection: ConnectionHandle,
    api: Arc<dyn ChatApi>,
    viewer: UserId,
    bus: EventBus,
    rooms: Mutex<HashMap<RoomId, Arc<RoomState>>>,
    pending: Mutex<HashMap<(RoomId, TempId), PendingSend>>,
}

impl HubInner {
    fn rooms(&self) -> MutexGuard<'_, HashMap<RoomId, Arc<RoomState>>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<(RoomId, TempId), PendingSend>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn chat_updated(&self, room: &RoomId) {
        self.bus.emit_event(UiEvent::ChatUpdated { room: room.clone() });
    }

    fn spawn_persist(self: &Arc<Self>, room: RoomId, temp_id: TempId, body: String) -> SendReceipt {
        let hub = self.clone();
        let task = tokio::spawn(async move {
            let result = hub.api.persist_message(&room, &body).await;
            hub.settle(&room, temp_id, result);
        });
        SendReceipt { temp_id, task }
    }

    /// Apply a persistence result to whichever session has `room` open now,
    /// or park it in the registry until the room is opened again.
    ///
    /// Lock order is rooms, then pending, as in [`ChatHub::open`].
    fn settle(&self, room: &RoomId, temp_id: TempId, result: Result<WireChatMessage>) {
        let key = (room.clone(), temp_id);

        match result {
            Ok(record) => {
                let id = record.id.clone();
                let confirmed = {
                    let rooms = self.rooms();
                    let mut pending = self.pending();
                    match rooms.get(room) {
                        Some(state) => {
                            pending.remove(&key);
                            let mut stream = state.stream();
                            stream.confirm(temp_id, record)
                        }
                        None => {
                            if let Some(entry) = pending.get_mut(&key) {
                                entry.status = DeliveryStatus::Sent;
                                entry.confirmed = Some(record);
                            }
                            debug!(room = %room, temp = %temp_id, "Room not open, confirmation held");
                            return;
                        }
                    }
                };
                if confirmed {
                    debug!(room = %room, temp = %temp_id, id = %id, "Message confirmed");
                    self.chat_updated(room);
                }
            }
            Err(e) => {
                warn!(room = %room, temp = %temp_id, error = %e, "Message send failed");
                let state = {
                    let rooms = self.rooms();
                    let state = rooms.get(room).cloned();
                    if let Some(entry) = self.pending().get_mut(&key) {
                        entry.status = DeliveryStatus::Failed;
                    }
                    state
                };
                if let Some(state) = state {
                    if state.stream().fail(temp_id) {
                        self.chat_updated(room);
                    }
                }
            }
        }
    }
}

/// Handle on a spawned persistence call. Dropping it does not cancel the send.
pub struct SendReceipt {
    pub temp_id: TempId,
    task: JoinHandle<()>,
}

impl SendReceipt {
    /// Wait until the send is confirmed or marked failed.
    pub async fn settled(self) {
        if let Err(e) = self.task.await {
            warn!(temp = %self.temp_id, error = %e, "Send task ended abnormally");
        }
    }
}

/// Opens chat rooms for one signed-in operator.
#[derive(Clone)]
pub struct ChatHub {
    inner: Arc<HubInner>,
}

impl ChatHub {
    pub fn new(
        connection: ConnectionHandle,
        api: Arc<dyn ChatApi>,
        viewer: UserId,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                connection,
                api,
                viewer,
                bus,
                rooms: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Open `room`: seed it from history, reinstate unconfirmed sends, join
    /// it on the live channel and start receiving. Opening a room that is
    /// already open returns the existing session.
    pub async fn open(&self, room: RoomId) -> Result<ChatSession> {
        let existing = self.inner.rooms().get(&room).cloned();
        if let Some(state) = existing {
            debug!(room = %room, "Chat room already open");
            return Ok(self.session(state));
        }

        // Subscribe first so nothing delivered during the history fetch is lost.
        let subscription = self.inner.connection.subscribe();
        let history = self.inner.api.fetch_history(&room).await?;
        let mut stream = ChatStream::seeded(room.clone(), history);

        // Reinstating sends and registering the room happen under one rooms
        // lock, so every result either sees the room or is in the snapshot.
        let state = {
            let mut rooms = self.inner.rooms();
            if let Some(existing) = rooms.get(&room) {
                return Ok(self.session(existing.clone()));
            }

            let mut pending = self.inner.pending();
            let mut unconfirmed: Vec<(TempId, PendingSend)> = pending
                .iter()
                .filter(|((r, _), _)| *r == room)
                .map(|((_, temp_id), entry)| (*temp_id, entry.clone()))
                .collect();
            unconfirmed.sort_by_key(|(_, entry)| entry.created_at);
            for (temp_id, entry) in unconfirmed {
                let status = match entry.confirmed {
                    Some(_) => DeliveryStatus::Sending,
                    None => entry.status,
                };
                stream.restore(temp_id, entry.sender, entry.body, entry.created_at, status);
                if let Some(record) = entry.confirmed {
                    stream.confirm(temp_id, record);
                    pending.remove(&(room.clone(), temp_id));
                }
            }

            let state = Arc::new(RoomState {
                room: room.clone(),
                stream: Mutex::new(stream),
                receiver: Mutex::new(None),
                closed: AtomicBool::new(false),
            });
            rooms.insert(room.clone(), state.clone());
            state
        };
        let count = state.stream().len();

        self.inner.connection.join_room(&room);
        let task = tokio::spawn(receive_loop(self.inner.clone(), state.clone(), subscription));
        *state.receiver() = Some(task);

        info!(room = %room, messages = count, "Chat room opened");
        self.inner.chat_updated(&room);
        Ok(self.session(state))
    }

    /// The open session for `room`, if any.
    pub fn session_for(&self, room: &RoomId) -> Option<ChatSession> {
        let state = self.inner.rooms().get(room).cloned();
        state.map(|state| self.session(state))
    }

    pub fn open_rooms(&self) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self.inner.rooms().keys().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Sends still sending or failed, across all rooms.
    pub fn pending_count(&self) -> usize {
        self.inner
            .pending()
            .values()
            .filter(|entry| entry.confirmed.is_none())
            .count()
    }

    pub fn close_all(&self) {
        let states: Vec<Arc<RoomState>> = self.inner.rooms().values().cloned().collect();
        for state in states {
            self.session(state).close();
        }
    }

    fn session(&self, state: Arc<RoomState>) -> ChatSession {
        ChatSession {
            hub: self.inner.clone(),
            state,
        }
    }
}

async fn receive_loop(hub: Arc<HubInner>, state: Arc<RoomState>, mut subscription: Subscription) {
    while let Some(event) = subscription.recv().await {
        if let ConnectionEvent::Server(ServerEvent::ChatMessage(msg)) = event {
            if state.stream().apply_remote(msg) {
                hub.chat_updated(&state.room);
            }
        }
    }
    debug!(room = %state.room, "Chat receiver stopped");
}

/// One open chat room.
#[derive(Clone)]
pub struct ChatSession {
    hub: Arc<HubInner>,
    state: Arc<RoomState>,
}

impl ChatSession {
    pub fn room(&self) -> &RoomId {
        &self.state.room
    }

    pub fn is_open(&self) -> bool {
        !self.state.closed.load(Ordering::SeqCst)
    }

    /// Snapshot of the stream in display order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.state.stream().messages().to_vec()
    }

    pub fn message(&self, temp_id: TempId) -> Option<ChatMessage> {
        self.state.stream().get(temp_id).cloned()
    }

    /// Optimistically append `body` and persist it in the background.
    pub fn send(&self, body: &str) -> Result<SendReceipt> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        self.ensure_open()?;

        let room = self.state.room.clone();
        let temp_id = TempId::new();
        let created_at = Utc::now();

        self.state.stream().insert_pending(
            temp_id,
            self.hub.viewer.clone(),
            body.to_string(),
            created_at,
        );
        self.hub.pending().insert(
            (room.clone(), temp_id),
            PendingSend {
                sender: self.hub.viewer.clone(),
                body: body.to_string(),
                created_at,
                status: DeliveryStatus::Sending,
                confirmed: None,
            },
        );
        self.hub.chat_updated(&room);
        debug!(room = %room, temp = %temp_id, "Message queued");

        Ok(self.hub.spawn_persist(room, temp_id, body.to_string()))
    }

    /// Re-run persistence for a failed send. The entry keeps its slot.
    pub fn retry(&self, temp_id: TempId) -> Result<SendReceipt> {
        self.ensure_open()?;

        let room = self.state.room.clone();
        let body = self.state.stream().begin_retry(temp_id)?;
        if let Some(pending) = self.hub.pending().get_mut(&(room.clone(), temp_id)) {
            pending.status = DeliveryStatus::Sending;
        }
        self.hub.chat_updated(&room);
        debug!(room = %room, temp = %temp_id, "Retrying message");

        Ok(self.hub.spawn_persist(room, temp_id, body))
    }

    /// Leave the room and stop receiving. In-flight sends keep running.
    pub fn close(&self) {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let room = &self.state.room;
        {
            let mut rooms = self.hub.rooms();
            if rooms.get(room).is_some_and(|s| Arc::ptr_eq(s, &self.state)) {
                rooms.remove(room);
            }
        }

        self.hub.connection.leave_room(room);
        if let Some(task) = self.state.receiver().take() {
            task.abort();
        }
        info!(room = %room, "Chat room closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ClientError::RoomClosed(self.state.room.clone()))
        }
    }
}
