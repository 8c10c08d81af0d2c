use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::constants::*;
use crate::error::ProtocolError;
use crate::types::{RoomId, UserId};

/// One text frame on the live channel: `{"event": <name>, "data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Everything the hub pushes to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Full list of online users; replaces whatever the client had.
    PresenceSnapshot(Vec<UserId>),
    PresenceDelta(PresenceDelta),
    /// Notification envelope, classified later by the notification router.
    /// Kept raw so that no envelope shape can fail parsing here.
    Notification(Value),
    ChatMessage(WireChatMessage),
    AppEvent(AppEvent),
    /// An event name this client does not know yet.
    Unknown { event: String, data: Value },
}

impl ServerEvent {
    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        let Frame { event, data } = frame;
        let invalid = |event: &str, e: serde_json::Error| ProtocolError::InvalidPayload {
            event: event.to_string(),
            reason: e.to_string(),
        };

        match event.as_str() {
            EVENT_ONLINE_USERS => serde_json::from_value(data)
                .map(ServerEvent::PresenceSnapshot)
                .map_err(|e| invalid(&event, e)),
            EVENT_USER_STATUS => serde_json::from_value(data)
                .map(ServerEvent::PresenceDelta)
                .map_err(|e| invalid(&event, e)),
            EVENT_NOTIFICATION => Ok(ServerEvent::Notification(data)),
            EVENT_RECEIVE_MESSAGE => serde_json::from_value(data)
                .map(ServerEvent::ChatMessage)
                .map_err(|e| invalid(&event, e)),
            EVENT_APP_EVENT => Ok(ServerEvent::AppEvent(AppEvent::from_value(data))),
            _ => Ok(ServerEvent::Unknown { event, data }),
        }
    }

    /// Parse a raw text frame straight into an event.
    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        Self::from_frame(Frame::from_text(text)?)
    }
}

/// Online/offline transition for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceDelta {
    pub user_id: UserId,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// A chat message as broadcast by the hub to the members of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireChatMessage {
    /// Server-assigned message id. Numeric ids are kept as their decimal text.
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(rename = "chatId", alias = "roomId")]
    pub room_id: RoomId,
    pub sender_id: UserId,
    #[serde(rename = "content", alias = "body")]
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Read an id sent either as a JSON string or a JSON number.
pub fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(id) => id,
        RawId::Number(id) => id.to_string(),
    })
}

/// Entity-change broadcast (`{"type": "BOOKING_UPDATE", ...}`).
#[derive(Debug, Clone, PartialEq)]
pub struct AppEvent {
    /// Value of the `type` field, empty when missing.
    pub kind: String,
    pub data: Value,
}

impl AppEvent {
    pub fn from_value(data: Value) -> Self {
        let kind = data
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self { kind, data }
    }
}

/// Everything a client sends to the hub. All of it is fire-and-forget.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Ask the hub to deliver this room's messages to us.
    JoinRoom(RoomId),
    LeaveRoom(RoomId),
    /// Any other event, sent as-is.
    Custom { event: String, data: Value },
}

impl ClientEvent {
    pub fn to_frame(&self) -> Frame {
        match self {
            ClientEvent::JoinRoom(room) => Frame::new(EVENT_JOIN_CHAT, Value::String(room.0.clone())),
            ClientEvent::LeaveRoom(room) => {
                Frame::new(EVENT_LEAVE_CHAT, Value::String(room.0.clone()))
            }
            ClientEvent::Custom { event, data } => Frame::new(event.clone(), data.clone()),
        }
    }
}
