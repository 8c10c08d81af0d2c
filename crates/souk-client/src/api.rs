//! REST collaborator for chat history and message persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use souk_shared::protocol::id_string;
use souk_shared::{RoomId, UserId, WireChatMessage};

use crate::error::{ClientError, Result};

/// The backend endpoints the chat pipeline depends on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Prior messages of `room`, in any order.
    async fn fetch_history(&self, room: &RoomId) -> Result<Vec<WireChatMessage>>;

    /// Persist a message and return the server-confirmed record.
    async fn persist_message(&self, room: &RoomId, body: &str) -> Result<WireChatMessage>;
}

/// Message record as the REST backend returns it. The room id is optional
/// because the endpoint is already scoped to one room.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestMessage {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(default, alias = "roomId")]
    chat_id: Option<RoomId>,
    sender_id: UserId,
    #[serde(alias = "body")]
    content: String,
    created_at: DateTime<Utc>,
}

impl RestMessage {
    fn into_wire(self, room: &RoomId) -> WireChatMessage {
        WireChatMessage {
            id: self.id,
            room_id: self.chat_id.unwrap_or_else(|| room.clone()),
            sender_id: self.sender_id,
            body: self.content,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct NewMessage<'a> {
    content: &'a str,
}

/// Accepts a bare array or an array wrapped in `data`/`messages`.
fn history_items(body: Value) -> Result<Vec<RestMessage>> {
    let items = match body {
        Value::Array(items) => Value::Array(items),
        Value::Object(mut map) => map
            .remove("data")
            .or_else(|| map.remove("messages"))
            .ok_or_else(|| ClientError::Api("history response has no message list".into()))?,
        _ => return Err(ClientError::Api("unexpected history response".into())),
    };
    Ok(serde_json::from_value(items)?)
}

/// [`ChatApi`] over HTTP with reqwest.
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn messages_url(&self, room: &RoomId) -> String {
        format!(
            "{}/api/chats/{}/messages",
            self.base_url,
            urlencoding::encode(room.as_str())
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_history(&self, room: &RoomId) -> Result<Vec<WireChatMessage>> {
        let url = self.messages_url(room);
        debug!(url = %url, "Fetching chat history");

        let resp = self.authorize(self.client.get(&url)).send().await?;
        if !resp.status().is_success() {
            return Err(ClientError::Api(format!(
                "history request returned {}",
                resp.status()
            )));
        }

        let body: Value = resp.json().await?;
        Ok(history_items(body)?
            .into_iter()
            .map(|m| m.into_wire(room))
            .collect())
    }

    async fn persist_message(&self, room: &RoomId, body: &str) -> Result<WireChatMessage> {
        let url = self.messages_url(room);
        let resp = self
            .authorize(self.client.post(&url))
            .json(&NewMessage { content: body })
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ClientError::Api(format!(
                "send request returned {}",
                resp.status()
            )));
        }

        let saved: RestMessage = resp.json().await?;
        Ok(saved.into_wire(room))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_messages_url() {
        let api = HttpChatApi::new("http://localhost:8800/", None);
        assert_eq!(
            api.messages_url(&RoomId::from("r1")),
            "http://localhost:8800/api/chats/r1/messages"
        );
    }

    #[test]
    fn test_messages_url_encodes_room() {
        let api = HttpChatApi::new("http://localhost:8800", None);
        assert_eq!(
            api.messages_url(&RoomId::from("a/b?c")),
            "http://localhost:8800/api/chats/a%2Fb%3Fc/messages"
        );
    }

    #[test]
    fn test_rest_message_fills_room() {
        let saved: RestMessage = serde_json::from_value(json!({
            "id": 99,
            "senderId": "u1",
            "content": "hello",
            "createdAt": "2024-05-01T10:00:00Z",
        }))
        .unwrap();

        let wire = saved.into_wire(&RoomId::from("r1"));
        assert_eq!(wire.id, "99");
        assert_eq!(wire.room_id, RoomId::from("r1"));
        assert_eq!(wire.body, "hello");
    }

    #[test]
    fn test_history_shapes() {
        let item = json!({
            "id": "m1",
            "senderId": "u1",
            "content": "hi",
            "createdAt": "2024-05-01T10:00:00Z",
        });

        assert_eq!(history_items(json!([item.clone()])).unwrap().len(), 1);
        assert_eq!(history_items(json!({"data": [item.clone()]})).unwrap().len(), 1);
        assert_eq!(history_items(json!({"messages": [item]})).unwrap().len(), 1);
        assert!(history_items(json!({"ok": true})).is_err());
        assert!(history_items(json!("nope")).is_err());
    }
}
