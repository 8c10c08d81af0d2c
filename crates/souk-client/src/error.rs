use thiserror::Error;

use souk_net::NetError;
use souk_shared::{RoomId, TempId};

/// Errors surfaced to callers of the client core.
#[derive(Error, Debug)]
pub enum ClientError {
    /// A chat message body was empty after trimming.
    #[error("Message body is empty")]
    EmptyMessage,

    /// `retry` targeted a message that is not in the failed state.
    #[error("Message {0} is not a failed send")]
    NotRetryable(TempId),

    /// The chat session for this room was closed.
    #[error("Chat room {0} is not open")]
    RoomClosed(RoomId),

    /// The REST collaborator rejected or could not serve a request.
    #[error("API error: {0}")]
    Api(String),

    /// HTTP transport failure talking to the REST collaborator.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Live-channel failure.
    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Failure of a best-effort side effect (sound, toast, cache invalidation,
/// platform notification). Always logged and swallowed by the caller.
#[derive(Error, Debug)]
pub enum SideEffectError {
    #[error("Audio playback failed: {0}")]
    Sound(String),

    #[error("Toast could not be shown: {0}")]
    Toast(String),

    #[error("Cache invalidation failed for {key}: {reason}")]
    Invalidation { key: String, reason: String },

    #[error("Platform notification failed: {0}")]
    Platform(String),
}
