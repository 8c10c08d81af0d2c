//! Client core of the souk admin console: notifications, chat, push
//! fallback and the session lifecycle that owns the live connection.

pub mod api;
pub mod chat;
pub mod config;
pub mod effects;
pub mod error;
pub mod events;
pub mod notifications;
pub mod push;
pub mod session;

use tracing_subscriber::{fmt, EnvFilter};

pub use api::{ChatApi, HttpChatApi};
pub use chat::{ChatHub, ChatMessage, ChatSession, ChatStream, DeliveryStatus, SendReceipt};
pub use config::ClientConfig;
pub use effects::{CacheInvalidator, SideEffects, SoundPlayer, Toast, ToastAction, ToastVariant, Toaster};
pub use error::{ClientError, Result, SideEffectError};
pub use events::{EventBus, UiEvent};
pub use notifications::{
    DeliveryLedger, Notification, NotificationBody, NotificationKind, NotificationRouter,
};
pub use push::{ClickOutcome, PlatformNotification, PushFallback, PushPayload, PushPermission, PushPlatform};
pub use session::{Collaborators, Session};

/// Install the global tracing subscriber. Respects `RUST_LOG`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("souk_client=debug,souk_net=debug,warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
