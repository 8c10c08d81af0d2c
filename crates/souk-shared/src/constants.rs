/// Application name
pub const APP_NAME: &str = "Souk";

// Live-channel event names (inbound)

/// Full presence snapshot, sent right after the connection opens.
pub const EVENT_ONLINE_USERS: &str = "online_users_list";
/// Single-user presence change.
pub const EVENT_USER_STATUS: &str = "user_status_change";
pub const EVENT_NOTIFICATION: &str = "notification";
pub const EVENT_RECEIVE_MESSAGE: &str = "receive_message";
/// Generic entity-change broadcast (bookings and friends).
pub const EVENT_APP_EVENT: &str = "app_event";

// Live-channel event names (outbound)

pub const EVENT_JOIN_CHAT: &str = "join_chat";
pub const EVENT_LEAVE_CHAT: &str = "leave_chat";

/// Query parameter carrying the user id on connect
pub const IDENTITY_QUERY_PARAM: &str = "userId";

/// Reconnection attempts before the connection is reported as disconnected
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;

/// First reconnection delay in milliseconds
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;

/// Upper bound for the reconnection delay in milliseconds
pub const DEFAULT_RECONNECT_DELAY_MAX_MS: u64 = 5_000;

/// Fraction of the delay applied as random jitter in both directions
pub const RECONNECT_JITTER: f64 = 0.5;

/// Capacity of the inbound event fan-out queue
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Newest notifications kept in the in-app log
pub const DEFAULT_NOTIFICATION_LOG_CAP: usize = 200;

/// How long a notification toast stays on screen
pub const TOAST_DURATION_MS: u64 = 8_000;

/// Audio cue played on every new notification
pub const DEFAULT_NOTIFICATION_SOUND: &str = "/sounds/notification.wav";

/// Icon (and badge) used for platform push notifications
pub const PUSH_ICON: &str = "/icons/icon-192x192.png";
pub const PUSH_DEFAULT_TITLE: &str = "New Notification";
pub const PUSH_DEFAULT_BODY: &str = "You have a new update.";
pub const PUSH_DEFAULT_URL: &str = "/";
