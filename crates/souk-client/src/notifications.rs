//! Notification router.
//!
//! Turns inbound notification envelopes into a newest-first log, an unread
//! counter, and best-effort side effects (sound, toast, cache invalidation).
//! Envelopes are classified into a closed set of kinds; anything unknown or
//! malformed lands in [`NotificationKind::System`] instead of being dropped.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use souk_net::{ConnectionEvent, ConnectionHandle, Subscription};
use souk_shared::constants::{DEFAULT_NOTIFICATION_LOG_CAP, TOAST_DURATION_MS};
use souk_shared::protocol::AppEvent;
use souk_shared::ServerEvent;

use crate::effects::{SideEffects, Toast, ToastAction, ToastVariant};
use crate::events::{EventBus, UiEvent};

/// Cache key of the partnership requests list.
pub const PARTNERSHIP_REQUESTS_KEY: &str = "partnershipRequests";
/// Cache key of the bookings list.
pub const BOOKINGS_KEY: &str = "bookings";

const SYSTEM_FALLBACK_DESCRIPTION: &str = "New message from the system";

/// Handled envelope ids remembered for de-duplication.
const LEDGER_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    Token,
    Job,
    PartnerRequest,
    /// Also the fallback for unknown or missing tags.
    System,
}

/// Kind-specific content of a notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationBody {
    #[serde(rename_all = "camelCase")]
    Token {
        /// Token entity id, not unique per envelope.
        entity_id: Option<String>,
        token_code: Option<String>,
        order_number: Option<String>,
        mobile_number: Option<String>,
        status: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Job {
        entity_id: Option<String>,
        description: Option<String>,
        location: Option<String>,
        cost: Option<String>,
        posted_by: Option<String>,
    },
    PartnerRequest {
        message: Option<String>,
    },
    System {
        message: Option<String>,
        /// The tag as sent, when it was not one we know.
        tag: Option<String>,
    },
}

/// One classified envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Server envelope id, or `local-<uuid>` when the server sent none.
    pub id: String,
    /// Whether `id` came from the server (and can be de-duplicated).
    pub server_assigned: bool,
    pub created_at: DateTime<Utc>,
    /// Deep-link target inside the console.
    pub link: Option<String>,
    pub body: NotificationBody,
    /// The envelope exactly as received.
    pub raw: Value,
}

impl Notification {
    /// Classify a raw envelope. Never fails.
    pub fn classify(raw: Value, received_at: DateTime<Utc>) -> Self {
        let tag = raw.get("type").and_then(Value::as_str).map(str::to_string);

        let body = match tag.as_deref() {
            Some("TOKEN") => NotificationBody::Token {
                entity_id: data_field(&raw, "id"),
                token_code: field(&raw, "tokenCode"),
                order_number: field(&raw, "orderNumber"),
                mobile_number: field(&raw, "mobileNumber"),
                status: field(&raw, "status"),
            },
            Some("JOB") => NotificationBody::Job {
                entity_id: data_field(&raw, "id"),
                description: field(&raw, "description"),
                location: field(&raw, "location"),
                cost: field(&raw, "cost"),
                posted_by: field(&raw, "postedBy"),
            },
            Some("PARTNER_REQUEST") => NotificationBody::PartnerRequest {
                message: field(&raw, "message"),
            },
            Some("SYSTEM") => NotificationBody::System {
                message: field(&raw, "message"),
                tag: None,
            },
            other => NotificationBody::System {
                message: field(&raw, "message"),
                tag: other.map(str::to_string),
            },
        };

        // Only the envelope id identifies a delivery; `data.id` names the entity.
        let (id, server_assigned) = match raw.get("id").and_then(scalar) {
            Some(id) => (id, true),
            None => (format!("local-{}", Uuid::new_v4()), false),
        };

        let created_at = field(&raw, "createdAt")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(received_at);

        Self {
            id,
            server_assigned,
            created_at,
            link: field(&raw, "link"),
            body,
            raw,
        }
    }

    pub fn kind(&self) -> NotificationKind {
        match self.body {
            NotificationBody::Token { .. } => NotificationKind::Token,
            NotificationBody::Job { .. } => NotificationKind::Job,
            NotificationBody::PartnerRequest { .. } => NotificationKind::PartnerRequest,
            NotificationBody::System { .. } => NotificationKind::System,
        }
    }

    /// The toast raised when this notification arrives.
    pub fn toast(&self) -> Toast {
        let link_action = |label: &str| {
            self.link.as_ref().map(|route| ToastAction {
                label: label.to_string(),
                route: route.clone(),
            })
        };

        let (title, description, variant, action) = match &self.body {
            NotificationBody::Token { token_code, .. } => (
                "New Token Generated".to_string(),
                format!("Token: {}", token_code.as_deref().unwrap_or_default()),
                ToastVariant::Success,
                Some(ToastAction {
                    label: "View".into(),
                    route: "/tokens".into(),
                }),
            ),
            NotificationBody::Job { location, cost, .. } => (
                "New Job Posted".to_string(),
                format!(
                    "{} | {}₽",
                    location.as_deref().unwrap_or_default(),
                    cost.as_deref().unwrap_or_default()
                ),
                ToastVariant::Default,
                Some(ToastAction {
                    label: "Jobs".into(),
                    route: "/jobs".into(),
                }),
            ),
            NotificationBody::PartnerRequest { message } => (
                "New partnership request".to_string(),
                message
                    .clone()
                    .unwrap_or_else(|| SYSTEM_FALLBACK_DESCRIPTION.into()),
                ToastVariant::Default,
                link_action("View"),
            ),
            NotificationBody::System { message, .. } => (
                message.clone().unwrap_or_else(|| "Notification".into()),
                message
                    .clone()
                    .unwrap_or_else(|| SYSTEM_FALLBACK_DESCRIPTION.into()),
                ToastVariant::Default,
                link_action("View"),
            ),
        };

        Toast {
            title,
            description,
            variant,
            duration_ms: TOAST_DURATION_MS,
            action,
        }
    }

    /// Cached read-models this notification makes stale.
    pub fn invalidates(&self) -> Vec<&'static str> {
        let partner_link = self
            .link
            .as_deref()
            .is_some_and(|link| link.contains("partners"));
        if self.kind() == NotificationKind::PartnerRequest || partner_link {
            vec![PARTNERSHIP_REQUESTS_KEY]
        } else {
            Vec::new()
        }
    }
}

/// Look `key` up in the envelope's `data` object, then at the top level.
fn field(raw: &Value, key: &str) -> Option<String> {
    data_field(raw, key).or_else(|| raw.get(key).and_then(scalar))
}

fn data_field(raw: &Value, key: &str) -> Option<String> {
    raw.get("data").and_then(|data| data.get(key)).and_then(scalar)
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Newest-first log with a fixed capacity.
#[derive(Debug, Clone)]
pub struct NotificationLog {
    entries: VecDeque<Notification>,
    cap: usize,
}

impl NotificationLog {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    pub fn push(&mut self, notification: Notification) {
        self.entries.push_front(notification);
        self.entries.truncate(self.cap);
    }

    pub fn head(&self) -> Option<&Notification> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Envelope ids already delivered in-app, shared with the push fallback so
/// the same logical event never fires on both surfaces.
#[derive(Debug, Clone, Default)]
pub struct DeliveryLedger {
    inner: Arc<Mutex<LedgerState>>,
}

#[derive(Debug, Default)]
struct LedgerState {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id`. Returns false if it was already recorded.
    pub fn record(&self, id: &str) -> bool {
        let mut state = self.lock();
        if !state.seen.insert(id.to_string()) {
            return false;
        }
        state.order.push_back(id.to_string());
        if state.order.len() > LEDGER_CAPACITY {
            if let Some(oldest) = state.order.pop_front() {
                state.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().seen.contains(id)
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct RouterState {
    log: NotificationLog,
    unread: usize,
}

/// Owner of the notification log and unread counter.
///
/// Clones share state; only the router's own handlers mutate it.
#[derive(Clone)]
pub struct NotificationRouter {
    state: Arc<Mutex<RouterState>>,
    effects: SideEffects,
    ledger: DeliveryLedger,
    bus: EventBus,
    sound_path: Arc<str>,
}

impl NotificationRouter {
    pub fn new(
        effects: SideEffects,
        ledger: DeliveryLedger,
        bus: EventBus,
        sound_path: impl Into<String>,
        log_cap: usize,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(RouterState {
                log: NotificationLog::new(log_cap),
                unread: 0,
            })),
            effects,
            ledger,
            bus,
            sound_path: Arc::from(sound_path.into()),
        }
    }

    /// Subscribe to `connection` and route its notification and app events
    /// on a background task, which ends with the subscription.
    pub fn spawn(&self, connection: &ConnectionHandle) -> JoinHandle<()> {
        let subscription = connection.subscribe();
        tokio::spawn(self.clone().run(subscription))
    }

    async fn run(self, mut subscription: Subscription) {
        debug!("Notification router started");
        while let Some(event) = subscription.recv().await {
            match event {
                ConnectionEvent::Server(ServerEvent::Notification(raw)) => {
                    self.handle(raw);
                }
                ConnectionEvent::Server(ServerEvent::AppEvent(app)) => {
                    self.handle_app_event(&app);
                }
                _ => {}
            }
        }
        debug!("Notification router stopped");
    }

    /// Classify and dispatch one envelope. Returns `None` when the envelope
    /// was already handled.
    pub fn handle(&self, raw: Value) -> Option<Notification> {
        let notification = Notification::classify(raw, Utc::now());

        if notification.server_assigned && !self.ledger.record(&notification.id) {
            debug!(id = %notification.id, "Duplicate notification ignored");
            return None;
        }

        let unread = {
            let mut state = self.lock();
            state.log.push(notification.clone());
            state.unread += 1;
            state.unread
        };

        info!(
            id = %notification.id,
            kind = ?notification.kind(),
            unread,
            "Notification received"
        );
        self.bus.emit_event(UiEvent::NotificationReceived {
            id: notification.id.clone(),
            kind: notification.kind(),
            unread,
        });

        if let Err(e) = self.effects.sound.play(&self.sound_path) {
            debug!(error = %e, "Notification sound not played");
        }

        self.raise_toast(notification.toast());

        for key in notification.invalidates() {
            self.invalidate(key);
        }

        Some(notification)
    }

    /// Entity-change broadcasts: refresh affected lists, no log entry.
    pub fn handle_app_event(&self, event: &AppEvent) {
        match event.kind.as_str() {
            "BOOKING_UPDATE" | "NEW_BOOKING" => {
                debug!(kind = %event.kind, "Bookings changed");
                self.invalidate(BOOKINGS_KEY);
                self.raise_toast(Toast {
                    title: "Bookings updated".into(),
                    description: "The bookings list has changed".into(),
                    variant: ToastVariant::Info,
                    duration_ms: TOAST_DURATION_MS,
                    action: Some(ToastAction {
                        label: "View".into(),
                        route: "/bookings".into(),
                    }),
                });
            }
            other => debug!(kind = %other, "Ignoring app event"),
        }
    }

    /// Reset the unread counter. The log is left untouched.
    pub fn mark_all_read(&self) {
        self.lock().unread = 0;
        self.bus.emit_event(UiEvent::UnreadReset);
    }

    pub fn unread_count(&self) -> usize {
        self.lock().unread
    }

    /// Logged notifications, newest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().log.iter().cloned().collect()
    }

    /// Counter text for the bell icon.
    pub fn badge_label(&self) -> String {
        match self.unread_count() {
            0 => String::new(),
            n if n > 99 => "99+".to_string(),
            n => n.to_string(),
        }
    }

    pub fn ledger(&self) -> &DeliveryLedger {
        &self.ledger
    }

    fn raise_toast(&self, toast: Toast) {
        if let Err(e) = self.effects.toaster.show(&toast) {
            warn!(error = %e, "Toast not shown");
        }
        self.bus.emit_event(UiEvent::ToastRaised { toast });
    }

    fn invalidate(&self, key: &str) {
        if let Err(e) = self.effects.cache.invalidate(key) {
            warn!(key, error = %e, "Cache invalidation failed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for NotificationRouter {
    fn default() -> Self {
        Self::new(
            SideEffects::logging(),
            DeliveryLedger::new(),
            EventBus::new(),
            souk_shared::constants::DEFAULT_NOTIFICATION_SOUND,
            DEFAULT_NOTIFICATION_LOG_CAP,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::testing::RecordingEffects;
    use serde_json::json;

    fn router_with(effects: &Arc<RecordingEffects>, cap: usize) -> NotificationRouter {
        NotificationRouter::new(
            effects.side_effects(),
            DeliveryLedger::new(),
            EventBus::new(),
            "/sounds/notification.wav",
            cap,
        )
    }

    #[test]
    fn test_token_notification() {
        let effects = Arc::new(RecordingEffects::default());
        let router = router_with(&effects, 200);

        router.handle(json!({"type": "TOKEN", "tokenCode": "ABC123", "orderNumber": "7"}));

        let log = router.notifications();
        assert_eq!(log.len(), 1);
        assert_eq!(
            log[0].body,
            NotificationBody::Token {
                entity_id: None,
                token_code: Some("ABC123".into()),
                order_number: Some("7".into()),
                mobile_number: None,
                status: None,
            }
        );
        assert_eq!(router.unread_count(), 1);

        let toasts = effects.toasts();
        assert_eq!(toasts.len(), 1);
        assert_eq!(toasts[0].description, "Token: ABC123");
        assert_eq!(toasts[0].variant, ToastVariant::Success);
        assert_eq!(toasts[0].action.as_ref().unwrap().route, "/tokens");
        assert_eq!(effects.sound_count(), 1);
    }

    #[test]
    fn test_job_fields_read_from_data() {
        let effects = Arc::new(RecordingEffects::default());
        let router = router_with(&effects, 200);

        router.handle(json!({
            "type": "JOB",
            "data": {"id": 12, "location": "Kazan", "cost": 1500, "postedBy": "u4"}
        }));

        let head = &router.notifications()[0];
        assert_eq!(head.kind(), NotificationKind::Job);
        assert!(head.id.starts_with("local-"));
        assert!(!head.server_assigned);
        assert!(matches!(
            &head.body,
            NotificationBody::Job { entity_id: Some(id), .. } if id == "12"
        ));
        assert_eq!(effects.toasts()[0].description, "Kazan | 1500₽");
        assert_eq!(effects.toasts()[0].action.as_ref().unwrap().route, "/jobs");
    }

    #[test]
    fn test_unknown_and_malformed_envelopes_are_kept() {
        let effects = Arc::new(RecordingEffects::default());
        let router = router_with(&effects, 200);

        router.handle(json!({"type": "SOMETHING_NEW", "message": "Disk almost full"}));
        router.handle(json!({"message": "no tag at all"}));
        router.handle(json!(42));
        router.handle(Value::Null);

        assert_eq!(router.unread_count(), 4);
        let log = router.notifications();
        assert!(log.iter().all(|n| n.kind() == NotificationKind::System));
        assert_eq!(
            log[3].body,
            NotificationBody::System {
                message: Some("Disk almost full".into()),
                tag: Some("SOMETHING_NEW".into()),
            }
        );

        let toasts = effects.toasts();
        assert_eq!(toasts[0].title, "Disk almost full");
        assert_eq!(toasts[2].title, "Notification");
        assert_eq!(toasts[2].description, "New message from the system");
    }

    #[test]
    fn test_mark_all_read_keeps_log() {
        let effects = Arc::new(RecordingEffects::default());
        let router = router_with(&effects, 200);
        router.handle(json!({"type": "SYSTEM", "message": "a"}));
        router.handle(json!({"type": "SYSTEM", "message": "b"}));

        router.mark_all_read();

        assert_eq!(router.unread_count(), 0);
        assert_eq!(router.notifications().len(), 2);
        assert_eq!(router.badge_label(), "");
    }

    #[test]
    fn test_duplicate_server_id_counted_once() {
        let effects = Arc::new(RecordingEffects::default());
        let router = router_with(&effects, 200);
        let envelope = json!({"id": "n-1", "type": "SYSTEM", "message": "hello"});

        assert!(router.handle(envelope.clone()).is_some());
        assert!(router.handle(envelope).is_none());

        assert_eq!(router.unread_count(), 1);
        assert_eq!(effects.toasts().len(), 1);
        assert!(router.ledger().contains("n-1"));
    }

    #[test]
    fn test_shared_entity_id_is_not_a_duplicate() {
        let effects = Arc::new(RecordingEffects::default());
        let router = router_with(&effects, 200);

        assert!(router
            .handle(json!({"type": "TOKEN", "data": {"id": 12, "tokenCode": "A1"}}))
            .is_some());
        assert!(router
            .handle(json!({"type": "JOB", "data": {"id": 12, "location": "Kazan"}}))
            .is_some());
        assert!(router
            .handle(json!({"type": "TOKEN", "data": {"id": 12, "status": "USED"}}))
            .is_some());

        assert_eq!(router.unread_count(), 3);
        assert_eq!(router.notifications().len(), 3);
        assert_eq!(effects.toasts().len(), 3);
        assert!(!router.ledger().contains("12"));
    }

    #[test]
    fn test_envelopes_without_id_always_count() {
        let effects = Arc::new(RecordingEffects::default());
        let router = router_with(&effects, 200);
        router.handle(json!({"type": "SYSTEM", "message": "x"}));
        router.handle(json!({"type": "SYSTEM", "message": "x"}));

        assert_eq!(router.unread_count(), 2);
        let log = router.notifications();
        assert!(log[0].id.starts_with("local-"));
        assert_ne!(log[0].id, log[1].id);
    }

    #[test]
    fn test_blocked_audio_does_not_stop_handler() {
        let effects = Arc::new(RecordingEffects {
            block_audio: true,
            ..Default::default()
        });
        let router = router_with(&effects, 200);

        router.handle(json!({"type": "PARTNER_REQUEST", "message": "Acme wants in"}));

        assert_eq!(router.unread_count(), 1);
        assert_eq!(effects.toasts()[0].description, "Acme wants in");
        assert_eq!(effects.toasts().len(), 1);
        assert_eq!(effects.invalidated(), vec![PARTNERSHIP_REQUESTS_KEY]);
    }

    #[test]
    fn test_partner_request_without_message() {
        let effects = Arc::new(RecordingEffects::default());
        let router = router_with(&effects, 200);

        router.handle(json!({"type": "PARTNER_REQUEST"}));

        let toast = &effects.toasts()[0];
        assert_eq!(toast.title, "New partnership request");
        assert_eq!(toast.description, "New message from the system");
    }

    #[test]
    fn test_partner_link_invalidates() {
        let effects = Arc::new(RecordingEffects::default());
        let router = router_with(&effects, 200);

        router.handle(json!({"type": "SYSTEM", "message": "Updated", "link": "/partners/9"}));
        router.handle(json!({"type": "SYSTEM", "message": "Other", "link": "/tokens"}));

        assert_eq!(effects.invalidated(), vec![PARTNERSHIP_REQUESTS_KEY]);
        let toast = &effects.toasts()[0];
        assert_eq!(toast.action.as_ref().unwrap().route, "/partners/9");
    }

    #[test]
    fn test_log_is_capped_but_counter_is_not() {
        let effects = Arc::new(RecordingEffects::default());
        let router = router_with(&effects, 3);
        for i in 0..5 {
            router.handle(json!({"type": "SYSTEM", "message": format!("m{i}")}));
        }

        assert_eq!(router.unread_count(), 5);
        let log = router.notifications();
        assert_eq!(log.len(), 3);
        assert_eq!(
            log[0].body,
            NotificationBody::System {
                message: Some("m4".into()),
                tag: None,
            }
        );
    }

    #[test]
    fn test_booking_app_event() {
        let effects = Arc::new(RecordingEffects::default());
        let router = router_with(&effects, 200);

        router.handle_app_event(&AppEvent::from_value(json!({"type": "NEW_BOOKING"})));
        router.handle_app_event(&AppEvent::from_value(json!({"type": "FRIEND_ADDED"})));

        assert_eq!(effects.invalidated(), vec![BOOKINGS_KEY]);
        assert_eq!(effects.toasts().len(), 1);
        assert_eq!(router.unread_count(), 0);
        assert!(router.notifications().is_empty());
    }

    #[test]
    fn test_badge_label() {
        let effects = Arc::new(RecordingEffects::default());
        let router = router_with(&effects, 10);
        router.handle(json!({"type": "SYSTEM"}));
        assert_eq!(router.badge_label(), "1");

        for _ in 0..99 {
            router.handle(json!({"type": "SYSTEM"}));
        }
        assert_eq!(router.badge_label(), "99+");
    }

    #[test]
    fn test_created_at_parsed_or_defaulted() {
        let received = Utc::now();
        let parsed = Notification::classify(
            json!({"type": "SYSTEM", "createdAt": "2024-05-01T10:00:00Z"}),
            received,
        );
        assert_eq!(parsed.created_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");

        let defaulted = Notification::classify(json!({"type": "SYSTEM"}), received);
        assert_eq!(defaulted.created_at, received);
    }

    #[tokio::test]
    async fn test_router_task_consumes_connection() {
        use souk_net::{memory_transport, ConnectionManager, ReconnectPolicy};
        use souk_shared::constants::EVENT_NOTIFICATION;
        use souk_shared::Identity;
        use std::time::Duration;

        let (connector, mut hub) = memory_transport();
        let manager = ConnectionManager::new(Arc::new(connector), ReconnectPolicy::default());
        let bus = EventBus::new();
        let mut ui = bus.subscribe();
        let router = NotificationRouter::new(
            SideEffects::logging(),
            DeliveryLedger::new(),
            bus,
            "/sounds/notification.wav",
            200,
        );
        let _task = router.spawn(&manager.handle());

        manager.open(Identity::new("admin", None)).await;
        let peer = hub.accept().await.unwrap();
        peer.send_event(EVENT_NOTIFICATION, json!({"type": "TOKEN", "tokenCode": "Z9"}));

        let event = tokio::time::timeout(Duration::from_secs(2), ui.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            UiEvent::NotificationReceived {
                kind: NotificationKind::Token,
                unread: 1,
                ..
            }
        ));
    }
}
