//! Push fallback delivery.
//!
//! Renders platform notifications from push payloads when the live
//! connection is not around to deliver them, and routes clicks back to an
//! open console surface. Independent of the connection manager; the only
//! shared piece is the [`DeliveryLedger`], which suppresses pushes the
//! in-app router already showed.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use souk_shared::constants::{PUSH_DEFAULT_BODY, PUSH_DEFAULT_TITLE, PUSH_DEFAULT_URL, PUSH_ICON};

use crate::error::SideEffectError;
use crate::notifications::DeliveryLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPermission {
    Granted,
    Denied,
    /// The user has not been asked yet.
    Default,
    Unsupported,
}

/// An open console window or tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSurface {
    pub id: String,
    pub url: String,
}

/// A notification as handed to the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformNotification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    /// Envelope id, when the server sent one.
    pub tag: Option<String>,
    /// Deep link opened on click.
    pub url: String,
}

/// The host platform's notification and window APIs.
#[async_trait]
pub trait PushPlatform: Send + Sync {
    fn permission(&self) -> PushPermission;

    async fn show(&self, notification: &PlatformNotification) -> Result<(), SideEffectError>;

    async fn close(&self, notification: &PlatformNotification);

    /// Open console surfaces, in platform order.
    async fn surfaces(&self) -> Vec<ClientSurface>;

    async fn focus(&self, surface: &ClientSurface) -> Result<(), SideEffectError>;

    async fn open(&self, url: &str) -> Result<(), SideEffectError>;
}

/// Push message body. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl PushPayload {
    /// Parse push data. Missing or unreadable data yields an empty payload.
    pub fn parse(data: Option<&[u8]>) -> Self {
        let Some(bytes) = data else {
            return Self::default();
        };
        match serde_json::from_slice(bytes) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Unreadable push payload, using defaults");
                Self::default()
            }
        }
    }

    pub fn into_notification(self) -> PlatformNotification {
        PlatformNotification {
            title: non_empty(self.title).unwrap_or_else(|| PUSH_DEFAULT_TITLE.to_string()),
            body: non_empty(self.body).unwrap_or_else(|| PUSH_DEFAULT_BODY.to_string()),
            icon: PUSH_ICON.to_string(),
            badge: PUSH_ICON.to_string(),
            tag: non_empty(self.id),
            url: non_empty(self.url).unwrap_or_else(|| PUSH_DEFAULT_URL.to_string()),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

/// What a notification click ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    Focused(String),
    Opened(String),
    Failed,
}

/// Registered push handler.
#[derive(Clone)]
pub struct PushFallback {
    platform: Arc<dyn PushPlatform>,
    ledger: DeliveryLedger,
}

impl PushFallback {
    /// Install the handler. Returns `None` unless push permission has been
    /// granted: reduced capability, not an error.
    pub fn register(platform: Arc<dyn PushPlatform>, ledger: DeliveryLedger) -> Option<Self> {
        match platform.permission() {
            PushPermission::Granted => {
                info!("Push fallback registered");
                Some(Self { platform, ledger })
            }
            other => {
                info!(permission = ?other, "Push fallback not activated");
                None
            }
        }
    }

    /// Handle one push event. Returns the notification shown, if any.
    pub async fn on_push(&self, data: Option<&[u8]>) -> Option<PlatformNotification> {
        if self.platform.permission() != PushPermission::Granted {
            debug!("Push permission revoked, ignoring push");
            return None;
        }

        let notification = PushPayload::parse(data).into_notification();

        if let Some(id) = &notification.tag {
            if self.ledger.contains(id) {
                debug!(id = %id, "Already delivered in-app, push suppressed");
                return None;
            }
        }

        if let Err(e) = self.platform.show(&notification).await {
            warn!(error = %e, "Platform notification not shown");
            return None;
        }
        Some(notification)
    }

    /// Close the notification, then focus an open surface or open a new
    /// one at the notification's deep link.
    pub async fn on_click(&self, notification: &PlatformNotification) -> ClickOutcome {
        self.platform.close(notification).await;

        if let Some(surface) = self.platform.surfaces().await.into_iter().next() {
            return match self.platform.focus(&surface).await {
                Ok(()) => ClickOutcome::Focused(surface.id),
                Err(e) => {
                    warn!(error = %e, "Could not focus console window");
                    ClickOutcome::Failed
                }
            };
        }

        match self.platform.open(&notification.url).await {
            Ok(()) => ClickOutcome::Opened(notification.url.clone()),
            Err(e) => {
                warn!(url = %notification.url, error = %e, "Could not open console window");
                ClickOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakePlatform {
        permission: Mutex<PushPermission>,
        surfaces: Vec<ClientSurface>,
        shown: Mutex<Vec<PlatformNotification>>,
        closed: Mutex<usize>,
        opened: Mutex<Vec<String>>,
        focused: Mutex<Vec<String>>,
    }

    impl FakePlatform {
        fn new(permission: PushPermission, surfaces: Vec<ClientSurface>) -> Arc<Self> {
            Arc::new(Self {
                permission: Mutex::new(permission),
                surfaces,
                shown: Mutex::new(Vec::new()),
                closed: Mutex::new(0),
                opened: Mutex::new(Vec::new()),
                focused: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PushPlatform for FakePlatform {
        fn permission(&self) -> PushPermission {
            *self.permission.lock().unwrap()
        }

        async fn show(&self, notification: &PlatformNotification) -> Result<(), SideEffectError> {
            self.shown.lock().unwrap().push(notification.clone());
            Ok(())
        }

        async fn close(&self, _notification: &PlatformNotification) {
            *self.closed.lock().unwrap() += 1;
        }

        async fn surfaces(&self) -> Vec<ClientSurface> {
            self.surfaces.clone()
        }

        async fn focus(&self, surface: &ClientSurface) -> Result<(), SideEffectError> {
            self.focused.lock().unwrap().push(surface.id.clone());
            Ok(())
        }

        async fn open(&self, url: &str) -> Result<(), SideEffectError> {
            self.opened.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    fn surface(id: &str) -> ClientSurface {
        ClientSurface {
            id: id.into(),
            url: "https://console.example/".into(),
        }
    }

    #[test]
    fn test_registration_requires_permission() {
        for permission in [
            PushPermission::Denied,
            PushPermission::Default,
            PushPermission::Unsupported,
        ] {
            let platform = FakePlatform::new(permission, vec![]);
            assert!(PushFallback::register(platform, DeliveryLedger::new()).is_none());
        }

        let platform = FakePlatform::new(PushPermission::Granted, vec![]);
        assert!(PushFallback::register(platform, DeliveryLedger::new()).is_some());
    }

    #[test]
    fn test_payload_defaults() {
        let notification = PushPayload::parse(None).into_notification();
        assert_eq!(notification.title, "New Notification");
        assert_eq!(notification.body, "You have a new update.");
        assert_eq!(notification.url, "/");
        assert_eq!(notification.icon, "/icons/icon-192x192.png");
        assert_eq!(notification.badge, notification.icon);

        let garbage = PushPayload::parse(Some(b"not json"));
        assert_eq!(garbage, PushPayload::default());
    }

    #[tokio::test]
    async fn test_push_shows_notification() {
        let platform = FakePlatform::new(PushPermission::Granted, vec![]);
        let push = PushFallback::register(platform.clone(), DeliveryLedger::new()).unwrap();

        let shown = push
            .on_push(Some(br#"{"title":"New booking","body":"Order 7","url":"/bookings"}"#))
            .await
            .unwrap();

        assert_eq!(shown.title, "New booking");
        assert_eq!(shown.url, "/bookings");
        assert_eq!(platform.shown.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_push_suppressed_when_delivered_in_app() {
        let platform = FakePlatform::new(PushPermission::Granted, vec![]);
        let ledger = DeliveryLedger::new();
        ledger.record("n-7");
        let push = PushFallback::register(platform.clone(), ledger).unwrap();

        assert!(push.on_push(Some(br#"{"id":"n-7","title":"dup"}"#)).await.is_none());
        assert!(push.on_push(Some(br#"{"id":"n-8","title":"new"}"#)).await.is_some());
        assert_eq!(platform.shown.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_push_ignored_after_permission_revoked() {
        let platform = FakePlatform::new(PushPermission::Granted, vec![]);
        let push = PushFallback::register(platform.clone(), DeliveryLedger::new()).unwrap();
        *platform.permission.lock().unwrap() = PushPermission::Denied;

        assert!(push.on_push(None).await.is_none());
        assert!(platform.shown.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_click_focuses_first_open_surface() {
        let platform =
            FakePlatform::new(PushPermission::Granted, vec![surface("tab-1"), surface("tab-2")]);
        let push = PushFallback::register(platform.clone(), DeliveryLedger::new()).unwrap();
        let notification = PushPayload::default().into_notification();

        let outcome = push.on_click(&notification).await;

        assert_eq!(outcome, ClickOutcome::Focused("tab-1".into()));
        assert_eq!(*platform.closed.lock().unwrap(), 1);
        assert!(platform.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_click_opens_deep_link_without_surfaces() {
        let platform = FakePlatform::new(PushPermission::Granted, vec![]);
        let push = PushFallback::register(platform.clone(), DeliveryLedger::new()).unwrap();
        let notification = PushPayload {
            url: Some("/partners".into()),
            ..Default::default()
        }
        .into_notification();

        let outcome = push.on_click(&notification).await;

        assert_eq!(outcome, ClickOutcome::Opened("/partners".into()));
        assert_eq!(*platform.opened.lock().unwrap(), vec!["/partners".to_string()]);
    }
}
