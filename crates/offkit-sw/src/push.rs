//! Push messages and notification clicks.
//!
//! A push always produces a notification: every field the payload does not
//! supply, or supplies with the wrong type, falls back to its default.

use async_trait::async_trait;
use offkit_core::{AgentConfig, CacheVersion, ConfigError, NotificationDefaults};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::{ClientMatchOptions, ClientType, Clients};
use crate::extendable::ExtendableEvent;
use crate::ServiceWorkerError;

// ==================== Payload ====================

/// Fields a push payload may carry. All optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub icon: Option<String>,
    pub badge: Option<String>,
    pub url: Option<String>,
    pub tag: Option<String>,
}

impl NotificationPayload {
    /// Parse a raw push payload. Never fails.
    ///
    /// A JSON object is read field by field; text that is not JSON becomes
    /// the body; anything else yields an empty payload.
    pub fn parse(raw: Option<&[u8]>) -> Self {
        let Some(raw) = raw.filter(|r| !r.is_empty()) else {
            return Self::default();
        };

        match serde_json::from_slice::<Value>(raw) {
            Ok(Value::Object(map)) => Self {
                title: string_field(&map, "title"),
                body: string_field(&map, "body"),
                icon: string_field(&map, "icon"),
                badge: string_field(&map, "badge"),
                url: string_field(&map, "url"),
                tag: string_field(&map, "tag"),
            },
            Ok(Value::String(text)) => Self::text(&text),
            Ok(other) => {
                debug!(kind = json_kind(&other), "Ignoring non-object push payload");
                Self::default()
            }
            Err(_) => match std::str::from_utf8(raw) {
                Ok(text) => Self::text(text),
                Err(_) => {
                    debug!(len = raw.len(), "Ignoring binary push payload");
                    Self::default()
                }
            },
        }
    }

    fn text(text: &str) -> Self {
        let text = text.trim();
        Self {
            body: (!text.is_empty()).then(|| text.to_string()),
            ..Self::default()
        }
    }
}

fn string_field(map: &Map<String, Value>, name: &str) -> Option<String> {
    map.get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A notification ready to display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: Option<String>,
    pub tag: Option<String>,
    /// Opened or focused when the notification is clicked.
    pub url: Url,
}

/// Displays notifications on the host.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn show(&self, notification: &Notification) -> Result<(), ServiceWorkerError>;
}

/// Notifier that only logs, for hosts without a notification surface.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn show(&self, notification: &Notification) -> Result<(), ServiceWorkerError> {
        info!(title = %notification.title, body = %notification.body, url = %notification.url, "Notification");
        Ok(())
    }
}

// ==================== Dispatcher ====================

/// Turns push payloads into displayed notifications.
pub struct PushDispatcher {
    defaults: NotificationDefaults,
    scope: Url,
    notifier: Arc<dyn Notifier>,
}

impl PushDispatcher {
    pub fn new(defaults: NotificationDefaults, scope: Url, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            defaults,
            scope,
            notifier,
        }
    }

    pub fn from_config(config: &AgentConfig, notifier: Arc<dyn Notifier>) -> Result<Self, ConfigError> {
        Ok(Self::new(config.notification.clone(), config.scope_url()?, notifier))
    }

    /// Fill every missing field from the defaults.
    pub fn render(&self, payload: NotificationPayload) -> Notification {
        let url = payload
            .url
            .as_deref()
            .and_then(|target| match self.scope.join(target) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!(url = target, error = %e, "Invalid notification URL, using scope");
                    None
                }
            })
            .unwrap_or_else(|| self.scope.clone());

        Notification {
            title: payload.title.unwrap_or_else(|| self.defaults.title.clone()),
            body: payload.body.unwrap_or_else(|| self.defaults.body.clone()),
            icon: payload.icon.unwrap_or_else(|| self.defaults.icon.clone()),
            badge: payload.badge.or_else(|| self.defaults.badge.clone()),
            tag: payload.tag,
            url,
        }
    }

    /// Handle a push message.
    ///
    /// Resolves once the notifier has finished. A notifier failure is
    /// logged; the rendered notification is returned either way.
    pub async fn on_push(&self, raw: Option<&[u8]>) -> Notification {
        let notification = self.render(NotificationPayload::parse(raw));

        let mut event = ExtendableEvent::new("push");
        let notifier = &self.notifier;
        let shown = &notification;
        event.wait_until(async move {
            if let Err(e) = notifier.show(shown).await {
                warn!(title = %shown.title, error = %e, "Failed to show notification");
            }
        });
        event.settle().await;

        notification
    }
}

// ==================== Click ====================

/// What a notification click did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    /// An open window already showed the target URL.
    Focused(String),
    /// A new window was opened.
    Opened(String),
}

/// Focus a window already at the notification's URL, or open one.
pub fn handle_click(
    clients: &mut Clients,
    notification: &Notification,
    controller: Option<CacheVersion>,
) -> Result<ClickOutcome, ServiceWorkerError> {
    let options = ClientMatchOptions {
        include_uncontrolled: true,
        client_type: ClientType::Window,
    };
    let existing = clients
        .match_all(&options)
        .into_iter()
        .find(|c| c.url == notification.url)
        .map(|c| c.id.clone());

    match existing {
        Some(id) => {
            clients.focus(&id)?;
            debug!(client = %id, url = %notification.url, "Focused existing window");
            Ok(ClickOutcome::Focused(id))
        }
        None => {
            let client = clients.open_window(notification.url.clone(), controller);
            Ok(ClickOutcome::Opened(client.id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::Client;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        shown: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn show(&self, notification: &Notification) -> Result<(), ServiceWorkerError> {
            self.shown.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    struct BrokenNotifier;

    #[async_trait]
    impl Notifier for BrokenNotifier {
        async fn show(&self, _: &Notification) -> Result<(), ServiceWorkerError> {
            Err(ServiceWorkerError::Notification("permission denied".into()))
        }
    }

    fn dispatcher(notifier: Arc<dyn Notifier>) -> PushDispatcher {
        PushDispatcher::new(
            NotificationDefaults::default(),
            Url::parse("https://app.example/").unwrap(),
            notifier,
        )
    }

    #[tokio::test]
    async fn test_empty_push_uses_defaults() {
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = dispatcher(notifier.clone());

        let notification = dispatcher.on_push(None).await;
        assert_eq!(notification.title, "Offkit");
        assert_eq!(notification.body, "You have a new reminder.");
        assert_eq!(notification.url.as_str(), "https://app.example/");
        assert_eq!(notifier.shown.lock().unwrap().len(), 1);

        let empty = dispatcher.on_push(Some(b"")).await;
        assert_eq!(empty, notification);
    }

    #[tokio::test]
    async fn test_payload_rendered_exactly() {
        let dispatcher = dispatcher(Arc::new(RecordingNotifier::default()));
        let notification = dispatcher
            .on_push(Some(br#"{"title":"Streak reminder","body":"Come back today"}"#))
            .await;
        assert_eq!(notification.title, "Streak reminder");
        assert_eq!(notification.body, "Come back today");
        assert_eq!(notification.icon, "/icons/icon-192x192.png");
    }

    #[test]
    fn test_fields_default_independently() {
        let payload = NotificationPayload::parse(Some(
            br#"{"title": 42, "body": "  ", "icon": "/i.png", "url": "/roadmap/abc123"}"#,
        ));
        assert_eq!(payload.title, None);
        assert_eq!(payload.body, None);
        assert_eq!(payload.icon.as_deref(), Some("/i.png"));

        let notification = dispatcher(Arc::new(LogNotifier)).render(payload);
        assert_eq!(notification.title, "Offkit");
        assert_eq!(notification.icon, "/i.png");
        assert_eq!(notification.url.as_str(), "https://app.example/roadmap/abc123");
    }

    #[test]
    fn test_plain_text_becomes_body() {
        let payload = NotificationPayload::parse(Some(b"Time to practice"));
        assert_eq!(payload.body.as_deref(), Some("Time to practice"));
        assert_eq!(payload.title, None);

        let binary = NotificationPayload::parse(Some(&[0xff_u8, 0xfe, 0x00][..]));
        assert_eq!(binary, NotificationPayload::default());

        let array = NotificationPayload::parse(Some(b"[1, 2]"));
        assert_eq!(array, NotificationPayload::default());
    }

    #[tokio::test]
    async fn test_notifier_failure_still_returns_notification() {
        let dispatcher = dispatcher(Arc::new(BrokenNotifier));
        let notification = dispatcher.on_push(Some(br#"{"body":"hi"}"#)).await;
        assert_eq!(notification.body, "hi");
    }

    #[test]
    fn test_click_focuses_matching_window() {
        let dispatcher = dispatcher(Arc::new(LogNotifier));
        let notification = dispatcher.render(NotificationPayload {
            url: Some("/dashboard".into()),
            ..Default::default()
        });

        let mut clients = Clients::new();
        clients.add(Client::window("tab-1", Url::parse("https://app.example/dashboard").unwrap()));
        clients.add(Client::window("tab-2", Url::parse("https://app.example/").unwrap()));

        let outcome = handle_click(&mut clients, &notification, None).unwrap();
        assert_eq!(outcome, ClickOutcome::Focused("tab-1".to_string()));
        assert!(clients.get("tab-1").unwrap().focused);
    }

    #[test]
    fn test_click_opens_window_at_target() {
        let dispatcher = dispatcher(Arc::new(LogNotifier));
        let notification = dispatcher.render(NotificationPayload::default());

        let mut clients = Clients::new();
        clients.add(Client::window("tab-1", Url::parse("https://app.example/settings").unwrap()));

        let outcome = handle_click(&mut clients, &notification, None).unwrap();
        let ClickOutcome::Opened(id) = outcome else {
            panic!("expected a new window");
        };
        assert_eq!(clients.get(&id).unwrap().url.as_str(), "https://app.example/");
        assert_eq!(clients.len(), 2);
    }
}
