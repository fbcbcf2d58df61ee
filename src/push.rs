//! Push payload rendering and notification click routing.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};
use url::Url;

use crate::clients::{ClientId, Clients};
use crate::config::PushConfig;

const DEFAULT_URL: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// A rendered notification, ready to show.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub image: Option<String>,
  pub tag: String,
  /// Target opened on click, relative to the origin
  pub url: String,
  /// Every payload field plus the resolved `url`
  pub data: Map<String, Value>,
  pub actions: Vec<NotificationAction>,
}

/// Decode a push body into an object. Missing, non-JSON, or non-object
/// payloads all yield an empty map.
pub fn parse_payload(raw: Option<&[u8]>) -> Map<String, Value> {
  let Some(raw) = raw else {
    return Map::new();
  };
  match serde_json::from_slice::<Value>(raw) {
    Ok(Value::Object(map)) => map,
    Ok(other) => {
      debug!(kind = ?other, "push payload is not an object, using defaults");
      Map::new()
    }
    Err(e) => {
      debug!(error = %e, "push payload is not JSON, using defaults");
      Map::new()
    }
  }
}

fn string_field(payload: &Map<String, Value>, name: &str) -> Option<String> {
  payload
    .get(name)
    .and_then(Value::as_str)
    .filter(|s| !s.is_empty())
    .map(str::to_string)
}

/// Render a notification from a raw push body.
pub fn render(raw: Option<&[u8]>, config: &PushConfig) -> Notification {
  let payload = parse_payload(raw);

  let url = string_field(&payload, "url").unwrap_or_else(|| DEFAULT_URL.to_string());
  let mut data = payload.clone();
  data.insert("url".to_string(), Value::String(url.clone()));

  Notification {
    title: string_field(&payload, "title").unwrap_or_else(|| config.title.clone()),
    body: string_field(&payload, "body").unwrap_or_else(|| config.body.clone()),
    icon: string_field(&payload, "icon").unwrap_or_else(|| config.icon.clone()),
    badge: string_field(&payload, "badge").unwrap_or_else(|| config.icon.clone()),
    image: string_field(&payload, "image"),
    tag: string_field(&payload, "tag").unwrap_or_else(|| config.tag.clone()),
    url,
    data,
    actions: vec![
      NotificationAction {
        action: "open".to_string(),
        title: "Abrir".to_string(),
      },
      NotificationAction {
        action: "dismiss".to_string(),
        title: "Descartar".to_string(),
      },
    ],
  }
}

/// Displays notifications to the user.
pub trait Notifier: Send + Sync + 'static {
  fn show(&self, notification: &Notification);
}

/// Notifier that writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn show(&self, notification: &Notification) {
    info!(
      title = %notification.title,
      body = %notification.body,
      tag = %notification.tag,
      url = %notification.url,
      "notification"
    );
  }
}

/// Where a notification click ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickOutcome {
  /// "dismiss" action: closed, nothing opened
  Dismissed,
  /// A tab already showing the target path was focused
  Focused(ClientId),
  /// Another tab of the origin was navigated to the target and focused
  Navigated(ClientId),
  /// No tab of the origin was open; a new one was opened
  Opened(ClientId),
}

/// Route a notification click to a tab.
pub fn route_click(
  clients: &Clients,
  origin: &Url,
  notification: &Notification,
  action: Option<&str>,
) -> ClickOutcome {
  if action == Some("dismiss") {
    return ClickOutcome::Dismissed;
  }

  let target = origin
    .join(&notification.url)
    .unwrap_or_else(|_| origin.clone());
  let same_origin: Vec<_> = clients
    .match_all()
    .into_iter()
    .filter(|c| c.url.origin() == origin.origin())
    .collect();

  if let Some(tab) = same_origin.iter().find(|c| c.url.path() == target.path()) {
    clients.focus(tab.id);
    return ClickOutcome::Focused(tab.id);
  }

  if let Some(tab) = same_origin.first() {
    clients.navigate(tab.id, target);
    clients.focus(tab.id);
    return ClickOutcome::Navigated(tab.id);
  }

  let opened = clients.open_window(target);
  ClickOutcome::Opened(opened.id)
}
