//! Push relay and notification-click routing.
//!
//! Every push is relayed to all clients as `PUSH_RECEIVED` for the in-app
//! notification center. A system notification is shown only when no client
//! is focused; a focused user already sees the in-app entry.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{PushNotice, Worker, WorkerMessage};
use crate::clients::ClientId;

const DEFAULT_TITLE: &str = "Notification";
const DEFAULT_BODY: &str = "You have a new notification";
const DEFAULT_ICON: &str = "/static/icon-192.png";
const DEFAULT_TAG: &str = "notification";
const NOTICE_ICON: &str = "🔔";
const VIBRATE_PATTERN: [u32; 3] = [200, 100, 200];

/// Application data carried by a push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushData {
  pub tag: Option<String>,
  pub require_interaction: Option<bool>,
  pub url: Option<String>,
  #[serde(rename = "type")]
  pub kind: Option<String>,
  pub icon: Option<String>,
  pub chat_id: Option<serde_json::Value>,
  pub reminder_id: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PushPayload {
  title: Option<String>,
  body: Option<String>,
  icon: Option<String>,
  badge: Option<String>,
  data: Option<PushData>,
}

/// A system notification to display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub tag: String,
  pub require_interaction: bool,
  pub vibrate: Vec<u32>,
  pub data: PushData,
}

impl Default for Notification {
  fn default() -> Self {
    Self {
      title: DEFAULT_TITLE.to_string(),
      body: DEFAULT_BODY.to_string(),
      icon: DEFAULT_ICON.to_string(),
      badge: DEFAULT_ICON.to_string(),
      tag: DEFAULT_TAG.to_string(),
      require_interaction: false,
      vibrate: Vec::new(),
      data: PushData::default(),
    }
  }
}

impl Notification {
  /// Build a notification from a raw push payload.
  ///
  /// Missing or empty fields fall back to defaults; a payload that is not
  /// JSON keeps the defaults and becomes the body text.
  pub fn from_payload(payload: Option<&[u8]>) -> Self {
    let Some(raw) = payload else {
      return Self::default();
    };

    match serde_json::from_slice::<PushPayload>(raw) {
      Ok(p) => {
        let data = p.data.unwrap_or_default();
        let defaults = Self::default();
        let given = |field: Option<String>, default: String| {
          field.filter(|s| !s.is_empty()).unwrap_or(default)
        };
        Self {
          title: given(p.title, defaults.title),
          body: given(p.body, defaults.body),
          icon: given(p.icon, defaults.icon),
          badge: given(p.badge, defaults.badge),
          tag: given(data.tag.clone(), defaults.tag),
          require_interaction: data.require_interaction.unwrap_or(false),
          vibrate: VIBRATE_PATTERN.to_vec(),
          data,
        }
      }
      Err(e) => {
        warn!(error = %e, "push payload is not JSON");
        Self {
          body: String::from_utf8_lossy(raw).into_owned(),
          ..Self::default()
        }
      }
    }
  }

  fn notice(&self) -> PushNotice {
    PushNotice {
      title: self.title.clone(),
      body: self.body.clone(),
      icon: self
        .data
        .icon
        .clone()
        .unwrap_or_else(|| NOTICE_ICON.to_string()),
      url: self.data.url.clone(),
      notification_type: self.data.kind.clone().unwrap_or_else(|| "info".to_string()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
  /// Clients that received `PUSH_RECEIVED`
  pub relayed: usize,
  /// The system notification, unless a focused client suppressed it
  pub shown: Option<Notification>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickAction {
  /// An open client already shows the target; it was focused
  Focus(ClientId),
  /// No client matched; a new one should open at this URL
  Open(String),
}

fn id_string(value: &serde_json::Value) -> String {
  match value {
    serde_json::Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

/// Where a notification click should take the user.
pub fn click_target(data: &PushData) -> String {
  match (data.kind.as_deref(), &data.chat_id, &data.reminder_id) {
    (Some("chat"), Some(id), _) => format!("/chat/{}", id_string(id)),
    (Some("reminder"), _, Some(id)) => format!("/reminders?id={}", id_string(id)),
    _ => data.url.clone().unwrap_or_else(|| "/".to_string()),
  }
}

impl Worker {
  pub fn on_push(&self, payload: Option<&[u8]>) -> PushOutcome {
    let notification = Notification::from_payload(payload);
    let clients = self.ctx.clients.snapshot();
    debug!(clients = clients.len(), title = %notification.title, "push received");

    let relayed = self
      .ctx
      .clients
      .broadcast(&WorkerMessage::PushReceived(notification.notice()));

    if let Some(focused) = clients.iter().find(|c| c.focused) {
      info!(client = focused.id, "focused client present, notification suppressed");
      return PushOutcome {
        relayed,
        shown: None,
      };
    }

    info!(title = %notification.title, "showing notification");
    PushOutcome {
      relayed,
      shown: Some(notification),
    }
  }

  pub fn on_notification_click(&self, data: &PushData) -> ClickAction {
    let target = click_target(data);

    let existing = self
      .ctx
      .clients
      .snapshot()
      .into_iter()
      .find(|c| c.url.as_str().contains(&target));

    match existing {
      Some(client) => {
        self.ctx.clients.focus(client.id);
        ClickAction::Focus(client.id)
      }
      None => ClickAction::Open(target),
    }
  }
}
