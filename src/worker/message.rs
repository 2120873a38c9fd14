//! Control messages exchanged between client instances and the worker.
//!
//! Both directions are tagged on a `type` field. Unknown tags fail to parse
//! instead of being ignored.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};

/// Messages a client instance may post to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Activate the waiting generation now
  SkipWaiting,
  /// Delete every cache generation and acknowledge with `CACHE_CLEARED`
  ClearCache,
}

impl ClientMessage {
  pub fn parse(raw: &str) -> Result<Self> {
    serde_json::from_str(raw).map_err(|e| eyre!("Rejected control message {}: {}", raw, e))
  }
}

/// Messages delivered to client instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  CacheCleared,
  PushReceived(PushNotice),
  /// A new generation took control of this client
  ControllerChange { tag: String },
  /// The application version changed; the client must reload
  Reload { version: String },
}

impl WorkerMessage {
  pub fn to_json(&self) -> Result<String> {
    serde_json::to_string(self).map_err(|e| eyre!("Failed to encode message: {}", e))
  }
}

/// In-app notification center entry relayed for every push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushNotice {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub url: Option<String>,
  pub notification_type: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_known_messages() {
    assert_eq!(
      ClientMessage::parse(r#"{"type":"SKIP_WAITING"}"#).unwrap(),
      ClientMessage::SkipWaiting
    );
    assert_eq!(
      ClientMessage::parse(r#"{"type":"CLEAR_CACHE"}"#).unwrap(),
      ClientMessage::ClearCache
    );
  }

  #[test]
  fn test_rejects_unknown_tag() {
    let err = ClientMessage::parse(r#"{"type":"PURGE_EVERYTHING"}"#).unwrap_err();
    assert!(err.to_string().contains("PURGE_EVERYTHING"));
  }

  #[test]
  fn test_rejects_missing_tag() {
    assert!(ClientMessage::parse(r#"{"kind":"CLEAR_CACHE"}"#).is_err());
    assert!(ClientMessage::parse("not json").is_err());
  }

  #[test]
  fn test_worker_message_wire_format() {
    assert_eq!(
      WorkerMessage::CacheCleared.to_json().unwrap(),
      r#"{"type":"CACHE_CLEARED"}"#
    );

    let push = WorkerMessage::PushReceived(PushNotice {
      title: "Reminder".to_string(),
      body: "Call back".to_string(),
      icon: "🔔".to_string(),
      url: None,
      notification_type: "info".to_string(),
    });
    let json: serde_json::Value = serde_json::from_str(&push.to_json().unwrap()).unwrap();
    assert_eq!(json["type"], "PUSH_RECEIVED");
    assert_eq!(json["notificationType"], "info");
    assert!(json["url"].is_null());
  }
}
