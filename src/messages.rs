//! Typed messages exchanged between tabs and the background context.
//!
//! The wire format is JSON tagged by `type`. Anything that does not parse
//! into one of these variants is rejected at the boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tab → background context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
  /// Flush the outbox now
  #[serde(rename = "SYNC_NOW")]
  SyncRequested {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
  },
}

/// Background context → every tab
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
  /// These outbox items were accepted by the backend and cleared
  #[serde(rename = "OUTBOX_SENT")]
  OutboxFlushed {
    #[serde(rename = "processedIds")]
    ids: Vec<i64>,
  },
}

#[derive(Debug, Error)]
pub enum MessageError {
  #[error("rejected message: {0}")]
  Malformed(#[from] serde_json::Error),
}

impl WorkerMessage {
  /// Parse a message posted by a tab.
  pub fn from_json(raw: &str) -> Result<Self, MessageError> {
    Ok(serde_json::from_str(raw)?)
  }
}

impl ClientMessage {
  pub fn to_json(&self) -> Result<String, MessageError> {
    Ok(serde_json::to_string(self)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sync_now_parses_with_and_without_tag() {
    assert_eq!(
      WorkerMessage::from_json(r#"{"type":"SYNC_NOW","tag":"sync-entries"}"#).unwrap(),
      WorkerMessage::SyncRequested {
        tag: Some("sync-entries".to_string())
      }
    );
    assert_eq!(
      WorkerMessage::from_json(r#"{"type":"SYNC_NOW"}"#).unwrap(),
      WorkerMessage::SyncRequested { tag: None }
    );
  }

  #[test]
  fn test_unknown_message_is_rejected() {
    assert!(WorkerMessage::from_json(r#"{"type":"SKIP_WAITING"}"#).is_err());
    assert!(WorkerMessage::from_json(r#"{"kind":"SYNC_NOW"}"#).is_err());
    assert!(WorkerMessage::from_json("not json").is_err());
  }

  #[test]
  fn test_outbox_sent_wire_format() {
    let msg = ClientMessage::OutboxFlushed { ids: vec![3, 7] };
    assert_eq!(
      msg.to_json().unwrap(),
      r#"{"type":"OUTBOX_SENT","processedIds":[3,7]}"#
    );
    let back: ClientMessage = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
    assert_eq!(back, msg);
  }
}
