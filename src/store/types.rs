use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A write waiting to be confirmed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxItem {
  pub id: i64,
  pub payload: Value,
  #[serde(rename = "createdAt", with = "chrono::serde::ts_milliseconds")]
  pub created_at: DateTime<Utc>,
}

/// Mirror row shown by the UI without asking the background context.
///
/// `pending` is true and `outbox_id` is set exactly when the entry stands
/// for an unsent outbox item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
  pub id: i64,
  pub text: String,
  #[serde(rename = "createdAt", with = "chrono::serde::ts_milliseconds")]
  pub created_at: DateTime<Utc>,
  pub pending: bool,
  #[serde(rename = "outboxId")]
  pub outbox_id: Option<i64>,
}

/// Mirror row to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
  pub text: String,
  pub pending: bool,
  pub outbox_id: Option<i64>,
}

impl NewEntry {
  /// Entry for a write that went straight to the backend.
  pub fn sent(text: impl Into<String>) -> Self {
    Self {
      text: text.into(),
      pending: false,
      outbox_id: None,
    }
  }

  /// Entry standing for a queued outbox item.
  pub fn pending(text: impl Into<String>, outbox_id: i64) -> Self {
    Self {
      text: text.into(),
      pending: true,
      outbox_id: Some(outbox_id),
    }
  }
}

/// Ids produced by queueing a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedWrite {
  pub outbox_id: i64,
  /// Missing when the mirror insert failed after the item was queued
  pub entry_id: Option<i64>,
}

/// Text the mirror shows for a payload: `"title — note"` when titled,
/// otherwise the payload's `text` field.
pub fn mirror_text(payload: &Value) -> String {
  let field = |name: &str| payload.get(name).and_then(Value::as_str);

  match field("title") {
    Some(title) if !title.is_empty() => {
      format!("{} — {}", title, field("note").unwrap_or("")).trim().to_string()
    }
    _ => field("text").unwrap_or("").to_string(),
  }
}
