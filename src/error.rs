//! Typed errors for the storage seams.

use thiserror::Error;

/// Failure of a storage operation (response cache or outbox store).
///
/// Every variant aborts the transaction it happened in; callers get the
/// error back instead of a partial write.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("{message}: {source}")]
  Database {
    message: String,
    #[source]
    source: rusqlite::Error,
  },

  #[error("failed to encode or decode stored JSON: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("storage lock poisoned: {0}")]
  LockPoisoned(String),

  #[error("failed to create storage directory {path}: {source}")]
  Io {
    path: std::path::PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("refusing to cache {url}: status {status} is not a success")]
  Rejected { url: String, status: u16 },

  #[error("corrupt row in {table}: {detail}")]
  Corrupt { table: &'static str, detail: String },
}

/// Build a `map_err` adapter that wraps a rusqlite error with context.
pub fn db(message: &'static str) -> impl FnOnce(rusqlite::Error) -> StoreError {
  move |source| StoreError::Database {
    message: message.to_string(),
    source,
  }
}
