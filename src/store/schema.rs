//! Outbox store schema and upgrade policy.

use rusqlite::{params, Transaction};
use tracing::warn;

use crate::error::{db, StoreError};

/// Version written to `PRAGMA user_version` once the schema is current.
pub const SCHEMA_VERSION: u32 = 2;

/// Current schema. Each table keeps its own AUTOINCREMENT sequence, so
/// outbox ids and entry ids are independent and never reused.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- Read mirror of user-visible entries
CREATE TABLE IF NOT EXISTS entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    text TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    pending INTEGER NOT NULL DEFAULT 0,
    outbox_id INTEGER
);

CREATE INDEX IF NOT EXISTS idx_entries_outbox_id ON entries(outbox_id);

-- Single-row compare-and-swap lease guarding flush attempts
CREATE TABLE IF NOT EXISTS flush_lease (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    holder TEXT,
    acquired_at INTEGER,
    expires_at INTEGER
);

INSERT OR IGNORE INTO flush_lease (id) VALUES (1);
"#;

/// What opening the store did to the on-disk schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenReport {
  pub previous_version: u32,
  pub schema_version: u32,
  /// Set when an incompatible outbox table was dropped; holds the
  /// number of queued items that were lost.
  pub outbox_reset: Option<usize>,
}

/// Bring the schema to `SCHEMA_VERSION` inside the given transaction.
///
/// An outbox table from an older version with a different shape is
/// recreated from scratch. Queued items in it are lost; the count is
/// reported and logged rather than hidden.
pub fn migrate(tx: &Transaction<'_>) -> Result<OpenReport, StoreError> {
  let previous: u32 = tx
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(db("Failed to read schema version"))?;

  let mut outbox_reset = None;
  let mut last_outbox_id = 0;
  if previous < SCHEMA_VERSION && table_exists(tx, "outbox")? && !has_column(tx, "outbox", "payload")? {
    let lost: usize = tx
      .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))
      .map_err(db("Failed to count legacy outbox"))?;
    last_outbox_id = highest_outbox_id(tx)?;
    tx.execute_batch("DROP TABLE outbox")
      .map_err(db("Failed to drop legacy outbox"))?;
    warn!(
      previous_version = previous,
      lost, "outbox schema changed, recreated outbox and discarded queued items"
    );
    outbox_reset = Some(lost);
  }

  if previous > SCHEMA_VERSION {
    warn!(
      on_disk = previous,
      supported = SCHEMA_VERSION,
      "outbox store was written by a newer version"
    );
  }

  tx.execute_batch(SCHEMA)
    .map_err(db("Failed to run outbox migrations"))?;

  if outbox_reset.is_some() {
    reseed_outbox_ids(tx, last_outbox_id)?;
    let orphaned = tx
      .execute(
        "DELETE FROM entries WHERE pending = 1
         AND (outbox_id IS NULL OR outbox_id NOT IN (SELECT id FROM outbox))",
        [],
      )
      .map_err(db("Failed to drop orphaned mirror entries"))?;
    if orphaned > 0 {
      warn!(orphaned, "dropped pending mirror entries of discarded outbox items");
    }
  }

  let schema_version = previous.max(SCHEMA_VERSION);
  if schema_version != previous {
    tx.pragma_update(None, "user_version", schema_version)
      .map_err(db("Failed to write schema version"))?;
  }

  Ok(OpenReport {
    previous_version: previous,
    schema_version,
    outbox_reset,
  })
}

/// Highest outbox id ever handed out, from the rows and the
/// AUTOINCREMENT counter.
fn highest_outbox_id(tx: &Transaction<'_>) -> Result<i64, StoreError> {
  let max_row: i64 = tx
    .query_row("SELECT COALESCE(MAX(id), 0) FROM outbox", [], |row| row.get(0))
    .map_err(db("Failed to read legacy outbox ids"))?;

  let counter: i64 = if table_exists(tx, "sqlite_sequence")? {
    tx.query_row(
      "SELECT COALESCE(MAX(seq), 0) FROM sqlite_sequence WHERE name = 'outbox'",
      [],
      |row| row.get(0),
    )
    .map_err(db("Failed to read outbox id counter"))?
  } else {
    0
  };

  Ok(max_row.max(counter))
}

/// Continue the recreated outbox's ids after `last_id`, so ids of
/// discarded items are never handed out again.
fn reseed_outbox_ids(tx: &Transaction<'_>, last_id: i64) -> Result<(), StoreError> {
  if last_id <= 0 {
    return Ok(());
  }
  tx.execute("DELETE FROM sqlite_sequence WHERE name = 'outbox'", [])
    .map_err(db("Failed to reset outbox id counter"))?;
  tx.execute(
    "INSERT INTO sqlite_sequence (name, seq) VALUES ('outbox', ?)",
    params![last_id],
  )
  .map_err(db("Failed to seed outbox id counter"))?;
  Ok(())
}

fn table_exists(tx: &Transaction<'_>, table: &str) -> Result<bool, StoreError> {
  let count: i64 = tx
    .query_row(
      "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
      params![table],
      |row| row.get(0),
    )
    .map_err(db("Failed to inspect schema"))?;
  Ok(count > 0)
}

fn has_column(tx: &Transaction<'_>, table: &str, column: &str) -> Result<bool, StoreError> {
  let count: i64 = tx
    .query_row(
      "SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?",
      params![table, column],
      |row| row.get(0),
    )
    .map_err(db("Failed to inspect table columns"))?;
  Ok(count > 0)
}
