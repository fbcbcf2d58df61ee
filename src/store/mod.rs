//! Durable outbox store.
//!
//! One SQLite database holding the outbox of unsent writes, the entries
//! mirror the UI reads, and the flush lease. Every public operation is a
//! single transaction; a `rusqlite::Transaction` rolls back when dropped,
//! so an early `?` return never leaves half a write behind.

pub mod schema;
mod types;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{db, StoreError};

pub use schema::OpenReport;
pub use types::{mirror_text, Entry, NewEntry, OutboxItem, QueuedWrite};

/// Outbox + mirror store shared by every tab and the background context.
pub struct OutboxStore {
  conn: Mutex<Connection>,
  report: OpenReport,
}

impl OutboxStore {
  /// Open (or create) the store at `path`, upgrading its schema.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
        path: parent.to_path_buf(),
        source,
      })?;
    }

    let conn = Connection::open(path).map_err(db("Failed to open outbox database"))?;
    Self::from_connection(conn)
  }

  /// Throwaway store, used by tests.
  #[allow(dead_code)]
  pub fn in_memory() -> Result<Self, StoreError> {
    let conn = Connection::open_in_memory().map_err(db("Failed to open in-memory outbox"))?;
    Self::from_connection(conn)
  }

  fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
    // Tabs and the background context may open the same file concurrently
    conn
      .busy_timeout(std::time::Duration::from_secs(5))
      .map_err(db("Failed to set busy timeout"))?;

    let tx = conn
      .transaction()
      .map_err(db("Failed to begin migration"))?;
    let report = schema::migrate(&tx)?;
    tx.commit().map_err(db("Failed to commit migration"))?;

    Ok(Self {
      conn: Mutex::new(conn),
      report,
    })
  }

  /// What happened to the schema when this store was opened.
  pub fn open_report(&self) -> &OpenReport {
    &self.report
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::LockPoisoned(e.to_string()))
  }

  /// Run `f` inside one transaction, committing only if it succeeds.
  fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>) -> Result<T, StoreError> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(db("Failed to begin transaction"))?;
    let value = f(&tx)?;
    tx.commit().map_err(db("Failed to commit transaction"))?;
    Ok(value)
  }

  // ==========================================================================
  // Outbox
  // ==========================================================================

  /// Append a write to the outbox and return its id.
  pub fn enqueue(&self, payload: &Value) -> Result<i64, StoreError> {
    let encoded = serde_json::to_string(payload)?;
    let id = self.write(|tx| {
      tx.execute(
        "INSERT INTO outbox (payload, created_at) VALUES (?, ?)",
        params![encoded, Utc::now().timestamp_millis()],
      )
      .map_err(db("Failed to enqueue outbox item"))?;
      Ok(tx.last_insert_rowid())
    })?;

    debug!(outbox_id = id, "queued write");
    Ok(id)
  }

  /// Snapshot of every pending item, in insertion order.
  pub fn read_all(&self) -> Result<Vec<OutboxItem>, StoreError> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT id, payload, created_at FROM outbox ORDER BY id")
      .map_err(db("Failed to prepare outbox query"))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, i64>(2)?,
        ))
      })
      .map_err(db("Failed to read outbox"))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(db("Failed to read outbox row"))?;

    rows
      .into_iter()
      .map(|(id, payload, created_at)| {
        Ok(OutboxItem {
          id,
          payload: serde_json::from_str(&payload)?,
          created_at: from_millis("outbox", created_at)?,
        })
      })
      .collect()
  }

  /// Delete the given items, or everything when `ids` is `None`.
  ///
  /// Only call this after the backend has accepted the items.
  pub fn clear(&self, ids: Option<&[i64]>) -> Result<usize, StoreError> {
    self.write(|tx| match ids {
      None => tx
        .execute("DELETE FROM outbox", [])
        .map_err(db("Failed to clear outbox")),
      Some(ids) => {
        let mut removed = 0;
        for id in ids {
          removed += tx
            .execute("DELETE FROM outbox WHERE id = ?", params![id])
            .map_err(db("Failed to delete outbox item"))?;
        }
        Ok(removed)
      }
    })
  }

  // ==========================================================================
  // Mirror
  // ==========================================================================

  /// Remove mirror entries standing for the given outbox items.
  pub fn delete_mirrored_by_outbox_ids(&self, outbox_ids: &[i64]) -> Result<usize, StoreError> {
    if outbox_ids.is_empty() {
      return Ok(0);
    }

    self.write(|tx| {
      let mut removed = 0;
      for id in outbox_ids {
        removed += tx
          .execute("DELETE FROM entries WHERE outbox_id = ?", params![id])
          .map_err(db("Failed to delete mirrored entry"))?;
      }
      Ok(removed)
    })
  }

  pub fn add_entry(&self, entry: &NewEntry) -> Result<i64, StoreError> {
    self.write(|tx| {
      tx.execute(
        "INSERT INTO entries (text, created_at, pending, outbox_id) VALUES (?, ?, ?, ?)",
        params![
          entry.text,
          Utc::now().timestamp_millis(),
          entry.pending,
          entry.outbox_id
        ],
      )
      .map_err(db("Failed to insert entry"))?;
      Ok(tx.last_insert_rowid())
    })
  }

  pub fn list_entries(&self) -> Result<Vec<Entry>, StoreError> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT id, text, created_at, pending, outbox_id FROM entries ORDER BY id")
      .map_err(db("Failed to prepare entries query"))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, i64>(2)?,
          row.get::<_, bool>(3)?,
          row.get::<_, Option<i64>>(4)?,
        ))
      })
      .map_err(db("Failed to read entries"))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(db("Failed to read entry row"))?;

    rows
      .into_iter()
      .map(|(id, text, created_at, pending, outbox_id)| {
        Ok(Entry {
          id,
          text,
          created_at: from_millis("entries", created_at)?,
          pending,
          outbox_id,
        })
      })
      .collect()
  }

  /// Delete an entry and, if it is still pending, its outbox item, in one
  /// transaction across both collections.
  pub fn delete_entry(&self, entry_id: i64) -> Result<bool, StoreError> {
    self.write(|tx| {
      let outbox_id: Option<Option<i64>> = tx
        .query_row(
          "SELECT outbox_id FROM entries WHERE id = ?",
          params![entry_id],
          |row| row.get(0),
        )
        .optional()
        .map_err(db("Failed to look up entry"))?;

      let Some(outbox_id) = outbox_id else {
        return Ok(false);
      };

      if let Some(outbox_id) = outbox_id {
        tx.execute("DELETE FROM outbox WHERE id = ?", params![outbox_id])
          .map_err(db("Failed to delete outbox item"))?;
      }
      tx.execute("DELETE FROM entries WHERE id = ?", params![entry_id])
        .map_err(db("Failed to delete entry"))?;
      Ok(true)
    })
  }

  /// Queue a write and mirror it as a pending entry.
  ///
  /// Two transactions, outbox first: a crash in between leaves an item
  /// without a mirror row (it still syncs), never a pending row without
  /// an item. A failed enqueue is returned as an error; a failed mirror
  /// insert is logged and reported through `entry_id: None`.
  pub fn queue_with_mirror(&self, payload: &Value) -> Result<QueuedWrite, StoreError> {
    let outbox_id = self.enqueue(payload)?;

    let entry_id = match self.add_entry(&NewEntry::pending(mirror_text(payload), outbox_id)) {
      Ok(id) => Some(id),
      Err(e) => {
        warn!(outbox_id, error = %e, "queued write has no mirror entry");
        None
      }
    };

    Ok(QueuedWrite { outbox_id, entry_id })
  }

  // ==========================================================================
  // Flush lease
  // ==========================================================================

  /// Try to take the flush lease for `holder`.
  ///
  /// Succeeds when nobody holds it or the previous holder's lease has
  /// expired (a context that died mid-flush cannot block syncing forever).
  pub fn try_acquire_lease(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
    let now = Utc::now().timestamp_millis();
    let expires = now + ttl.num_milliseconds();

    let conn = self.conn()?;
    let changed = conn
      .execute(
        "UPDATE flush_lease SET holder = ?1, acquired_at = ?2, expires_at = ?3
         WHERE id = 1 AND (holder IS NULL OR expires_at < ?2)",
        params![holder, now, expires],
      )
      .map_err(db("Failed to acquire flush lease"))?;

    Ok(changed == 1)
  }

  /// Release the lease if `holder` still owns it.
  pub fn release_lease(&self, holder: &str) -> Result<bool, StoreError> {
    let conn = self.conn()?;
    let changed = conn
      .execute(
        "UPDATE flush_lease SET holder = NULL, acquired_at = NULL, expires_at = NULL
         WHERE id = 1 AND holder = ?",
        params![holder],
      )
      .map_err(db("Failed to release flush lease"))?;

    Ok(changed == 1)
  }
}

fn from_millis(table: &'static str, millis: i64) -> Result<DateTime<Utc>, StoreError> {
  DateTime::from_timestamp_millis(millis).ok_or_else(|| StoreError::Corrupt {
    table,
    detail: format!("timestamp out of range: {}", millis),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tempfile::TempDir;

  fn store() -> OutboxStore {
    OutboxStore::in_memory().unwrap()
  }

  #[test]
  fn test_enqueue_and_read_in_order() {
    let store = store();
    let a = store.enqueue(&json!({"n": 1})).unwrap();
    let b = store.enqueue(&json!({"n": 2})).unwrap();
    assert!(b > a);

    let items = store.read_all().unwrap();
    assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![a, b]);
    assert_eq!(items[1].payload, json!({"n": 2}));
  }

  #[test]
  fn test_outbox_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("outbox.db");
    let payloads: Vec<Value> = (0..5).map(|n| json!({"title": format!("t{}", n)})).collect();

    {
      let store = OutboxStore::open(&path).unwrap();
      for p in &payloads {
        store.enqueue(p).unwrap();
      }
      // Dropped without any flush
    }

    let store = OutboxStore::open(&path).unwrap();
    let items = store.read_all().unwrap();
    assert_eq!(items.len(), 5);
    assert_eq!(
      items.into_iter().map(|i| i.payload).collect::<Vec<_>>(),
      payloads
    );
  }

  #[test]
  fn test_clear_selected_and_all() {
    let store = store();
    let a = store.enqueue(&json!(1)).unwrap();
    let b = store.enqueue(&json!(2)).unwrap();
    let c = store.enqueue(&json!(3)).unwrap();

    assert_eq!(store.clear(Some(&[a, c])).unwrap(), 2);
    assert_eq!(store.read_all().unwrap()[0].id, b);

    assert_eq!(store.clear(None).unwrap(), 1);
    assert!(store.read_all().unwrap().is_empty());
  }

  #[test]
  fn test_ids_are_never_reused_and_sequences_are_independent() {
    let store = store();
    let first = store.enqueue(&json!(1)).unwrap();
    store.clear(None).unwrap();
    let second = store.enqueue(&json!(2)).unwrap();
    assert!(second > first);

    let entry = store.add_entry(&NewEntry::sent("x")).unwrap();
    assert_eq!(entry, 1);
  }

  #[test]
  fn test_queue_with_mirror_links_entry_to_item() {
    let store = store();
    let queued = store
      .queue_with_mirror(&json!({"title": "A", "note": "B"}))
      .unwrap();

    let entries = store.list_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].text, "A — B");
    assert!(entries[0].pending);
    assert_eq!(entries[0].outbox_id, Some(queued.outbox_id));
    assert_eq!(queued.entry_id, Some(entries[0].id));
  }

  #[test]
  fn test_delete_mirrored_by_outbox_ids() {
    let store = store();
    let q1 = store.queue_with_mirror(&json!({"text": "one"})).unwrap();
    store.queue_with_mirror(&json!({"text": "two"})).unwrap();
    store.add_entry(&NewEntry::sent("direct")).unwrap();

    assert_eq!(store.delete_mirrored_by_outbox_ids(&[q1.outbox_id]).unwrap(), 1);
    let left: Vec<_> = store.list_entries().unwrap().into_iter().map(|e| e.text).collect();
    assert_eq!(left, vec!["two", "direct"]);
    assert_eq!(store.delete_mirrored_by_outbox_ids(&[]).unwrap(), 0);
  }

  #[test]
  fn test_delete_entry_removes_its_outbox_item() {
    let store = store();
    let q = store.queue_with_mirror(&json!({"text": "one"})).unwrap();
    let other = store.enqueue(&json!({"text": "other"})).unwrap();

    assert!(store.delete_entry(q.entry_id.unwrap()).unwrap());
    assert!(!store.delete_entry(q.entry_id.unwrap()).unwrap());
    assert!(store.list_entries().unwrap().is_empty());
    let ids: Vec<_> = store.read_all().unwrap().into_iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![other]);
  }

  #[test]
  fn test_lease_is_exclusive_until_released_or_expired() {
    let store = store();
    assert!(store.try_acquire_lease("a", Duration::seconds(60)).unwrap());
    assert!(!store.try_acquire_lease("b", Duration::seconds(60)).unwrap());
    assert!(!store.release_lease("b").unwrap());
    assert!(store.release_lease("a").unwrap());
    assert!(store.try_acquire_lease("b", Duration::seconds(60)).unwrap());

    let stale = OutboxStore::in_memory().unwrap();
    assert!(stale.try_acquire_lease("dead", Duration::milliseconds(-1)).unwrap());
    assert!(stale.try_acquire_lease("alive", Duration::seconds(60)).unwrap());
  }

  #[test]
  fn test_fresh_store_reports_current_schema() {
    let store = store();
    let report = store.open_report();
    assert_eq!(report.previous_version, 0);
    assert_eq!(report.schema_version, schema::SCHEMA_VERSION);
    assert_eq!(report.outbox_reset, None);
  }

  #[test]
  fn test_incompatible_outbox_is_recreated_and_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("outbox.db");

    {
      let conn = Connection::open(&path).unwrap();
      conn
        .execute_batch(
          "CREATE TABLE outbox (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT, note TEXT);
           INSERT INTO outbox (title, note) VALUES ('a', 'b'), ('c', 'd');
           PRAGMA user_version = 1;",
        )
        .unwrap();
    }

    let store = OutboxStore::open(&path).unwrap();
    assert_eq!(store.open_report().outbox_reset, Some(2));
    assert_eq!(store.open_report().previous_version, 1);
    assert!(store.read_all().unwrap().is_empty());
    store.enqueue(&json!({"ok": true})).unwrap();

    drop(store);
    let reopened = OutboxStore::open(&path).unwrap();
    assert_eq!(reopened.open_report().outbox_reset, None);
    assert_eq!(reopened.read_all().unwrap().len(), 1);
  }

  #[test]
  fn test_outbox_reset_drops_orphaned_mirror_and_keeps_ids_fresh() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("outbox.db");

    {
      let conn = Connection::open(&path).unwrap();
      conn
        .execute_batch(
          "CREATE TABLE outbox (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT, note TEXT);
           INSERT INTO outbox (title, note) VALUES ('a', 'b');
           CREATE TABLE entries (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             text TEXT NOT NULL,
             created_at INTEGER NOT NULL,
             pending INTEGER NOT NULL DEFAULT 0,
             outbox_id INTEGER
           );
           INSERT INTO entries (text, created_at, pending, outbox_id) VALUES ('a — b', 0, 1, 1);
           INSERT INTO entries (text, created_at, pending, outbox_id) VALUES ('sent', 0, 0, NULL);
           PRAGMA user_version = 1;",
        )
        .unwrap();
    }

    let store = OutboxStore::open(&path).unwrap();
    assert_eq!(store.open_report().outbox_reset, Some(1));

    let entries = store.list_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].text, "sent");
    assert!(!entries[0].pending);

    let fresh = store.enqueue(&json!({"title": "fresh"})).unwrap();
    assert!(fresh > 1);

    // Deleting the surviving entry must not touch the new write
    assert!(store.delete_entry(entries[0].id).unwrap());
    let ids: Vec<_> = store.read_all().unwrap().into_iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![fresh]);
  }
}
