//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::traits::CachedResponse;
use crate::error::{db, StoreError};
use crate::http::{RequestKey, Response};

/// Trait for response cache backends.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the generation if it does not exist yet.
  fn open_generation(&self, name: &str) -> Result<(), StoreError>;

  /// Names of every generation present, oldest first.
  fn generations(&self) -> Result<Vec<String>, StoreError>;

  /// Delete a generation and all its entries. Returns whether it existed.
  fn delete_generation(&self, name: &str) -> Result<bool, StoreError>;

  /// Look up a request in one generation.
  fn match_request(
    &self,
    generation: &str,
    key: &RequestKey,
    ignore_search: bool,
  ) -> Result<Option<CachedResponse>, StoreError>;

  /// Look up a request across all generations (exact URL match).
  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>, StoreError>;

  /// Store a response. Non-success responses are rejected.
  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<(), StoreError>;

  /// Store a set of responses in one transaction: either all land or none.
  fn put_all(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<(), StoreError>;
}

/// SQLite-based response cache.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
        path: parent.to_path_buf(),
        source,
      })?;
    }

    let conn = Connection::open(path).map_err(db("Failed to open cache database"))?;
    Self::from_connection(conn)
  }

  /// Throwaway cache, used by tests.
  #[allow(dead_code)]
  pub fn in_memory() -> Result<Self, StoreError> {
    let conn = Connection::open_in_memory().map_err(db("Failed to open in-memory cache"))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self, StoreError> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(db("Failed to run cache migrations"))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::LockPoisoned(e.to_string()))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS cache_generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per (generation, exact request identity)
CREATE TABLE IF NOT EXISTS cached_responses (
    generation TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    search_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    response_url TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, key_hash),
    FOREIGN KEY (generation) REFERENCES cache_generations(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cached_responses_search
    ON cached_responses(generation, search_hash);
"#;

const SELECT_COLUMNS: &str = "generation, status, headers, body, response_url, cached_at";

type RawRow = (String, u16, String, Vec<u8>, String, String);

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
  ))
}

fn decode(raw: RawRow) -> Result<CachedResponse, StoreError> {
  let (generation, status, headers, body, response_url, cached_at) = raw;
  let headers: BTreeMap<String, String> = serde_json::from_str(&headers)?;
  let url = Url::parse(&response_url).map_err(|e| StoreError::Corrupt {
    table: "cached_responses",
    detail: format!("bad url '{}': {}", response_url, e),
  })?;

  Ok(CachedResponse {
    response: Response {
      status,
      headers,
      body,
      url,
    },
    generation,
    cached_at: parse_datetime(&cached_at)?,
  })
}

fn insert(
  conn: &Connection,
  generation: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<(), StoreError> {
  if !response.is_success() {
    return Err(StoreError::Rejected {
      url: key.url.clone(),
      status: response.status,
    });
  }

  let headers = serde_json::to_string(&response.headers)?;
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
      params![generation],
    )
    .map_err(db("Failed to open cache generation"))?;
  conn
    .execute(
      "INSERT OR REPLACE INTO cached_responses
         (generation, key_hash, search_hash, method, url, status, headers, body, response_url, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        generation,
        key.hash(),
        key.search_hash(),
        key.method,
        key.url,
        response.status,
        headers,
        response.body,
        response.url.as_str(),
      ],
    )
    .map_err(db("Failed to store response"))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_generation(&self, name: &str) -> Result<(), StoreError> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
        params![name],
      )
      .map_err(db("Failed to open cache generation"))?;
    Ok(())
  }

  fn generations(&self) -> Result<Vec<String>, StoreError> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_generations ORDER BY rowid")
      .map_err(db("Failed to prepare generation query"))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(db("Failed to list generations"))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(db("Failed to read generation name"))?;

    Ok(names)
  }

  fn delete_generation(&self, name: &str) -> Result<bool, StoreError> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(db("Failed to begin transaction"))?;

    tx.execute(
      "DELETE FROM cached_responses WHERE generation = ?",
      params![name],
    )
    .map_err(db("Failed to delete cached responses"))?;
    let removed = tx
      .execute(
        "DELETE FROM cache_generations WHERE name = ?",
        params![name],
      )
      .map_err(db("Failed to delete generation"))?;

    tx.commit().map_err(db("Failed to commit transaction"))?;
    Ok(removed > 0)
  }

  fn match_request(
    &self,
    generation: &str,
    key: &RequestKey,
    ignore_search: bool,
  ) -> Result<Option<CachedResponse>, StoreError> {
    let conn = self.conn()?;

    // Latest write wins when several query variants share a search hash
    let (sql, hash) = if ignore_search {
      (
        format!(
          "SELECT {} FROM cached_responses WHERE generation = ? AND search_hash = ?
           ORDER BY rowid DESC LIMIT 1",
          SELECT_COLUMNS
        ),
        key.search_hash(),
      )
    } else {
      (
        format!(
          "SELECT {} FROM cached_responses WHERE generation = ? AND key_hash = ?",
          SELECT_COLUMNS
        ),
        key.hash(),
      )
    };

    let raw = conn
      .query_row(&sql, params![generation, hash], read_raw)
      .optional()
      .map_err(db("Failed to query cached response"))?;

    raw.map(decode).transpose()
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>, StoreError> {
    let conn = self.conn()?;
    let sql = format!(
      "SELECT {} FROM cached_responses cr
       INNER JOIN cache_generations cg ON cg.name = cr.generation
       WHERE cr.key_hash = ?
       ORDER BY cg.rowid LIMIT 1",
      "cr.generation, cr.status, cr.headers, cr.body, cr.response_url, cr.cached_at"
    );

    let raw = conn
      .query_row(&sql, params![key.hash()], read_raw)
      .optional()
      .map_err(db("Failed to query cached response"))?;

    raw.map(decode).transpose()
  }

  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<(), StoreError> {
    let conn = self.conn()?;
    insert(&conn, generation, key, response)
  }

  fn put_all(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<(), StoreError> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(db("Failed to begin transaction"))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
      params![generation],
    )
    .map_err(db("Failed to open cache generation"))?;

    for (key, response) in entries {
      // Dropping `tx` on error rolls back everything written so far
      insert(&tx, generation, key, response)?;
    }

    tx.commit().map_err(db("Failed to commit transaction"))?;
    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| StoreError::Corrupt {
      table: "cached_responses",
      detail: format!("bad datetime '{}': {}", s, e),
    })
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  fn ok(u: &str, body: &str) -> (RequestKey, Response) {
    let u = url(u);
    (RequestKey::new("GET", &u), Response::new(200, body, u))
  }

  #[test]
  fn test_put_and_match_exact() {
    let storage = SqliteStorage::in_memory().unwrap();
    let (key, resp) = ok("http://app.test/index.html", "<html>");
    storage.put("shell-v1", &key, &resp).unwrap();

    let hit = storage.match_request("shell-v1", &key, false).unwrap().unwrap();
    assert_eq!(hit.response.text(), "<html>");
    assert_eq!(hit.generation, "shell-v1");

    assert!(storage.match_request("dynamic-v1", &key, false).unwrap().is_none());
  }

  #[test]
  fn test_match_ignoring_search() {
    let storage = SqliteStorage::in_memory().unwrap();
    let (key, resp) = ok("http://app.test/app.css?v=1", "a{}");
    storage.put("dynamic-v1", &key, &resp).unwrap();

    let other = RequestKey::new("GET", &url("http://app.test/app.css?v=2"));
    assert!(storage.match_request("dynamic-v1", &other, false).unwrap().is_none());
    let hit = storage.match_request("dynamic-v1", &other, true).unwrap().unwrap();
    assert_eq!(hit.response.text(), "a{}");
  }

  #[test]
  fn test_put_rejects_failed_response() {
    let storage = SqliteStorage::in_memory().unwrap();
    let u = url("http://app.test/missing");
    let key = RequestKey::new("GET", &u);
    let err = storage
      .put("dynamic-v1", &key, &Response::new(404, "nope", u))
      .unwrap_err();
    assert!(matches!(err, StoreError::Rejected { status: 404, .. }));
    assert!(storage.match_request("dynamic-v1", &key, false).unwrap().is_none());
  }

  #[test]
  fn test_put_all_is_all_or_nothing() {
    let storage = SqliteStorage::in_memory().unwrap();
    let good = ok("http://app.test/", "shell");
    let bad_url = url("http://app.test/broken.png");
    let bad = (
      RequestKey::new("GET", &bad_url),
      Response::new(500, "", bad_url),
    );

    assert!(storage.put_all("shell-v1", &[good.clone(), bad]).is_err());
    assert!(storage.match_request("shell-v1", &good.0, false).unwrap().is_none());
    assert!(storage.generations().unwrap().is_empty());

    storage.put_all("shell-v1", &[good.clone()]).unwrap();
    assert!(storage.match_request("shell-v1", &good.0, false).unwrap().is_some());
  }

  #[test]
  fn test_delete_generation_removes_entries() {
    let storage = SqliteStorage::in_memory().unwrap();
    let (key, resp) = ok("http://app.test/a.png", "png");
    storage.put("dynamic-v3", &key, &resp).unwrap();
    storage.open_generation("dynamic-v4").unwrap();

    assert!(storage.delete_generation("dynamic-v3").unwrap());
    assert!(!storage.delete_generation("dynamic-v3").unwrap());
    assert_eq!(storage.generations().unwrap(), vec!["dynamic-v4"]);
    assert!(storage.match_any(&key).unwrap().is_none());
  }

  #[test]
  fn test_headers_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.db");
    let u = url("http://app.test/offline.html");
    let key = RequestKey::new("GET", &u);

    {
      let storage = SqliteStorage::open(&path).unwrap();
      let resp = Response::synthetic(200, "text/html", "offline", u.clone());
      storage.put("shell-v1", &key, &resp).unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    let hit = storage.match_any(&key).unwrap().unwrap();
    assert_eq!(
      hit.response.headers.get("content-type").map(String::as_str),
      Some("text/html")
    );
    assert_eq!(hit.response.url, u);
  }
}
