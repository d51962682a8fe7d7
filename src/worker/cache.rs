//! SQLite storage for cache generations and their responses.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use super::request::{Request, Response};
use crate::error::StorageError;

/// Schema for the response cache.
const CACHE_SCHEMA: &str = r#"
-- One row per cache generation; at most one is 'current'
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cached responses keyed by request hash within a generation
CREATE TABLE IF NOT EXISTS responses (
    generation TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, request_key)
);
"#;

const STATE_INSTALLED: &str = "installed";
const STATE_CURRENT: &str = "current";

/// A cached response and when it was written.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Response cache owned by the cache worker.
pub struct ResponseCache {
  conn: Mutex<Connection>,
}

impl ResponseCache {
  /// Open or create the response cache at `path`.
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StorageError::Unavailable(format!("Failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StorageError::Unavailable(format!(
        "Failed to open response cache at {}: {}",
        path.display(),
        e
      ))
    })?;
    // `run` keeps this file open while one-shot commands read it
    conn.busy_timeout(Duration::from_secs(5))?;

    Self::from_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self, StorageError> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self, StorageError> {
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Unavailable(format!("Lock poisoned: {}", e)))
  }

  /// Write a freshly installed generation with all of its entries at once.
  ///
  /// Either every entry lands or none does. Priming the current generation
  /// again keeps it current.
  pub fn prime(&self, generation: &str, entries: &[(Request, Response)]) -> Result<(), StorageError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    tx.execute(
      "INSERT INTO generations (name, state) VALUES (?, ?)
       ON CONFLICT(name) DO NOTHING",
      params![generation, STATE_INSTALLED],
    )?;

    for (request, response) in entries {
      insert_response(&tx, generation, request, response)?;
    }

    tx.commit()?;
    debug!(generation, entries = entries.len(), "primed cache generation");
    Ok(())
  }

  /// Make `generation` current and delete every other generation.
  ///
  /// Returns the names of the deleted generations.
  pub fn activate(&self, generation: &str) -> Result<Vec<String>, StorageError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let exists: Option<String> = tx
      .query_row(
        "SELECT name FROM generations WHERE name = ?",
        params![generation],
        |row| row.get(0),
      )
      .optional()?;
    if exists.is_none() {
      return Err(StorageError::InvalidRecord(format!(
        "cache generation {} does not exist",
        generation
      )));
    }

    let stale: Vec<String> = {
      let mut stmt = tx.prepare("SELECT name FROM generations WHERE name != ? ORDER BY name")?;
      let names = stmt
        .query_map(params![generation], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
      names
    };

    tx.execute("DELETE FROM responses WHERE generation != ?", params![generation])?;
    tx.execute("DELETE FROM generations WHERE name != ?", params![generation])?;
    tx.execute(
      "UPDATE generations SET state = ? WHERE name = ?",
      params![STATE_CURRENT, generation],
    )?;
    tx.commit()?;

    Ok(stale)
  }

  /// Delete a generation that is not current. Returns whether anything was removed.
  pub fn discard(&self, generation: &str) -> Result<bool, StorageError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let removed = tx.execute(
      "DELETE FROM generations WHERE name = ? AND state != ?",
      params![generation, STATE_CURRENT],
    )?;
    if removed > 0 {
      tx.execute("DELETE FROM responses WHERE generation = ?", params![generation])?;
    }
    tx.commit()?;

    Ok(removed > 0)
  }

  /// Name of the current generation, if any.
  pub fn current(&self) -> Result<Option<String>, StorageError> {
    let conn = self.lock()?;
    Ok(
      conn
        .query_row(
          "SELECT name FROM generations WHERE state = ?",
          params![STATE_CURRENT],
          |row| row.get(0),
        )
        .optional()?,
    )
  }

  /// Every stored generation name.
  pub fn generations(&self) -> Result<Vec<String>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM generations ORDER BY name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  /// Store or replace one response in a generation.
  pub fn put(&self, generation: &str, request: &Request, response: &Response) -> Result<(), StorageError> {
    let conn = self.lock()?;
    insert_response(&conn, generation, request, response)
  }

  /// Look up the cached response for a request.
  pub fn lookup(&self, generation: &str, request: &Request) -> Result<Option<CachedResponse>, StorageError> {
    let conn = self.lock()?;

    let row: Option<(String, u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT url, status, headers, body, cached_at FROM responses
         WHERE generation = ? AND request_key = ?",
        params![generation, request.cache_key()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()?;

    match row {
      Some((url, status, headers, body, cached_at)) => Ok(Some(CachedResponse {
        response: Response {
          url,
          status,
          headers: serde_json::from_str(&headers)?,
          body,
        },
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  /// Number of responses stored in a generation.
  pub fn len(&self, generation: &str) -> Result<usize, StorageError> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM responses WHERE generation = ?",
      params![generation],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }
}

fn insert_response(
  conn: &Connection,
  generation: &str,
  request: &Request,
  response: &Response,
) -> Result<(), StorageError> {
  let headers = serde_json::to_string(&response.headers)?;
  conn.execute(
    "INSERT OR REPLACE INTO responses (generation, request_key, url, status, headers, body, cached_at)
     VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
    params![
      generation,
      request.cache_key(),
      request.url,
      response.status,
      headers,
      response.body
    ],
  )?;
  Ok(())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| StorageError::Unavailable(format!("Failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn page(url: &str, body: &str) -> (Request, Response) {
    (
      Request::get(url),
      Response {
        url: url.to_string(),
        status: 200,
        headers: vec![("content-type".into(), "text/html".into())],
        body: body.as_bytes().to_vec(),
      },
    )
  }

  #[test]
  fn test_open_waits_for_another_writer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("responses.db");
    let cache = ResponseCache::open(&path).unwrap();

    let (locked_tx, locked_rx) = std::sync::mpsc::channel();
    let writer = std::thread::spawn({
      let path = path.clone();
      move || {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        locked_tx.send(()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));
        conn.execute_batch("COMMIT").unwrap();
      }
    });

    locked_rx.recv().unwrap();
    let (request, response) = page("/dashboard", "dash");
    cache.put("gym-manager-v1", &request, &response).unwrap();
    writer.join().unwrap();

    assert_eq!(cache.len("gym-manager-v1").unwrap(), 1);
  }

  #[test]
  fn test_prime_and_lookup() {
    let cache = ResponseCache::open_in_memory().unwrap();
    cache
      .prime("gym-manager-v1", &[page("/", "root"), page("/dashboard", "dash")])
      .unwrap();

    let hit = cache
      .lookup("gym-manager-v1", &Request::navigate("/dashboard"))
      .unwrap()
      .unwrap();
    assert_eq!(hit.response.body, b"dash");
    assert_eq!(hit.response.headers[0].1, "text/html");
    assert!(cache
      .lookup("gym-manager-v1", &Request::get("/missing"))
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_primed_generation_is_not_current() {
    let cache = ResponseCache::open_in_memory().unwrap();
    cache.prime("gym-manager-v1", &[page("/", "root")]).unwrap();
    assert_eq!(cache.current().unwrap(), None);
  }

  #[test]
  fn test_activate_evicts_other_generations() {
    let cache = ResponseCache::open_in_memory().unwrap();
    cache.prime("gym-manager-v1", &[page("/", "old")]).unwrap();
    cache.activate("gym-manager-v1").unwrap();
    cache.prime("gym-manager-v2", &[page("/", "new")]).unwrap();

    let evicted = cache.activate("gym-manager-v2").unwrap();

    assert_eq!(evicted, vec!["gym-manager-v1".to_string()]);
    assert_eq!(cache.generations().unwrap(), vec!["gym-manager-v2".to_string()]);
    assert_eq!(cache.current().unwrap().as_deref(), Some("gym-manager-v2"));
    assert_eq!(cache.len("gym-manager-v1").unwrap(), 0);
  }

  #[test]
  fn test_activate_unknown_generation_fails() {
    let cache = ResponseCache::open_in_memory().unwrap();
    assert!(cache.activate("gym-manager-v9").is_err());
  }

  #[test]
  fn test_discard_never_removes_current() {
    let cache = ResponseCache::open_in_memory().unwrap();
    cache.prime("gym-manager-v1", &[page("/", "root")]).unwrap();
    cache.activate("gym-manager-v1").unwrap();

    assert!(!cache.discard("gym-manager-v1").unwrap());
    assert_eq!(cache.len("gym-manager-v1").unwrap(), 1);
  }

  #[test]
  fn test_put_overwrites_entry() {
    let cache = ResponseCache::open_in_memory().unwrap();
    let (request, mut response) = page("/static/css/style.css", "a{}");
    cache.put("gym-manager-v1", &request, &response).unwrap();
    response.body = b"b{}".to_vec();
    cache.put("gym-manager-v1", &request, &response).unwrap();

    let hit = cache.lookup("gym-manager-v1", &request).unwrap().unwrap();
    assert_eq!(hit.response.body, b"b{}");
    assert_eq!(cache.len("gym-manager-v1").unwrap(), 1);
  }
}
