//! Durable store trait and SQLite implementation.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use super::records::{next_seq, Collection, Record, RecordKey};
use super::schema::MIGRATIONS;
use crate::error::StorageError;

/// Trait for local durable store backends.
///
/// Every write runs in its own transaction, so concurrent callers never see
/// a half-applied put or delete.
pub trait DurableStore: Send + Sync {
  /// Insert or overwrite a record, returning the key it was stored under.
  fn put<R: Record>(&self, record: &R) -> Result<RecordKey, StorageError>;

  /// All records of `R`'s collection. Auto-keyed collections come back oldest first.
  fn get_all<R: Record>(&self) -> Result<Vec<R>, StorageError>;

  /// Remove one record. Absent keys are not an error.
  fn delete(&self, collection: Collection, key: &RecordKey) -> Result<(), StorageError>;

  /// Number of records in a collection.
  fn count(&self, collection: Collection) -> Result<usize, StorageError>;

  /// Record a failed delivery of a queued action and return its failure count.
  fn record_attempt(&self, action_key: i64, error: &str) -> Result<u32, StorageError>;

  /// Failed delivery count of a queued action.
  fn attempts(&self, action_key: i64) -> Result<u32, StorageError>;

  /// Empty every collection.
  fn reset(&self) -> Result<(), StorageError>;
}

/// SQLite-backed durable store.
pub struct SqliteStore {
  conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
  /// Open or create the store at `path`, applying pending schema upgrades.
  ///
  /// Safe to call on every start: existing records are kept.
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StorageError::Unavailable(format!(
          "Failed to create store directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StorageError::Unavailable(format!(
        "Failed to open store at {}: {}",
        path.display(),
        e
      ))
    })?;
    conn.busy_timeout(Duration::from_secs(5))?;

    info!(path = %path.display(), "opened local store");
    Self::from_connection(conn)
  }

  /// Open a throwaway in-memory store.
  pub fn open_in_memory() -> Result<Self, StorageError> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(mut conn: Connection) -> Result<Self, StorageError> {
    run_migrations(&mut conn)?;
    Ok(Self {
      conn: Mutex::new(Some(conn)),
    })
  }

  /// Close the underlying database. Later calls fail with `Unavailable`.
  pub fn close(&self) -> Result<(), StorageError> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| StorageError::Unavailable(format!("Lock poisoned: {}", e)))?;

    if let Some(conn) = guard.take() {
      conn.close().map_err(|(_, e)| StorageError::from(e))?;
      debug!("closed local store");
    }
    Ok(())
  }

  /// Schema version currently applied.
  pub fn schema_version(&self) -> Result<i64, StorageError> {
    self.with_conn(|conn| Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?))
  }

  fn with_conn<T>(
    &self,
    f: impl FnOnce(&mut Connection) -> Result<T, StorageError>,
  ) -> Result<T, StorageError> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| StorageError::Unavailable(format!("Lock poisoned: {}", e)))?;
    let conn = guard
      .as_mut()
      .ok_or_else(|| StorageError::Unavailable("store is closed".into()))?;
    f(conn)
  }
}

fn run_migrations(conn: &mut Connection) -> Result<(), StorageError> {
  let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
  let target = MIGRATIONS.len() as i64;

  if current > target {
    return Err(StorageError::Unavailable(format!(
      "store schema v{} is newer than supported v{}",
      current, target
    )));
  }
  if current == target {
    return Ok(());
  }

  let tx = conn.transaction()?;
  for (idx, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
    tx.execute_batch(sql)?;
    debug!(version = idx + 1, "applied store migration");
  }
  tx.pragma_update(None, "user_version", target)?;
  tx.commit()?;

  info!(from = current, to = target, "upgraded local store schema");
  Ok(())
}

impl DurableStore for SqliteStore {
  fn put<R: Record>(&self, record: &R) -> Result<RecordKey, StorageError> {
    let collection = R::collection();

    self.with_conn(|conn| {
      let tx = conn.transaction()?;
      let mut record = record.clone();

      let key = match record.key() {
        Some(RecordKey::Id(id)) if id.is_empty() => {
          return Err(StorageError::InvalidRecord(format!(
            "empty key for {} record",
            collection
          )));
        }
        Some(key) => key,
        None if collection.auto_keyed() => {
          let last: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM records WHERE collection = ?",
            params![collection.name()],
            |row| row.get(0),
          )?;
          let seq = next_seq(last, Utc::now().timestamp_millis());
          record.assign_key(seq);
          RecordKey::Seq(seq)
        }
        None => {
          return Err(StorageError::InvalidRecord(format!(
            "{} records need an explicit key",
            collection
          )));
        }
      };

      let data = serde_json::to_vec(&record)?;
      tx.execute(
        "INSERT OR REPLACE INTO records (collection, record_key, seq, data, stored_at)
         VALUES (?, ?, ?, ?, datetime('now'))",
        params![collection.name(), key.to_string(), key.seq(), data],
      )?;
      tx.commit()?;

      Ok(key)
    })
  }

  fn get_all<R: Record>(&self) -> Result<Vec<R>, StorageError> {
    let collection = R::collection();

    self.with_conn(|conn| {
      let mut stmt = conn.prepare(
        "SELECT data FROM records
         WHERE collection = ?
         ORDER BY seq, record_key",
      )?;

      let rows = stmt.query_map(params![collection.name()], |row| row.get::<_, Vec<u8>>(0))?;

      let mut records = Vec::new();
      for data in rows {
        records.push(serde_json::from_slice(&data?)?);
      }
      Ok(records)
    })
  }

  fn delete(&self, collection: Collection, key: &RecordKey) -> Result<(), StorageError> {
    self.with_conn(|conn| {
      let tx = conn.transaction()?;
      tx.execute(
        "DELETE FROM records WHERE collection = ? AND record_key = ?",
        params![collection.name(), key.to_string()],
      )?;
      if let Some(seq) = key.seq().filter(|_| collection == Collection::PendingActions) {
        tx.execute(
          "DELETE FROM delivery_attempts WHERE action_key = ?",
          params![seq],
        )?;
      }
      tx.commit()?;
      Ok(())
    })
  }

  fn count(&self, collection: Collection) -> Result<usize, StorageError> {
    self.with_conn(|conn| {
      let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM records WHERE collection = ?",
        params![collection.name()],
        |row| row.get(0),
      )?;
      Ok(count as usize)
    })
  }

  fn record_attempt(&self, action_key: i64, error: &str) -> Result<u32, StorageError> {
    self.with_conn(|conn| {
      let tx = conn.transaction()?;
      tx.execute(
        "INSERT INTO delivery_attempts (action_key, attempts, last_error, last_attempt_at)
         VALUES (?, 1, ?, datetime('now'))
         ON CONFLICT(action_key) DO UPDATE SET
           attempts = attempts + 1,
           last_error = excluded.last_error,
           last_attempt_at = excluded.last_attempt_at",
        params![action_key, error],
      )?;
      let attempts: u32 = tx.query_row(
        "SELECT attempts FROM delivery_attempts WHERE action_key = ?",
        params![action_key],
        |row| row.get(0),
      )?;
      tx.commit()?;
      Ok(attempts)
    })
  }

  fn attempts(&self, action_key: i64) -> Result<u32, StorageError> {
    self.with_conn(|conn| {
      let attempts: Option<u32> = conn
        .query_row(
          "SELECT attempts FROM delivery_attempts WHERE action_key = ?",
          params![action_key],
          |row| row.get(0),
        )
        .optional()?;
      Ok(attempts.unwrap_or(0))
    })
  }

  fn reset(&self) -> Result<(), StorageError> {
    self.with_conn(|conn| {
      let tx = conn.transaction()?;
      tx.execute("DELETE FROM records", [])?;
      tx.execute("DELETE FROM delivery_attempts", [])?;
      tx.commit()?;
      info!("local store reset");
      Ok(())
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{CachedRecord, QueuedAction};
  use serde_json::json;

  #[test]
  fn test_open_applies_all_migrations() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert_eq!(store.schema_version().unwrap(), MIGRATIONS.len() as i64);
  }

  #[test]
  fn test_put_and_get_member() {
    let store = SqliteStore::open_in_memory().unwrap();
    let record = CachedRecord::new("42", json!({"name": "Asha", "phone": "555-0101"}));

    let key = store.put(&record).unwrap();
    assert_eq!(key, RecordKey::Id("42".into()));

    let members: Vec<CachedRecord> = store.get_all().unwrap();
    assert_eq!(members, vec![record]);
  }

  #[test]
  fn test_put_overwrites_same_key() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.put(&CachedRecord::new("42", json!({"plan": "monthly"}))).unwrap();
    store.put(&CachedRecord::new("42", json!({"plan": "yearly"}))).unwrap();

    let members: Vec<CachedRecord> = store.get_all().unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].payload, json!({"plan": "yearly"}));
  }

  #[test]
  fn test_empty_member_id_rejected() {
    let store = SqliteStore::open_in_memory().unwrap();
    let err = store.put(&CachedRecord::new("", json!({}))).unwrap_err();
    assert!(matches!(err, StorageError::InvalidRecord(_)));
  }

  #[test]
  fn test_pending_actions_get_increasing_keys() {
    let store = SqliteStore::open_in_memory().unwrap();

    let keys: Vec<i64> = (0..5)
      .map(|i| {
        store
          .put(&QueuedAction::new("/fees", json!({"n": i})))
          .unwrap()
          .seq()
          .unwrap()
      })
      .collect();

    assert!(keys.windows(2).all(|w| w[0] < w[1]));

    let actions: Vec<QueuedAction> = store.get_all().unwrap();
    let stored: Vec<i64> = actions.iter().map(|a| a.key).collect();
    assert_eq!(stored, keys);
    assert_eq!(actions[3].payload, json!({"n": 3}));
  }

  #[test]
  fn test_collections_are_separate() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.put(&CachedRecord::new("1", json!({}))).unwrap();
    store.put(&QueuedAction::new("/add_member", json!({}))).unwrap();

    assert_eq!(store.count(Collection::Members).unwrap(), 1);
    assert_eq!(store.count(Collection::PendingActions).unwrap(), 1);
  }

  #[test]
  fn test_delete_is_idempotent() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.put(&CachedRecord::new("1", json!({}))).unwrap();

    let key = RecordKey::Id("1".into());
    store.delete(Collection::Members, &key).unwrap();
    store.delete(Collection::Members, &key).unwrap();
    assert_eq!(store.count(Collection::Members).unwrap(), 0);
  }

  #[test]
  fn test_delete_clears_attempts() {
    let store = SqliteStore::open_in_memory().unwrap();
    let key = store.put(&QueuedAction::new("/fees", json!({}))).unwrap();
    let seq = key.seq().unwrap();

    assert_eq!(store.record_attempt(seq, "timeout").unwrap(), 1);
    assert_eq!(store.record_attempt(seq, "timeout").unwrap(), 2);

    store.delete(Collection::PendingActions, &key).unwrap();
    assert_eq!(store.attempts(seq).unwrap(), 0);
  }

  #[test]
  fn test_reset_empties_everything() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.put(&CachedRecord::new("1", json!({}))).unwrap();
    let key = store.put(&QueuedAction::new("/fees", json!({}))).unwrap();
    store.record_attempt(key.seq().unwrap(), "503").unwrap();

    store.reset().unwrap();

    for collection in Collection::ALL {
      assert_eq!(store.count(collection).unwrap(), 0);
    }
    assert_eq!(store.attempts(key.seq().unwrap()).unwrap(), 0);
  }

  #[test]
  fn test_closed_store_is_unavailable() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.close().unwrap();

    let err = store.get_all::<CachedRecord>().unwrap_err();
    assert!(matches!(err, StorageError::Unavailable(_)));
  }

  #[test]
  fn test_reopen_keeps_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");

    {
      let store = SqliteStore::open(&path).unwrap();
      store.put(&CachedRecord::new("7", json!({"name": "Ravi"}))).unwrap();
      store.put(&QueuedAction::new("/fees", json!({"member_id": 7}))).unwrap();
      store.close().unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.count(Collection::Members).unwrap(), 1);
    assert_eq!(store.count(Collection::PendingActions).unwrap(), 1);
    assert_eq!(store.schema_version().unwrap(), MIGRATIONS.len() as i64);
  }

  #[test]
  fn test_upgrade_from_v1_preserves_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    {
      let conn = Connection::open(&path).unwrap();
      conn.execute_batch(MIGRATIONS[0]).unwrap();
      conn.pragma_update(None, "user_version", 1).unwrap();
      let data = serde_json::to_vec(&CachedRecord::new("3", json!({"name": "Mei"}))).unwrap();
      conn
        .execute(
          "INSERT INTO records (collection, record_key, seq, data) VALUES ('members', '3', NULL, ?)",
          params![data],
        )
        .unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let members: Vec<CachedRecord> = store.get_all().unwrap();
    assert_eq!(members[0].id, "3");
    assert_eq!(store.attempts(1).unwrap(), 0);
  }

  #[test]
  fn test_newer_schema_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    {
      let conn = Connection::open(&path).unwrap();
      conn
        .pragma_update(None, "user_version", MIGRATIONS.len() as i64 + 1)
        .unwrap();
    }

    assert!(matches!(
      SqliteStore::open(&path),
      Err(StorageError::Unavailable(_))
    ));
  }
}
