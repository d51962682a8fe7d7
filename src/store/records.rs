//! Collections and record types held by the local durable store.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Named collection inside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
  /// Last known good copies of server-side members, keyed by server id.
  Members,
  /// Mutations waiting for delivery, keyed by an increasing sequence.
  PendingActions,
}

impl Collection {
  pub const ALL: [Collection; 2] = [Collection::Members, Collection::PendingActions];

  /// Persisted collection name.
  pub fn name(self) -> &'static str {
    match self {
      Self::Members => "members",
      Self::PendingActions => "pendingActions",
    }
  }

  /// Whether the store assigns keys for this collection.
  pub fn auto_keyed(self) -> bool {
    matches!(self, Self::PendingActions)
  }
}

impl fmt::Display for Collection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Key of a record within its collection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKey {
  /// Server-assigned identifier.
  Id(String),
  /// Store-assigned sequence (insertion timestamp in milliseconds).
  Seq(i64),
}

impl RecordKey {
  pub fn seq(&self) -> Option<i64> {
    match self {
      Self::Seq(seq) => Some(*seq),
      Self::Id(_) => None,
    }
  }
}

impl fmt::Display for RecordKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Id(id) => f.write_str(id),
      Self::Seq(seq) => write!(f, "{}", seq),
    }
  }
}

/// Trait for values that live in a store collection.
///
/// Mirrors how entities declare their own key and storage bucket; the store
/// never inspects the payload beyond serializing it.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Collection this record type belongs to.
  fn collection() -> Collection;

  /// Key of this record, or `None` to have the store assign the next sequence.
  fn key(&self) -> Option<RecordKey>;

  /// Receive a store-assigned sequence key. Only called for auto-keyed collections.
  fn assign_key(&mut self, _seq: i64) {}
}

/// Snapshot of a server entity as of the last online read or edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
  pub id: String,
  pub payload: Value,
}

impl CachedRecord {
  pub fn new(id: impl Into<String>, payload: Value) -> Self {
    Self {
      id: id.into(),
      payload,
    }
  }
}

impl Record for CachedRecord {
  fn collection() -> Collection {
    Collection::Members
  }

  fn key(&self) -> Option<RecordKey> {
    Some(RecordKey::Id(self.id.clone()))
  }
}

/// A mutation that has not been confirmed by the server yet.
///
/// `key` is zero until the store assigns one; stored actions always carry a
/// positive key and are never rewritten afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
  #[serde(default)]
  pub key: i64,
  pub endpoint: String,
  pub payload: Value,
  pub queued_at: DateTime<Utc>,
}

impl QueuedAction {
  pub fn new(endpoint: impl Into<String>, payload: Value) -> Self {
    Self {
      key: 0,
      endpoint: endpoint.into(),
      payload,
      queued_at: Utc::now(),
    }
  }
}

impl Record for QueuedAction {
  fn collection() -> Collection {
    Collection::PendingActions
  }

  fn key(&self) -> Option<RecordKey> {
    (self.key > 0).then_some(RecordKey::Seq(self.key))
  }

  fn assign_key(&mut self, seq: i64) {
    self.key = seq;
  }
}

/// Next key for an auto-keyed collection: the insertion timestamp, bumped past
/// the last key so keys stay strictly increasing even within one millisecond
/// or after a clock step backwards.
pub fn next_seq(last: i64, now_millis: i64) -> i64 {
  now_millis.max(last + 1)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_collection_names() {
    assert_eq!(Collection::Members.name(), "members");
    assert_eq!(Collection::PendingActions.to_string(), "pendingActions");
    assert!(Collection::PendingActions.auto_keyed());
    assert!(!Collection::Members.auto_keyed());
  }

  #[test]
  fn test_unassigned_action_has_no_key() {
    let action = QueuedAction::new("/fees", json!({"member_id": 7}));
    assert_eq!(action.key(), None);
  }

  #[test]
  fn test_assigned_action_key() {
    let mut action = QueuedAction::new("/fees", json!({}));
    action.assign_key(1_700_000_000_123);
    assert_eq!(action.key(), Some(RecordKey::Seq(1_700_000_000_123)));
  }

  #[test]
  fn test_next_seq_uses_clock() {
    assert_eq!(next_seq(100, 5_000), 5_000);
  }

  #[test]
  fn test_next_seq_same_millisecond() {
    assert_eq!(next_seq(5_000, 5_000), 5_001);
  }

  #[test]
  fn test_next_seq_clock_went_backwards() {
    assert_eq!(next_seq(9_000, 5_000), 9_001);
  }
}
