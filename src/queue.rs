//! Ordered queue of mutations made while the server was unreachable.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, StorageError};
use crate::store::{Collection, DurableStore, QueuedAction, RecordKey};

/// Failed attempts after which a blocking action is reported as stuck.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Destination for queued actions, normally the live server.
pub trait ActionSink: Send + Sync {
  /// Submit one action. `Ok` means the server confirmed it.
  fn deliver(&self, action: &QueuedAction)
    -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// The action a drain pass stopped at.
#[derive(Debug, Clone)]
pub struct BlockedAction {
  pub key: i64,
  pub endpoint: String,
  pub error: DeliveryError,
  /// Failed attempts including this one.
  pub attempts: u32,
  /// Attempts reached the configured maximum.
  pub stuck: bool,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
  /// Keys delivered and removed, in delivery order.
  pub delivered: Vec<i64>,
  /// Set when the pass stopped early.
  pub blocked: Option<BlockedAction>,
  /// Actions still queued after the pass.
  pub remaining: usize,
}

impl DrainReport {
  pub fn is_complete(&self) -> bool {
    self.blocked.is_none()
  }
}

/// Action queue backed by the `pendingActions` collection.
pub struct ActionQueue<S: DurableStore> {
  store: Arc<S>,
  max_attempts: u32,
}

impl<S: DurableStore> ActionQueue<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self {
      store,
      max_attempts: DEFAULT_MAX_ATTEMPTS,
    }
  }

  /// Set how many failed attempts make a blocking action count as stuck.
  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts.max(1);
    self
  }

  /// Queue a mutation for later delivery and return its key.
  ///
  /// Performs no network I/O.
  pub fn enqueue(&self, endpoint: &str, payload: Value) -> Result<i64, StorageError> {
    if endpoint.trim().is_empty() {
      return Err(StorageError::InvalidRecord(
        "queued action needs an endpoint".into(),
      ));
    }

    let key = self.store.put(&QueuedAction::new(endpoint, payload))?;
    let key = key
      .seq()
      .ok_or_else(|| StorageError::InvalidRecord(format!("unexpected key {}", key)))?;

    info!(key, endpoint, "queued action for later delivery");
    Ok(key)
  }

  /// All queued actions, oldest first.
  pub fn pending(&self) -> Result<Vec<QueuedAction>, StorageError> {
    self.store.get_all()
  }

  /// Number of queued actions.
  pub fn len(&self) -> Result<usize, StorageError> {
    self.store.count(Collection::PendingActions)
  }

  /// Failed delivery count of a queued action.
  pub fn attempts(&self, key: i64) -> Result<u32, StorageError> {
    self.store.attempts(key)
  }

  /// Drop a queued action without delivering it.
  pub fn discard(&self, key: i64) -> Result<(), StorageError> {
    self
      .store
      .delete(Collection::PendingActions, &RecordKey::Seq(key))?;
    warn!(key, "discarded queued action");
    Ok(())
  }

  /// Deliver queued actions in order, stopping at the first failure.
  ///
  /// Each action is removed only after the sink confirms it. A failing action
  /// blocks everything queued after it; later actions may depend on it.
  pub async fn drain_once<K: ActionSink>(&self, sink: &K) -> Result<DrainReport, StorageError> {
    let actions = self.pending()?;
    let mut report = DrainReport::default();

    if actions.is_empty() {
      debug!("no queued actions to drain");
      return Ok(report);
    }

    info!(count = actions.len(), "draining queued actions");

    for action in actions {
      match sink.deliver(&action).await {
        Ok(()) => {
          self
            .store
            .delete(Collection::PendingActions, &RecordKey::Seq(action.key))?;
          debug!(key = action.key, endpoint = %action.endpoint, "delivered queued action");
          report.delivered.push(action.key);
        }
        Err(error) => {
          let attempts = self.store.record_attempt(action.key, &error.to_string())?;
          let stuck = attempts >= self.max_attempts;
          warn!(
            key = action.key,
            endpoint = %action.endpoint,
            attempts,
            stuck,
            error = %error,
            "delivery failed, stopping drain"
          );
          report.blocked = Some(BlockedAction {
            key: action.key,
            endpoint: action.endpoint,
            error,
            attempts,
            stuck,
          });
          break;
        }
      }
    }

    report.remaining = self.store.count(Collection::PendingActions)?;
    Ok(report)
  }
}

impl<S: DurableStore> Clone for ActionQueue<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      max_attempts: self.max_attempts,
    }
  }
}
