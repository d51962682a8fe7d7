//! Client-facing API over the local store, the action queue and the sync coordinator.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{DeliveryError, StorageError};
use crate::event::EventSender;
use crate::queue::{ActionQueue, ActionSink};
use crate::store::{DurableStore, QueuedAction, Record, RecordKey};
use crate::sync::{Connectivity, DrainOutcome, SyncCoordinator};

/// What happened to a submitted mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
  /// The server confirmed it.
  Delivered,
  /// Stored for the next drain under this key.
  Queued(i64),
  /// The server answered and refused it; nothing was queued.
  Rejected(DeliveryError),
}

pub struct OfflineClient<S: DurableStore, K: ActionSink> {
  store: Arc<S>,
  coordinator: Arc<SyncCoordinator<S, K>>,
  connectivity: watch::Receiver<Connectivity>,
}

impl<S: DurableStore, K: ActionSink> OfflineClient<S, K> {
  pub fn new(
    store: Arc<S>,
    sink: Arc<K>,
    max_attempts: u32,
    events: EventSender,
    connectivity: watch::Receiver<Connectivity>,
  ) -> Self {
    let queue = ActionQueue::new(Arc::clone(&store)).with_max_attempts(max_attempts);
    Self {
      store,
      coordinator: Arc::new(
        SyncCoordinator::new(queue, sink, events).with_connectivity(connectivity.clone()),
      ),
      connectivity,
    }
  }

  pub fn coordinator(&self) -> &Arc<SyncCoordinator<S, K>> {
    &self.coordinator
  }

  pub fn queue(&self) -> &ActionQueue<S> {
    self.coordinator.queue()
  }

  pub fn connectivity(&self) -> Connectivity {
    *self.connectivity.borrow()
  }

  /// Insert or replace a record in its collection.
  pub fn save<R: Record>(&self, record: &R) -> Result<RecordKey, StorageError> {
    self.store.put(record)
  }

  /// Every record of `R`'s collection.
  pub fn get_all<R: Record>(&self) -> Result<Vec<R>, StorageError> {
    self.store.get_all()
  }

  pub fn enqueue(&self, endpoint: &str, data: Value) -> Result<i64, StorageError> {
    self.queue().enqueue(endpoint, data)
  }

  pub async fn drain_once(&self) -> Result<DrainOutcome, StorageError> {
    self.coordinator.drain_once().await
  }

  /// Send a mutation now when online, otherwise queue it.
  ///
  /// A network failure while online also queues it. Only a server refusal
  /// comes back as `Rejected`, since replaying it later would fail the same way.
  pub async fn submit(&self, endpoint: &str, data: Value) -> Result<Submission, StorageError> {
    if !self.connectivity().is_online() {
      return self.enqueue(endpoint, data).map(Submission::Queued);
    }

    let action = QueuedAction::new(endpoint, data);
    match self.coordinator.sink().deliver(&action).await {
      Ok(()) => {
        debug!(endpoint, "submitted directly");
        Ok(Submission::Delivered)
      }
      Err(e) if e.is_network() => {
        info!(endpoint, error = %e, "server unreachable, queueing instead");
        self.enqueue(endpoint, action.payload).map(Submission::Queued)
      }
      Err(e) => Ok(Submission::Rejected(e)),
    }
  }
}
