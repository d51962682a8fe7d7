use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

use crate::sync::Connectivity;

/// Status changes surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
  /// Connectivity indicator changed
  Connectivity(Connectivity),
  /// A drain pass started
  DrainStarted { pending: usize },
  /// A drain pass ended, completely or at a blocking action
  DrainFinished { delivered: usize, remaining: usize },
  /// A drain pass could not read or update the local store
  DrainFailed(String),
  /// A queued action keeps failing and needs attention
  ActionStuck {
    key: i64,
    endpoint: String,
    attempts: u32,
  },
}

/// Application events
#[derive(Debug)]
pub enum Event {
  Sync(SyncEvent),
  /// Periodic tick for manifest refresh
  Tick,
}

/// Cloneable handle for publishing status events.
#[derive(Debug, Clone)]
pub struct EventSender {
  tx: Option<mpsc::UnboundedSender<Event>>,
}

impl EventSender {
  /// A sender nobody listens to.
  pub fn disconnected() -> Self {
    Self { tx: None }
  }

  pub fn emit(&self, event: SyncEvent) {
    if let Some(tx) = &self.tx {
      if tx.send(Event::Sync(event)).is_err() {
        trace!("status event dropped, no listener");
      }
    }
  }
}

/// Event handler that merges status events with a tick timer
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(tick_rate);
      // First tick fires immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Handle for components that publish status events
  pub fn sender(&self) -> EventSender {
    EventSender {
      tx: Some(self.tx.clone()),
    }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
