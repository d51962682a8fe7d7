//! Drains the action queue when connectivity comes back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::Connectivity;
use crate::error::StorageError;
use crate::event::{EventSender, SyncEvent};
use crate::queue::{ActionQueue, ActionSink, DrainReport};
use crate::store::DurableStore;

/// Result of asking the coordinator for a drain pass.
#[derive(Debug, Clone)]
pub enum DrainOutcome {
  Completed(DrainReport),
  /// Another pass was in flight; nothing was started.
  AlreadyRunning,
}

/// Clears the in-flight flag when a pass ends or its future is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Runs drain passes against the server, one at a time.
pub struct SyncCoordinator<S: DurableStore, K: ActionSink> {
  queue: ActionQueue<S>,
  sink: Arc<K>,
  events: EventSender,
  connectivity: Option<watch::Receiver<Connectivity>>,
  in_flight: AtomicBool,
  /// A drain was asked for while one was running.
  rerun: AtomicBool,
}

impl<S: DurableStore, K: ActionSink> SyncCoordinator<S, K> {
  pub fn new(queue: ActionQueue<S>, sink: Arc<K>, events: EventSender) -> Self {
    Self {
      queue,
      sink,
      events,
      connectivity: None,
      in_flight: AtomicBool::new(false),
      rerun: AtomicBool::new(false),
    }
  }

  /// Only repeat a requested pass while this channel reads online.
  ///
  /// Without one, requested passes always repeat.
  pub fn with_connectivity(mut self, connectivity: watch::Receiver<Connectivity>) -> Self {
    self.connectivity = Some(connectivity);
    self
  }

  pub fn queue(&self) -> &ActionQueue<S> {
    &self.queue
  }

  pub fn sink(&self) -> &K {
    &self.sink
  }

  fn is_online(&self) -> bool {
    self
      .connectivity
      .as_ref()
      .map_or(true, |rx| rx.borrow().is_online())
  }

  /// Run one drain pass unless one is already running.
  ///
  /// A refused call is not lost: the running pass goes round once more when
  /// it finishes, as long as the server still reads online.
  pub async fn drain_once(&self) -> Result<DrainOutcome, StorageError> {
    let mut outcome = DrainOutcome::AlreadyRunning;

    loop {
      if self
        .in_flight
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
      {
        self.rerun.store(true, Ordering::SeqCst);
        if self.in_flight.load(Ordering::SeqCst) {
          debug!("drain already in flight, asked it to run again");
          return Ok(outcome);
        }
        // The running pass ended before it could see the request
        continue;
      }

      let in_flight = InFlight(&self.in_flight);
      self.rerun.store(false, Ordering::SeqCst);

      let mut report = self.pass().await?;
      if let DrainOutcome::Completed(earlier) = outcome {
        let mut delivered = earlier.delivered;
        delivered.append(&mut report.delivered);
        report.delivered = delivered;
      }
      outcome = DrainOutcome::Completed(report);
      drop(in_flight);

      if !self.rerun.load(Ordering::SeqCst) || !self.is_online() {
        return Ok(outcome);
      }
      debug!("drain requested during the last pass, draining again");
    }
  }

  async fn pass(&self) -> Result<DrainReport, StorageError> {
    let pending = self.queue.len()?;
    self.events.emit(SyncEvent::DrainStarted { pending });

    let report = match self.queue.drain_once(self.sink.as_ref()).await {
      Ok(report) => report,
      Err(e) => {
        error!(error = %e, "drain aborted by local store failure");
        self.events.emit(SyncEvent::DrainFailed(e.to_string()));
        return Err(e);
      }
    };

    self.events.emit(SyncEvent::DrainFinished {
      delivered: report.delivered.len(),
      remaining: report.remaining,
    });

    if let Some(blocked) = report.blocked.as_ref().filter(|b| b.stuck) {
      warn!(
        key = blocked.key,
        endpoint = %blocked.endpoint,
        attempts = blocked.attempts,
        "queued action is stuck, it blocks every later action until it succeeds or is discarded"
      );
      self.events.emit(SyncEvent::ActionStuck {
        key: blocked.key,
        endpoint: blocked.endpoint.clone(),
        attempts: blocked.attempts,
      });
    }

    Ok(report)
  }
}

impl<S, K> SyncCoordinator<S, K>
where
  S: DurableStore + 'static,
  K: ActionSink + 'static,
{
  /// Follow connectivity changes until the sender goes away.
  ///
  /// Every offline -> online edge starts one drain pass in the background, and
  /// so does starting out online.
  pub async fn observe(self: Arc<Self>, mut connectivity: watch::Receiver<Connectivity>) {
    let mut last = *connectivity.borrow_and_update();
    self.events.emit(SyncEvent::Connectivity(last));
    if last.is_online() {
      self.spawn_drain();
    }

    while connectivity.changed().await.is_ok() {
      let now = *connectivity.borrow_and_update();
      if now == last {
        continue;
      }

      info!(from = %last, to = %now, "connectivity changed");
      self.events.emit(SyncEvent::Connectivity(now));

      if !last.is_online() && now.is_online() {
        self.spawn_drain();
      }
      last = now;
    }

    debug!("connectivity channel closed, observer stopped");
  }

  fn spawn_drain(self: &Arc<Self>) {
    let coordinator = Arc::clone(self);
    tokio::spawn(async move {
      match coordinator.drain_once().await {
        Ok(DrainOutcome::Completed(report)) => {
          debug!(delivered = report.delivered.len(), remaining = report.remaining, "reconnect drain done")
        }
        Ok(DrainOutcome::AlreadyRunning) => {}
        // Already logged and published by the pass
        Err(_) => {}
      }
    });
  }
}
