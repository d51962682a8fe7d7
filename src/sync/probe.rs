//! Polls server reachability and publishes connectivity transitions.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::Connectivity;

/// Cheap reachability check against the server.
pub trait HealthCheck: Send + Sync {
  fn is_reachable(&self) -> impl Future<Output = bool> + Send;
}

/// Source of online/offline signals for a native client.
pub struct ConnectivityProbe<H: HealthCheck> {
  health: H,
  interval: Duration,
}

impl<H: HealthCheck> ConnectivityProbe<H> {
  pub fn new(health: H, interval: Duration) -> Self {
    Self { health, interval }
  }

  /// Check once and publish the result if it differs from the last one.
  pub async fn check_once(&self, tx: &watch::Sender<Connectivity>) -> Connectivity {
    let state = if self.health.is_reachable().await {
      Connectivity::Online
    } else {
      Connectivity::Offline
    };

    let changed = tx.send_if_modified(|current| {
      if *current == state {
        false
      } else {
        *current = state;
        true
      }
    });
    if changed {
      debug!(%state, "probe observed connectivity change");
    }
    state
  }

  /// Poll until every receiver is gone.
  pub async fn run(self, tx: watch::Sender<Connectivity>) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      ticker.tick().await;
      if tx.is_closed() {
        break;
      }
      self.check_once(&tx).await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::connectivity_channel;
  use std::sync::atomic::{AtomicBool, Ordering};

  #[derive(Default)]
  struct Switch(AtomicBool);

  impl HealthCheck for Switch {
    async fn is_reachable(&self) -> bool {
      self.0.load(Ordering::SeqCst)
    }
  }

  #[tokio::test]
  async fn test_probe_publishes_transitions_only() {
    let probe = ConnectivityProbe::new(Switch::default(), Duration::from_secs(60));
    let (tx, mut rx) = connectivity_channel();
    rx.borrow_and_update();

    assert_eq!(probe.check_once(&tx).await, Connectivity::Offline);
    assert!(!rx.has_changed().unwrap());

    probe.health.0.store(true, Ordering::SeqCst);
    assert_eq!(probe.check_once(&tx).await, Connectivity::Online);
    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow_and_update(), Connectivity::Online);

    probe.check_once(&tx).await;
    assert!(!rx.has_changed().unwrap());
  }

  #[tokio::test]
  async fn test_run_stops_without_receivers() {
    let probe = ConnectivityProbe::new(Switch::default(), Duration::from_millis(1));
    let (tx, rx) = connectivity_channel();
    drop(rx);

    tokio::time::timeout(Duration::from_secs(5), probe.run(tx))
      .await
      .expect("probe should stop once nobody listens");
  }
}
