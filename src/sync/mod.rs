//! Connectivity tracking and replay of queued actions.
//!
//! Online/offline transitions travel over a `watch` channel. The observer
//! reacts to every offline -> online edge with one drain pass, and the
//! coordinator makes sure at most one pass runs at a time.

mod coordinator;
mod probe;

pub use coordinator::{DrainOutcome, SyncCoordinator};
pub use probe::{ConnectivityProbe, HealthCheck};

use std::fmt;
use tokio::sync::watch;

/// Reachability of the server as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
  Online,
  #[default]
  Offline,
}

impl Connectivity {
  pub fn is_online(self) -> bool {
    self == Self::Online
  }
}

impl fmt::Display for Connectivity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Online => f.write_str("online"),
      Self::Offline => f.write_str("offline"),
    }
  }
}

/// Connectivity channel, starting offline until the first signal arrives.
pub fn connectivity_channel() -> (watch::Sender<Connectivity>, watch::Receiver<Connectivity>) {
  watch::channel(Connectivity::Offline)
}
