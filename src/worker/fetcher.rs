//! Cache worker: network-first fetching with a versioned cache behind it.

use futures::future::join_all;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use super::cache::ResponseCache;
use super::request::{FetchResult, Manifest, Network, Request};
use crate::error::{FetchError, InstallError, StorageError};

/// Lifecycle of the worker's own generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Nothing installed yet; a previous generation may still be in control.
  Idle,
  /// Priming the manifest.
  Installing,
  /// Primed, waiting to take over.
  Waiting,
  /// Evicting stale generations.
  Activating,
  /// In control of every request.
  Active,
  /// Install failed; the generation was thrown away.
  Redundant,
}

/// Result of a periodic manifest refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
  pub refreshed: usize,
  /// Entries that could not be fetched; their cached copies are kept.
  pub failed: Vec<String>,
}

/// Intercepts requests and applies network-first with cache fallback.
///
/// Owns every cache generation. Until its own generation is active, requests
/// are answered from whichever generation is current (the one a previous
/// deploy activated), or straight from the network when there is none.
pub struct CacheWorker<N: Network> {
  network: N,
  cache: Arc<ResponseCache>,
  manifest: Manifest,
  state: Mutex<WorkerState>,
}

impl<N: Network> CacheWorker<N> {
  /// Create a worker for `manifest.generation`.
  ///
  /// If that generation is already current (same deploy, new process), the
  /// worker starts out active.
  pub fn new(network: N, cache: ResponseCache, manifest: Manifest) -> Result<Self, StorageError> {
    let cache = Arc::new(cache);
    let state = if cache.current()?.as_deref() == Some(manifest.generation.as_str()) {
      WorkerState::Active
    } else {
      WorkerState::Idle
    };

    debug!(generation = %manifest.generation, ?state, "cache worker created");
    Ok(Self {
      network,
      cache,
      manifest,
      state: Mutex::new(state),
    })
  }

  pub fn state(&self) -> WorkerState {
    self.state.lock().map(|s| *s).unwrap_or(WorkerState::Redundant)
  }

  pub fn manifest(&self) -> &Manifest {
    &self.manifest
  }

  /// Stored generation names.
  pub fn generations(&self) -> Result<Vec<String>, StorageError> {
    self.cache.generations()
  }

  fn transition(&self, next: WorkerState) {
    if let Ok(mut state) = self.state.lock() {
      let prev = *state;
      if prev != next {
        debug!(generation = %self.manifest.generation, from = ?prev, to = ?next, "worker state");
        *state = next;
      }
    }
  }

  /// Generation that answers requests right now.
  fn controlling_generation(&self) -> Result<Option<String>, StorageError> {
    if self.state() == WorkerState::Active {
      return Ok(Some(self.manifest.generation.clone()));
    }
    self.cache.current()
  }

  /// Prime the generation with every manifest entry, all or nothing.
  ///
  /// On any failure nothing is written, the worker becomes redundant and the
  /// current generation (if any) keeps serving.
  pub async fn install(&self) -> Result<(), InstallError> {
    let generation = self.manifest.generation.clone();
    self.transition(WorkerState::Installing);
    info!(generation = %generation, entries = self.manifest.entries.len(), "installing cache generation");

    let requests: Vec<Request> = self
      .manifest
      .entries
      .iter()
      .map(|url| Request::get(url.as_str()))
      .collect();
    let results = join_all(requests.iter().map(|request| self.network.fetch(request))).await;

    let mut primed = Vec::with_capacity(requests.len());
    let mut failed = Vec::new();
    for (request, result) in requests.into_iter().zip(results) {
      match result {
        Ok(response) if response.is_success() => primed.push((request, response)),
        Ok(response) => {
          warn!(url = %request.url, status = response.status, "manifest entry returned error status");
          failed.push(request.url);
        }
        Err(e) => {
          warn!(url = %request.url, error = %e, "manifest entry unreachable");
          failed.push(request.url);
        }
      }
    }

    if !failed.is_empty() {
      self.fail_install();
      error!(generation = %generation, failed = failed.len(), "install failed, keeping previous generation");
      return Err(InstallError::ManifestFetch { generation, failed });
    }

    if let Err(e) = self.cache.prime(&generation, &primed) {
      self.fail_install();
      return Err(e.into());
    }

    self.transition(WorkerState::Waiting);
    info!(generation = %generation, "cache generation installed");
    Ok(())
  }

  fn fail_install(&self) {
    if let Err(e) = self.cache.discard(&self.manifest.generation) {
      warn!(error = %e, "failed to discard partial generation");
    }
    self.transition(WorkerState::Redundant);
  }

  /// Take over: delete every other generation and serve from this one.
  pub fn activate(&self) -> Result<Vec<String>, InstallError> {
    let generation = &self.manifest.generation;
    match self.state() {
      WorkerState::Waiting | WorkerState::Active => {}
      _ => return Err(InstallError::NotInstalled(generation.clone())),
    }

    self.transition(WorkerState::Activating);
    let evicted = match self.cache.activate(generation) {
      Ok(evicted) => evicted,
      Err(e) => {
        self.transition(WorkerState::Waiting);
        return Err(e.into());
      }
    };

    for name in &evicted {
      info!(generation = %name, "deleted stale cache generation");
    }
    self.transition(WorkerState::Active);
    info!(generation = %generation, "cache generation active");
    Ok(evicted)
  }

  /// Answer one request: network first, then cache, then the fallback page.
  pub async fn handle(&self, request: &Request) -> Result<FetchResult, FetchError> {
    let generation = match self.controlling_generation()? {
      Some(generation) if request.is_cacheable() => generation,
      _ => {
        let response = self.network.fetch(request).await?;
        return Ok(FetchResult::from_network(response, false));
      }
    };

    match self.network.fetch(request).await {
      Ok(response) => {
        let mut stored = false;
        if response.is_success() {
          match self.cache.put(&generation, request, &response) {
            Ok(()) => stored = true,
            Err(e) => warn!(url = %request.url, error = %e, "failed to cache network response"),
          }
        }
        Ok(FetchResult::from_network(response, stored))
      }
      Err(network_error) => {
        debug!(url = %request.url, error = %network_error, "network failed, trying cache");

        if let Some(cached) = self.cache.lookup(&generation, request)? {
          return Ok(FetchResult::from_cache(cached.response, cached.cached_at));
        }

        if request.is_navigation() {
          let fallback = Request::navigate(self.manifest.fallback_page.as_str());
          if let Some(cached) = self.cache.lookup(&generation, &fallback)? {
            info!(url = %request.url, fallback = %fallback.url, "serving fallback page");
            return Ok(FetchResult::fallback(cached.response, cached.cached_at));
          }
        }

        Err(FetchError::CacheMiss {
          url: request.url.clone(),
        })
      }
    }
  }

  /// Re-fetch manifest entries into the active generation.
  ///
  /// Best effort: failures are reported and leave the cached copy in place.
  pub async fn refresh_manifest(&self) -> Result<RefreshReport, StorageError> {
    let mut report = RefreshReport::default();
    if self.state() != WorkerState::Active {
      debug!("worker not active, skipping manifest refresh");
      return Ok(report);
    }

    let generation = &self.manifest.generation;
    for url in &self.manifest.entries {
      let request = Request::get(url.as_str());
      match self.network.fetch(&request).await {
        Ok(response) if response.is_success() => {
          self.cache.put(generation, &request, &response)?;
          report.refreshed += 1;
        }
        Ok(response) => {
          debug!(url = %url, status = response.status, "refresh returned error status");
          report.failed.push(url.clone());
        }
        Err(e) => {
          debug!(url = %url, error = %e, "refresh fetch failed");
          report.failed.push(url.clone());
        }
      }
    }

    info!(
      generation = %generation,
      refreshed = report.refreshed,
      failed = report.failed.len(),
      "refreshed manifest entries"
    );
    Ok(report)
  }
}
