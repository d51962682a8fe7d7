//! Cache-and-network fetcher.
//!
//! Plays the part of a service worker for the client:
//! - Primes a versioned cache generation with the critical asset manifest
//! - Evicts every other generation when it takes over
//! - Answers requests network-first, falling back to the cache and, for
//!   page navigations, to the dashboard shell

mod cache;
mod fetcher;
mod request;

pub use cache::{CachedResponse, ResponseCache};
pub use fetcher::{CacheWorker, RefreshReport, WorkerState};
pub use request::{
  FetchResult, Manifest, Network, Request, RequestMode, Response, ResponseSource,
};
