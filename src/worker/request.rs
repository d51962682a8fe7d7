//! Request and response types passed through the cache worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;

use crate::error::NetworkError;

/// How the page issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level page navigation; may be answered with the fallback shell.
  Navigate,
  /// Scripts, stylesheets, images, API reads.
  Subresource,
}

/// An intercepted request. `url` is a server path such as `/dashboard`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  pub url: String,
  pub mode: RequestMode,
}

impl Request {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: "GET".to_string(),
      url: url.into(),
      mode: RequestMode::Subresource,
    }
  }

  pub fn navigate(url: impl Into<String>) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Only GET responses are stored.
  pub fn is_cacheable(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }

  /// Stable, fixed-length key of this request inside a generation.
  ///
  /// Navigation and subresource requests for the same URL share a key.
  pub fn cache_key(&self) -> String {
    let input = format!("{} {}", self.method.to_ascii_uppercase(), self.url.trim());

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response as seen by the page, live or replayed from the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub url: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live network response
  Network,
  /// Network failed, served the cached copy of the same request
  Cache,
  /// Network failed and nothing was cached, served the fallback shell page
  Fallback,
}

/// Response handed back to the page, with metadata about its origin.
#[derive(Debug, Clone)]
pub struct FetchResult {
  pub response: Response,
  pub source: ResponseSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// A network response was written to the current generation.
  pub stored: bool,
}

impl FetchResult {
  pub fn from_network(response: Response, stored: bool) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
      stored,
    }
  }

  pub fn from_cache(response: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: ResponseSource::Cache,
      cached_at: Some(cached_at),
      stored: false,
    }
  }

  pub fn fallback(response: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: ResponseSource::Fallback,
      cached_at: Some(cached_at),
      stored: false,
    }
  }
}

/// Network access used by the cache worker.
pub trait Network: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response, NetworkError>> + Send;
}

/// Critical assets primed into a generation on install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
  /// Generation identifier, e.g. `gym-manager-v3`.
  pub generation: String,
  pub entries: Vec<String>,
  /// Page served to navigations that neither network nor cache can answer.
  pub fallback_page: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_key_is_hex_sha256() {
    let key = Request::get("/dashboard").cache_key();
    assert_eq!(key.len(), 64);
    assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
  }

  #[test]
  fn test_navigation_shares_key_with_get() {
    assert_eq!(
      Request::get("/dashboard").cache_key(),
      Request::navigate("/dashboard").cache_key()
    );
  }

  #[test]
  fn test_method_is_part_of_key() {
    let post = Request {
      method: "post".to_string(),
      ..Request::get("/fees")
    };
    assert_ne!(post.cache_key(), Request::get("/fees").cache_key());
    assert!(!post.is_cacheable());
  }

  #[test]
  fn test_response_header_lookup_ignores_case() {
    let response = Response {
      url: "/".into(),
      status: 200,
      headers: vec![("Content-Type".into(), "text/html".into())],
      body: Vec::new(),
    };
    assert_eq!(response.header("content-type"), Some("text/html"));
    assert!(response.is_success());
  }
}
