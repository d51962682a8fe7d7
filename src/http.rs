use color_eyre::{eyre::eyre, Result};
use reqwest::header::{COOKIE, LOCATION};
use reqwest::{redirect, Method};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::{Config, ServerConfig};
use crate::error::{DeliveryError, NetworkError};
use crate::queue::ActionSink;
use crate::store::QueuedAction;
use crate::sync::HealthCheck;
use crate::worker::{Network, Request, Response};

const MAX_REDIRECTS: usize = 10;

/// Gym manager server client
#[derive(Clone)]
pub struct ServerClient {
  client: reqwest::Client,
  base_url: Url,
  health_path: String,
  auth_path: String,
  session: Option<String>,
}

impl ServerClient {
  pub fn new(config: &ServerConfig) -> Result<Self> {
    let base_url = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid server url {}: {}", config.url, e))?;

    // Redirects are followed, except to the login page: that answer means
    // the request was not accepted
    let auth_path = config.auth_path.clone();
    let policy = redirect::Policy::custom(move |attempt| {
      if attempt.url().path() == auth_path {
        attempt.stop()
      } else if attempt.previous().len() >= MAX_REDIRECTS {
        attempt.error("too many redirects")
      } else {
        attempt.follow()
      }
    });

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .redirect(policy)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      health_path: config.health_path.clone(),
      auth_path: config.auth_path.clone(),
      session: Config::get_session(),
    })
  }

  /// Resolve a server path against the base url
  fn url(&self, path: &str) -> std::result::Result<Url, url::ParseError> {
    self.base_url.join(path)
  }

  /// Whether the server sent us to the login page instead of answering.
  fn is_auth_redirect(&self, response: &reqwest::Response) -> bool {
    response.status().is_redirection()
      && response
        .headers()
        .get(LOCATION)
        .and_then(|location| location.to_str().ok())
        .and_then(|location| response.url().join(location).ok())
        .is_some_and(|target| target.path() == self.auth_path)
  }

  fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
    let builder = self.client.request(method, url);
    match &self.session {
      Some(session) => builder.header(COOKIE, session),
      None => builder,
    }
  }
}

impl ActionSink for ServerClient {
  /// POST the queued payload as JSON to its endpoint
  async fn deliver(&self, action: &QueuedAction) -> std::result::Result<(), DeliveryError> {
    // An endpoint that cannot be addressed will never succeed; report it like a 400
    let url = self.url(&action.endpoint).map_err(|e| {
      warn!(endpoint = %action.endpoint, error = %e, "queued endpoint is not a valid path");
      DeliveryError::Rejected {
        endpoint: action.endpoint.clone(),
        status: 400,
      }
    })?;

    let response = self
      .request(Method::POST, url)
      .json(&action.payload)
      .send()
      .await
      .map_err(|e| DeliveryError::Network {
        endpoint: action.endpoint.clone(),
        message: e.to_string(),
      })?;

    let status = response.status();
    if self.is_auth_redirect(&response) {
      warn!(endpoint = %action.endpoint, "server wants a login, check GYM_SYNC_SESSION");
      return Err(DeliveryError::Rejected {
        endpoint: action.endpoint.clone(),
        status: 401,
      });
    }
    if !status.is_success() {
      return Err(DeliveryError::Rejected {
        endpoint: action.endpoint.clone(),
        status: status.as_u16(),
      });
    }

    debug!(endpoint = %action.endpoint, status = status.as_u16(), "server accepted action");
    Ok(())
  }
}

impl Network for ServerClient {
  async fn fetch(&self, request: &Request) -> std::result::Result<Response, NetworkError> {
    let network_error = |message: String| NetworkError {
      url: request.url.clone(),
      message,
    };

    let url = self.url(&request.url).map_err(|e| network_error(e.to_string()))?;
    let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
      .map_err(|e| network_error(e.to_string()))?;

    let response = self
      .request(method, url)
      .send()
      .await
      .map_err(|e| network_error(e.to_string()))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| network_error(e.to_string()))?
      .to_vec();

    Ok(Response {
      url: request.url.clone(),
      status,
      headers,
      body,
    })
  }
}

impl HealthCheck for ServerClient {
  async fn is_reachable(&self) -> bool {
    let Ok(url) = self.url(&self.health_path) else {
      return false;
    };

    match self.request(Method::GET, url).send().await {
      // Any answer means the server is there; auth redirects count too
      Ok(response) => !response.status().is_server_error(),
      Err(e) => {
        debug!(error = %e, "health check failed");
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{Arc, Mutex};
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::{TcpListener, TcpStream};

  fn client(url: &str) -> ServerClient {
    ServerClient::new(&ServerConfig {
      url: url.to_string(),
      health_path: "/health".to_string(),
      timeout_secs: 1,
      auth_path: "/auth".to_string(),
    })
    .unwrap()
  }

  #[test]
  fn test_invalid_base_url_rejected() {
    let result = ServerClient::new(&ServerConfig {
      url: "not a url".to_string(),
      health_path: "/health".to_string(),
      timeout_secs: 1,
      auth_path: "/auth".to_string(),
    });
    assert!(result.is_err());
  }

  #[test]
  fn test_paths_resolve_against_base() {
    let client = client("http://gym.local:5000");
    assert_eq!(
      client.url("/member/7/edit").unwrap().as_str(),
      "http://gym.local:5000/member/7/edit"
    );
  }

  /// Minimal HTTP/1.1 server answering from `routes` (path -> status, location, body).
  async fn stub_server(
    routes: &'static [(&'static str, u16, Option<&'static str>, &'static str)],
  ) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&seen);
    tokio::spawn(async move {
      loop {
        let Ok((mut stream, _)) = listener.accept().await else {
          break;
        };
        let request_line = read_request(&mut stream).await;
        log.lock().unwrap().push(request_line.clone());

        let path = request_line.split_whitespace().nth(1).unwrap_or("/");
        let (status, location, body) = routes
          .iter()
          .find(|(route, ..)| *route == path)
          .map(|(_, status, location, body)| (*status, *location, *body))
          .unwrap_or((404, None, "not found"));

        let mut reply = format!("HTTP/1.1 {} Stub\r\n", status);
        if let Some(location) = location {
          reply.push_str(&format!("Location: {}\r\n", location));
        }
        reply.push_str(&format!(
          "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
          body.len(),
          body
        ));
        stream.write_all(reply.as_bytes()).await.unwrap();
        let _ = stream.shutdown().await;
      }
    });

    (format!("http://{}", addr), seen)
  }

  /// Read one request including its body and return the request line.
  async fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
      let n = stream.read(&mut chunk).await.unwrap();
      if n == 0 {
        return String::new();
      }
      buf.extend_from_slice(&chunk[..n]);
      if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        break pos + 4;
      }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let body_len = head
      .lines()
      .filter_map(|line| line.split_once(':'))
      .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
      .and_then(|(_, value)| value.trim().parse::<usize>().ok())
      .unwrap_or(0);
    while buf.len() < head_end + body_len {
      let n = stream.read(&mut chunk).await.unwrap();
      if n == 0 {
        break;
      }
      buf.extend_from_slice(&chunk[..n]);
    }

    head.lines().next().unwrap_or_default().to_string()
  }

  #[tokio::test]
  async fn test_login_redirect_is_not_a_confirmation() {
    static ROUTES: &[(&str, u16, Option<&str>, &str)] = &[
      ("/fees", 302, Some("/auth"), ""),
      ("/auth", 200, None, "<form>login</form>"),
    ];
    let (url, seen) = stub_server(ROUTES).await;
    let client = client(&url);

    let err = client
      .deliver(&QueuedAction::new("/fees", serde_json::json!({"amount": 2000})))
      .await
      .unwrap_err();

    assert_eq!(
      err,
      DeliveryError::Rejected {
        endpoint: "/fees".to_string(),
        status: 401
      }
    );
    assert!(seen.lock().unwrap().iter().all(|line| !line.contains("/auth")));
  }

  #[tokio::test]
  async fn test_redirect_after_accepted_post_is_success() {
    static ROUTES: &[(&str, u16, Option<&str>, &str)] = &[
      ("/bulk-payment", 302, Some("/bulk_operations"), ""),
      ("/bulk_operations", 200, None, "done"),
    ];
    let (url, seen) = stub_server(ROUTES).await;
    let client = client(&url);

    client
      .deliver(&QueuedAction::new("/bulk-payment", serde_json::json!({"ids": [1, 2]})))
      .await
      .unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen[0].starts_with("POST /bulk-payment"));
    assert!(seen[1].starts_with("GET /bulk_operations"));
  }

  #[tokio::test]
  async fn test_server_error_is_a_rejection() {
    static ROUTES: &[(&str, u16, Option<&str>, &str)] = &[("/add_member", 500, None, "boom")];
    let (url, _seen) = stub_server(ROUTES).await;

    let err = client(&url)
      .deliver(&QueuedAction::new("/add_member", serde_json::json!({"name": "Zoya"})))
      .await
      .unwrap_err();
    assert!(matches!(err, DeliveryError::Rejected { status: 500, .. }));
  }

  #[tokio::test]
  async fn test_unreachable_server_is_a_network_error() {
    // Bind and release a port so nothing is listening on it
    let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let client = client(&format!("http://{}", addr));

    let err = client
      .deliver(&QueuedAction::new("/fees", serde_json::json!({"amount": 2000})))
      .await
      .unwrap_err();
    assert!(err.is_network());

    assert!(client.fetch(&Request::get("/dashboard")).await.is_err());
    assert!(!client.is_reachable().await);
  }
}
