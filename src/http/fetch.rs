//! Authenticated transport used by every API request.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::{CACHE_CONTROL, PRAGMA, USER_AGENT};
use reqwest::Method;

use crate::error::{RequestError, Result};

const USER_AGENT_VALUE: &str = concat!("daykeeper/", env!("CARGO_PKG_VERSION"));

/// HTTP-level cache behaviour requested for a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
  /// Let the transport decide.
  #[default]
  Default,
  /// Always go to the network and never store the response.
  NoStore,
}

/// Options for a single request.
#[derive(Debug, Clone, Default)]
pub struct RequestInit {
  pub method: Method,
  pub headers: Vec<(String, String)>,
  pub cache: CacheMode,
}

/// A completed HTTP exchange.
///
/// The body is read eagerly; a failure while reading it is kept as a value
/// so callers can decide how much it matters.
#[derive(Debug, Clone)]
pub struct FetchResponse {
  pub status: u16,
  pub body: Result<Vec<u8>, String>,
}

impl FetchResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Body as text, or an empty string when the body could not be read.
  pub fn text(&self) -> String {
    match &self.body {
      Ok(bytes) => String::from_utf8_lossy(bytes).into_owned(),
      Err(_) => String::new(),
    }
  }
}

/// Transport that attaches whatever credentials the API needs.
///
/// Implementations report transport failures as [`RequestError::Network`];
/// 401/403 and every other status come back as ordinary responses.
pub trait AuthenticatedFetch: Send + Sync {
  fn fetch<'a>(&'a self, url: &'a str, init: RequestInit) -> BoxFuture<'a, Result<FetchResponse>>;
}

/// [`AuthenticatedFetch`] over a shared `reqwest::Client` with bearer auth.
#[derive(Clone)]
pub struct HttpFetch {
  client: reqwest::Client,
  token: Option<String>,
}

impl HttpFetch {
  pub fn new(token: Option<String>, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| RequestError::Network(format!("failed to create HTTP client: {}", e)))?;

    Ok(Self { client, token })
  }
}

impl std::fmt::Debug for HttpFetch {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HttpFetch")
      .field("authenticated", &self.token.is_some())
      .finish_non_exhaustive()
  }
}

impl AuthenticatedFetch for HttpFetch {
  fn fetch<'a>(&'a self, url: &'a str, init: RequestInit) -> BoxFuture<'a, Result<FetchResponse>> {
    Box::pin(async move {
      let mut request = self
        .client
        .request(init.method, url)
        .header(USER_AGENT, USER_AGENT_VALUE);

      if let Some(token) = &self.token {
        request = request.bearer_auth(token);
      }

      if init.cache == CacheMode::NoStore {
        request = request
          .header(CACHE_CONTROL, "no-store")
          .header(PRAGMA, "no-cache");
      }

      for (name, value) in &init.headers {
        request = request.header(name.as_str(), value.as_str());
      }

      let response = request
        .send()
        .await
        .map_err(|e| RequestError::Network(e.to_string()))?;

      let status = response.status().as_u16();
      let body = response
        .bytes()
        .await
        .map(|bytes| bytes.to_vec())
        .map_err(|e| e.to_string());

      Ok(FetchResponse { status, body })
    })
  }
}
