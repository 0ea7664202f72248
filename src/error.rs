//! Error types surfaced by the request and cache layers.

use thiserror::Error;

/// Failure of a single API request.
///
/// Errors are stored inside cache entries and handed to every observer of a
/// key, so the type is `Clone` and carries only owned strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
  /// The transport call itself failed (offline, DNS, TLS, ...).
  #[error("network error: {0}")]
  Network(String),

  /// The server answered with a non-2xx status.
  ///
  /// `message` is the response body text, or `Request failed (<status>)`
  /// when the body was empty or unreadable.
  #[error("{message}")]
  Status { status: u16, message: String },

  /// A request URL could not be built from the configured base URL.
  #[error("invalid url: {0}")]
  InvalidUrl(String),

  /// The fetch task ended without producing a result.
  #[error("request was cancelled")]
  Cancelled,

  /// A cache key was reused with a different value type.
  #[error("cache key {key} holds a value of a different type")]
  TypeMismatch { key: String },
}

impl RequestError {
  /// Build a status error from a response body, falling back to a generic
  /// message when the body is empty.
  pub fn from_status(status: u16, body: &str) -> Self {
    let message = if body.is_empty() {
      format!("Request failed ({})", status)
    } else {
      body.to_string()
    };
    Self::Status { status, message }
  }

  /// HTTP status code, if the server answered at all.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Status { status, .. } => Some(*status),
      _ => None,
    }
  }
}

pub type Result<T, E = RequestError> = std::result::Result<T, E>;
