//! JSON request layer on top of [`AuthenticatedFetch`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::fetch::{AuthenticatedFetch, CacheMode, RequestInit};
use crate::error::{RequestError, Result};

/// Issues requests and decodes their JSON bodies.
///
/// Every request bypasses HTTP caching; the query caches are the only cache
/// of record. A 2xx response whose body is not valid JSON (or does not fit
/// the requested type) resolves to `None` instead of failing.
#[derive(Clone)]
pub struct JsonRequest {
  fetch: Arc<dyn AuthenticatedFetch>,
}

impl JsonRequest {
  pub fn new(fetch: Arc<dyn AuthenticatedFetch>) -> Self {
    Self { fetch }
  }

  /// Request `url` and return the raw JSON body (`Null` when unparsable).
  pub async fn request_value(&self, url: &str, init: RequestInit) -> Result<Value> {
    let init = RequestInit {
      cache: CacheMode::NoStore,
      ..init
    };

    debug!(url = %url, method = %init.method, "Sending request");
    let response = self.fetch.fetch(url, init).await?;

    if !response.is_success() {
      let body = response.text();
      debug!(url = %url, status = response.status, "Request failed");
      return Err(RequestError::from_status(response.status, &body));
    }

    let bytes = match response.body {
      Ok(bytes) => bytes,
      Err(e) => {
        warn!(url = %url, error = %e, "Could not read response body, treating as empty");
        return Ok(Value::Null);
      }
    };

    Ok(serde_json::from_slice(&bytes).unwrap_or_else(|e| {
      warn!(url = %url, error = %e, "Response body is not valid JSON, treating as empty");
      Value::Null
    }))
  }

  /// Request `url` and decode the whole body as `T`.
  pub async fn request<T: DeserializeOwned>(&self, url: &str, init: RequestInit) -> Result<Option<T>> {
    let value = self.request_value(url, init).await?;
    Ok(decode(url, value))
  }

  /// `GET` shorthand for [`JsonRequest::request`].
  pub async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
    self.request(url, RequestInit::default()).await
  }

  /// `GET` a `{ "data": T }` envelope and return its payload.
  pub async fn get_data<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
    let mut value = self.request_value(url, RequestInit::default()).await?;
    let data = value.get_mut("data").map(Value::take).unwrap_or(Value::Null);
    Ok(decode(url, data))
  }
}

fn decode<T: DeserializeOwned>(url: &str, value: Value) -> Option<T> {
  if value.is_null() {
    return None;
  }

  serde_json::from_value(value)
    .map_err(|e| warn!(url = %url, error = %e, "Response body has an unexpected shape, treating as empty"))
    .ok()
}
