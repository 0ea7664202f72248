//! In-memory transport for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::{RequestError, Result};
use crate::http::{AuthenticatedFetch, FetchResponse, RequestInit};

#[derive(Clone)]
enum Scripted {
  Response(FetchResponse),
  Fail(RequestError),
}

/// Scripted [`AuthenticatedFetch`].
///
/// Each URL has a queue of replies; the last reply repeats once the queue is
/// down to one. Unknown URLs answer 404.
pub struct ScriptedFetch {
  routes: Mutex<HashMap<String, VecDeque<Scripted>>>,
  calls: Mutex<Vec<(String, RequestInit)>>,
  delay: Duration,
}

impl ScriptedFetch {
  pub fn new() -> Arc<Self> {
    Self::with_delay(Duration::ZERO)
  }

  pub fn with_delay(delay: Duration) -> Arc<Self> {
    Arc::new(Self {
      routes: Mutex::new(HashMap::new()),
      calls: Mutex::new(Vec::new()),
      delay,
    })
  }

  pub fn respond(&self, url: &str, status: u16, body: &str) {
    self.push(
      url,
      Scripted::Response(FetchResponse {
        status,
        body: Ok(body.as_bytes().to_vec()),
      }),
    );
  }

  pub fn respond_unreadable(&self, url: &str, status: u16) {
    self.push(
      url,
      Scripted::Response(FetchResponse {
        status,
        body: Err("body stream closed".into()),
      }),
    );
  }

  pub fn fail(&self, url: &str, error: RequestError) {
    self.push(url, Scripted::Fail(error));
  }

  pub fn calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn calls_to(&self, url: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(u, _)| u == url)
      .count()
  }

  pub fn last_init(&self) -> Option<RequestInit> {
    self.calls.lock().unwrap().last().map(|(_, init)| init.clone())
  }

  fn push(&self, url: &str, reply: Scripted) {
    self
      .routes
      .lock()
      .unwrap()
      .entry(url.to_string())
      .or_default()
      .push_back(reply);
  }

  fn next_reply(&self, url: &str) -> Scripted {
    let mut routes = self.routes.lock().unwrap();
    match routes.get_mut(url) {
      Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
      Some(queue) if !queue.is_empty() => queue[0].clone(),
      _ => Scripted::Response(FetchResponse {
        status: 404,
        body: Ok(b"no route".to_vec()),
      }),
    }
  }
}

impl AuthenticatedFetch for ScriptedFetch {
  fn fetch<'a>(&'a self, url: &'a str, init: RequestInit) -> BoxFuture<'a, Result<FetchResponse>> {
    Box::pin(async move {
      self.calls.lock().unwrap().push((url.to_string(), init));
      let reply = self.next_reply(url);
      if !self.delay.is_zero() {
        tokio::time::sleep(self.delay).await;
      }
      match reply {
        Scripted::Response(response) => Ok(response),
        Scripted::Fail(error) => Err(error),
      }
    })
  }
}
