//! Append-only paged query cache for infinite scrolling.
//!
//! Pages are fetched forward only, one at a time per key, and appended in
//! the order they were requested. A failed page leaves the pages already
//! loaded untouched; the next `fetch_next_page` asks for the same page
//! again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::key::CacheKey;
use super::state::{Page, PagedQueryState, QueryStatus};
use super::subscription::Subscription;
use super::{lock, AnyValue};
use crate::error::{RequestError, Result};
use crate::http::{JsonRequest, RequestInit};

type PageFetch = Shared<BoxFuture<'static, ()>>;
type NextPageParam<T> = Arc<dyn Fn(&Page<T>) -> Option<u32> + Send + Sync>;

/// Options for [`InfiniteQueryCache::use_infinite_query`].
pub struct InfiniteOptions<T> {
  enabled: bool,
  initial_page_param: u32,
  step: u32,
  page_size: Option<usize>,
  retry: u32,
  get_next_page_param: Option<NextPageParam<T>>,
}

impl<T> Default for InfiniteOptions<T> {
  fn default() -> Self {
    Self {
      enabled: true,
      initial_page_param: 1,
      step: 1,
      page_size: None,
      retry: 0,
      get_next_page_param: None,
    }
  }
}

impl<T> Clone for InfiniteOptions<T> {
  fn clone(&self) -> Self {
    Self {
      enabled: self.enabled,
      initial_page_param: self.initial_page_param,
      step: self.step,
      page_size: self.page_size,
      retry: self.retry,
      get_next_page_param: self.get_next_page_param.clone(),
    }
  }
}

impl<T> InfiniteOptions<T> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn initial_page_param(mut self, param: u32) -> Self {
    self.initial_page_param = param;
    self
  }

  /// Distance between consecutive page params (default 1).
  pub fn step(mut self, step: u32) -> Self {
    self.step = step.max(1);
    self
  }

  /// Expected items per page. A page without an explicit `hasMore` flag is
  /// considered final once it returns fewer items than this.
  pub fn page_size(mut self, page_size: usize) -> Self {
    self.page_size = Some(page_size);
    self
  }

  /// Re-request a failing page up to `retry` more times.
  pub fn retry(mut self, retry: u32) -> Self {
    self.retry = retry;
    self
  }

  /// Decide the param after a page; `None` means no further pages.
  pub fn get_next_page_param(
    mut self,
    f: impl Fn(&Page<T>) -> Option<u32> + Send + Sync + 'static,
  ) -> Self {
    self.get_next_page_param = Some(Arc::new(f));
    self
  }

  fn next_param(&self, last: Option<&Page<T>>) -> Option<u32> {
    let Some(last) = last else {
      return Some(self.initial_page_param);
    };

    let next = match &self.get_next_page_param {
      Some(f) => f(last),
      None => last
        .has_more
        .then(|| last.page_param.saturating_add(self.step)),
    };

    // Page params only ever grow
    next.filter(|next| *next > last.page_param)
  }
}

/// Wire shape of one page.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageBody<T> {
  #[serde(default = "Vec::new")]
  data: Vec<T>,
  has_more: Option<bool>,
}

/// Decode a page body. Accepts `{ "data": [...], "hasMore": bool }` or a
/// bare array; anything else becomes an empty, final page.
fn decode_page<T: DeserializeOwned>(value: Value, page_param: u32, page_size: Option<usize>) -> Page<T> {
  let body = match value {
    Value::Null => None,
    Value::Array(_) => serde_json::from_value::<Vec<T>>(value)
      .map(|data| PageBody {
        data,
        has_more: None,
      })
      .ok(),
    other => serde_json::from_value::<PageBody<T>>(other).ok(),
  };

  let Some(body) = body else {
    warn!(page_param, "Page body is empty or malformed, treating as last page");
    return Page {
      items: Vec::new(),
      page_param,
      has_more: false,
    };
  };

  let has_more = body.has_more.unwrap_or_else(|| match page_size {
    Some(size) => body.data.len() >= size,
    None => !body.data.is_empty(),
  });

  Page {
    items: body.data,
    page_param,
    has_more,
  }
}

struct PagedEntry {
  pages: Vec<AnyValue>,
  page_params: Vec<u32>,
  status: QueryStatus,
  error: Option<RequestError>,
  generation: u64,
  in_flight: Option<PageFetch>,
  notify: watch::Sender<u64>,
}

impl PagedEntry {
  fn new() -> Self {
    let (notify, _) = watch::channel(0);
    Self {
      pages: Vec::new(),
      page_params: Vec::new(),
      status: QueryStatus::Idle,
      error: None,
      generation: 0,
      in_flight: None,
      notify,
    }
  }

  fn last_page<T: 'static>(&self) -> Result<Option<&Page<T>>> {
    match self.pages.last() {
      None => Ok(None),
      Some(last) => last
        .downcast_ref::<Page<T>>()
        .map(Some)
        .ok_or_else(|| RequestError::TypeMismatch {
          key: "paged query".to_string(),
        }),
    }
  }

  fn notify(&self) {
    self.notify.send_modify(|version| *version += 1);
  }

  fn is_vacant(&self) -> bool {
    self.status == QueryStatus::Idle && self.pages.is_empty() && self.in_flight.is_none()
  }
}

type PagedStore = HashMap<CacheKey, PagedEntry>;

/// Keyed cache of page sequences, fetched through [`JsonRequest`].
///
/// Cheap to clone; clones share entries.
#[derive(Clone)]
pub struct InfiniteQueryCache {
  store: Arc<Mutex<PagedStore>>,
  generations: Arc<AtomicU64>,
  api: JsonRequest,
}

impl InfiniteQueryCache {
  pub fn new(api: JsonRequest) -> Self {
    Self {
      store: Arc::new(Mutex::new(HashMap::new())),
      generations: Arc::new(AtomicU64::new(0)),
      api,
    }
  }

  /// Observe the page sequence for `key`, fetching the first page if none
  /// is loaded yet. `get_url` builds the request URL for a page param.
  pub fn use_infinite_query<T, U>(
    &self,
    key: CacheKey,
    get_url: U,
    options: InfiniteOptions<T>,
  ) -> InfiniteQuery<T>
  where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
    U: Fn(u32) -> String + Send + Sync + 'static,
  {
    let subscription = {
      let mut store = lock(&self.store);
      let entry = store.entry(key.clone()).or_insert_with(PagedEntry::new);
      Subscription::new(entry.notify.subscribe())
    };

    let query = InfiniteQuery {
      cache: self.clone(),
      key,
      get_url: Arc::new(get_url),
      options,
      subscription,
    };
    query.fetch();
    query
  }

  /// Drop all pages for `key` and discard a page fetch in flight.
  /// Observers see an idle, empty sequence and may call `fetch` again.
  pub fn invalidate(&self, key: &CacheKey) {
    let mut store = lock(&self.store);
    let Some(entry) = store.get_mut(key) else {
      return;
    };

    debug!(key = %key.fingerprint(), "Invalidating paged query");
    if entry.notify.receiver_count() == 0 {
      store.remove(key);
      return;
    }

    entry.generation = self.next_generation();
    entry.in_flight = None;
    entry.pages.clear();
    entry.page_params.clear();
    entry.status = QueryStatus::Idle;
    entry.error = None;
    entry.notify();
  }

  pub fn clear(&self) {
    lock(&self.store).clear();
  }

  pub fn subscriber_count(&self, key: &CacheKey) -> usize {
    lock(&self.store)
      .get(key)
      .map(|entry| entry.notify.receiver_count())
      .unwrap_or(0)
  }

  pub fn len(&self) -> usize {
    lock(&self.store).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn next_generation(&self) -> u64 {
    self.generations.fetch_add(1, Ordering::Relaxed) + 1
  }

  fn release(&self, key: &CacheKey) {
    let mut store = lock(&self.store);
    let vacant = store
      .get(key)
      .is_some_and(|entry| entry.notify.receiver_count() <= 1 && entry.is_vacant());
    if vacant {
      store.remove(key);
    }
  }

  fn in_flight(&self, key: &CacheKey) -> Option<PageFetch> {
    lock(&self.store)
      .get(key)
      .and_then(|entry| entry.in_flight.clone())
  }

  fn start_page_fetch<T>(
    &self,
    store: &mut PagedStore,
    key: &CacheKey,
    page_param: u32,
    url: String,
    page_size: Option<usize>,
    retry: u32,
  ) -> PageFetch
  where
    T: DeserializeOwned + Send + Sync + 'static,
  {
    let generation = self.next_generation();
    let entry = store.entry(key.clone()).or_insert_with(PagedEntry::new);
    entry.generation = generation;

    debug!(key = %key.fingerprint(), page_param, url = %url, "Fetching page");

    let api = self.api.clone();
    let weak = Arc::downgrade(&self.store);
    let commit_key = key.clone();
    let fetch = async move {
      let mut attempt = 0;
      let outcome = loop {
        match api.request_value(&url, RequestInit::default()).await {
          Ok(value) => break Ok(decode_page::<T>(value, page_param, page_size)),
          Err(e) if attempt < retry => {
            attempt += 1;
            debug!(page_param, attempt, error = %e, "Retrying page fetch");
          }
          Err(e) => break Err(e),
        }
      };
      commit_page(&weak, &commit_key, generation, outcome);
    }
    .boxed()
    .shared();

    entry.status = QueryStatus::Loading;
    entry.in_flight = Some(fetch.clone());
    entry.notify();

    tokio::spawn(fetch.clone());
    fetch
  }
}

fn commit_page<T: Send + Sync + 'static>(
  store: &Weak<Mutex<PagedStore>>,
  key: &CacheKey,
  generation: u64,
  outcome: Result<Page<T>>,
) {
  let Some(store) = store.upgrade() else {
    return;
  };
  let mut store = lock(&store);
  let Some(entry) = store.get_mut(key) else {
    return;
  };

  if entry.generation != generation {
    warn!(
      key = %key.fingerprint(),
      generation,
      current = entry.generation,
      "Discarding page from superseded fetch"
    );
    return;
  }

  entry.in_flight = None;
  match outcome {
    Ok(page) => {
      debug!(
        key = %key.fingerprint(),
        page_param = page.page_param,
        items = page.items.len(),
        has_more = page.has_more,
        "Page loaded"
      );
      entry.page_params.push(page.page_param);
      entry.pages.push(Arc::new(page));
      entry.status = QueryStatus::Success;
      entry.error = None;
    }
    Err(e) => {
      debug!(key = %key.fingerprint(), error = %e, "Page fetch failed");
      entry.status = QueryStatus::Error;
      entry.error = Some(e);
    }
  }
  entry.notify();
}

/// Observer of one page sequence.
pub struct InfiniteQuery<T> {
  cache: InfiniteQueryCache,
  key: CacheKey,
  get_url: Arc<dyn Fn(u32) -> String + Send + Sync>,
  options: InfiniteOptions<T>,
  subscription: Subscription,
}

impl<T> InfiniteQuery<T>
where
  T: DeserializeOwned + Clone + Send + Sync + 'static,
{
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Snapshot of the loaded pages.
  pub fn state(&self) -> PagedQueryState<T> {
    if !self.options.enabled {
      return PagedQueryState::default();
    }

    let (pages, page_params, status, error) = {
      let store = lock(&self.cache.store);
      match store.get(&self.key) {
        Some(entry) => (
          entry.pages.clone(),
          entry.page_params.clone(),
          entry.status,
          entry.error.clone(),
        ),
        None => return PagedQueryState::default(),
      }
    };

    let pages: Option<Vec<Page<T>>> = pages
      .iter()
      .map(|page| page.downcast_ref::<Page<T>>().cloned())
      .collect();

    match pages {
      Some(pages) => PagedQueryState {
        pages,
        page_params,
        status,
        error,
      },
      None => PagedQueryState {
        status: QueryStatus::Error,
        error: Some(RequestError::TypeMismatch {
          key: self.key.to_string(),
        }),
        ..PagedQueryState::default()
      },
    }
  }

  /// Whether another page can be requested after the last loaded one.
  pub fn has_next_page(&self) -> bool {
    if !self.options.enabled {
      return false;
    }
    let store = lock(&self.cache.store);
    match store.get(&self.key).map(|entry| entry.last_page::<T>()) {
      Some(Ok(Some(last))) => self.options.next_param(Some(last)).is_some(),
      _ => false,
    }
  }

  /// Load the first page if nothing is loaded or in flight.
  pub fn fetch(&self) {
    if !self.options.enabled {
      return;
    }
    let mut store = lock(&self.cache.store);
    let entry = store.entry(self.key.clone()).or_insert_with(PagedEntry::new);
    if entry.in_flight.is_some() || !entry.pages.is_empty() {
      return;
    }
    let param = self.options.initial_page_param;
    let _ = self.cache.start_page_fetch::<T>(
      &mut store,
      &self.key,
      param,
      (self.get_url)(param),
      self.options.page_size,
      self.options.retry,
    );
  }

  /// Fetch and append the next page.
  ///
  /// Resolves immediately, without a request, when a page fetch is already
  /// in flight for the key or the last page reported no further pages.
  pub async fn fetch_next_page(&self) {
    if !self.options.enabled {
      return;
    }

    let pending = {
      let mut store = lock(&self.cache.store);
      let entry = store.entry(self.key.clone()).or_insert_with(PagedEntry::new);

      if entry.in_flight.is_some() {
        debug!(key = %self.key.fingerprint(), "Page fetch already in flight");
        return;
      }

      let next = match entry.last_page::<T>() {
        Ok(last) => self.options.next_param(last),
        Err(e) => {
          warn!(key = %self.key.fingerprint(), error = %e, "Cannot continue paged query");
          None
        }
      };

      next.map(|param| {
        let url = (self.get_url)(param);
        self.cache.start_page_fetch::<T>(
          &mut store,
          &self.key,
          param,
          url,
          self.options.page_size,
          self.options.retry,
        )
      })
    };

    if let Some(pending) = pending {
      pending.await;
    }
  }

  /// Wait until no page fetch is in flight, then return the state.
  pub async fn settled(&self) -> PagedQueryState<T> {
    while let Some(pending) = self.cache.in_flight(&self.key) {
      pending.await;
    }
    self.state()
  }

  /// Wait for the next change of the sequence. Returns `false` once the
  /// entry has been dropped from the cache.
  pub async fn changed(&mut self) -> bool {
    self.subscription.changed().await
  }
}

impl<T> Drop for InfiniteQuery<T> {
  fn drop(&mut self) {
    if !self.subscription.is_closed() {
      self.cache.release(&self.key);
    }
  }
}
