//! Keyed single-value query cache.
//!
//! Modelled after TanStack Query: a [`QueryCache`] owns one entry per
//! [`CacheKey`], and [`Query`] observers read snapshots of those entries.
//!
//! # Example
//!
//! ```ignore
//! let cache = QueryCache::new();
//! let api = api.clone();
//! let mut query = cache.use_query(
//!     cache_key!["profile", "alice"],
//!     move || {
//!         let api = api.clone();
//!         async move { api.get_data::<Profile>("https://api.example/alice").await }
//!     },
//!     QueryOptions::new(),
//! );
//!
//! // Re-render whenever the entry changes
//! while query.changed().await {
//!     match query.state().status {
//!         QueryStatus::Loading => render_spinner(),
//!         QueryStatus::Success => render(query.state().data),
//!         QueryStatus::Error => render_error(query.state().error),
//!         QueryStatus::Idle => {}
//!     }
//! }
//! ```
//!
//! Fetches run on spawned tokio tasks, so these methods must be called from
//! within a runtime. A fetch keeps running after its observers are dropped
//! and still populates the cache.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::key::CacheKey;
use super::state::{QueryState, QueryStatus};
use super::subscription::Subscription;
use super::{lock, AnyValue};
use crate::error::{RequestError, Result};

type FetchOutcome = Result<AnyValue>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;
type ErasedFetcher = Arc<dyn Fn() -> BoxFuture<'static, FetchOutcome> + Send + Sync>;
type Projection<T> = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Option<T> + Send + Sync>;

/// Options for [`QueryCache::use_query`].
///
/// `R` is the raw value produced by the fetcher, `T` what the observer sees
/// after `select`.
pub struct QueryOptions<R, T> {
  enabled: bool,
  select: Arc<dyn Fn(&R) -> T + Send + Sync>,
  stale_time: Option<Duration>,
  retry: u32,
}

impl<R: Clone + 'static> QueryOptions<R, R> {
  pub fn new() -> Self {
    Self {
      enabled: true,
      select: Arc::new(R::clone),
      stale_time: None,
      retry: 0,
    }
  }
}

impl<R: Clone + 'static> Default for QueryOptions<R, R> {
  fn default() -> Self {
    Self::new()
  }
}

impl<R, T> QueryOptions<R, T> {
  /// Disabled queries stay idle and never fetch.
  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  /// Project the cached value. The cached value itself is never modified.
  pub fn select<U>(self, select: impl Fn(&R) -> U + Send + Sync + 'static) -> QueryOptions<R, U> {
    QueryOptions {
      enabled: self.enabled,
      select: Arc::new(select),
      stale_time: self.stale_time,
      retry: self.retry,
    }
  }

  /// Treat successful data older than `stale_time` as needing a refetch.
  /// Without this, data stays fresh until invalidated.
  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  /// Re-run a failing fetcher up to `retry` more times.
  pub fn retry(mut self, retry: u32) -> Self {
    self.retry = retry;
    self
  }
}

struct Entry {
  status: QueryStatus,
  data: Option<AnyValue>,
  error: Option<RequestError>,
  updated_at: Option<Instant>,
  /// Tag of the latest fetch start or invalidation. Drawn from the cache's
  /// counter, so it is never reused for a key, even after eviction.
  generation: u64,
  in_flight: Option<SharedFetch>,
  fetcher: Option<ErasedFetcher>,
  notify: watch::Sender<u64>,
}

impl Entry {
  fn new() -> Self {
    let (notify, _) = watch::channel(0);
    Self {
      status: QueryStatus::Idle,
      data: None,
      error: None,
      updated_at: None,
      generation: 0,
      in_flight: None,
      fetcher: None,
      notify,
    }
  }

  fn is_fresh(&self, stale_time: Option<Duration>) -> bool {
    if self.status != QueryStatus::Success {
      return false;
    }
    match (stale_time, self.updated_at) {
      (Some(stale_time), Some(at)) => at.elapsed() < stale_time,
      _ => true,
    }
  }

  fn notify(&self) {
    self.notify.send_modify(|version| *version += 1);
  }

  /// Idle, empty and unfetched: nothing would be lost by dropping it.
  fn is_vacant(&self) -> bool {
    self.status == QueryStatus::Idle && self.data.is_none() && self.in_flight.is_none()
  }
}

type Store = HashMap<CacheKey, Entry>;

/// Process-wide keyed query cache.
///
/// Cheap to clone; clones share entries. Dropping the last clone tears the
/// cache down, and fetches still in flight then complete without effect.
#[derive(Clone, Default)]
pub struct QueryCache {
  store: Arc<Mutex<Store>>,
  generations: Arc<AtomicU64>,
}

impl QueryCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Observe `key`, fetching it with `fetcher` if it is missing or stale.
  ///
  /// A fetch already in flight for `key` is shared instead of starting a
  /// second one.
  pub fn use_query<R, T, F, Fut>(
    &self,
    key: CacheKey,
    fetcher: F,
    options: QueryOptions<R, T>,
  ) -> Query<T>
  where
    R: Send + Sync + 'static,
    T: 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
  {
    let fetcher = erase(fetcher, options.retry);
    let select = options.select;
    let project: Projection<T> = Arc::new(move |raw| raw.downcast_ref::<R>().map(|r| select(r)));

    let subscription = self.subscribe(&key);
    let query = Query {
      cache: self.clone(),
      key,
      project,
      fetcher,
      enabled: options.enabled,
      stale_time: options.stale_time,
      subscription,
    };
    query.fetch();
    query
  }

  /// Fetch `key` (or join the fetch in flight) and wait for the value.
  pub async fn fetch_query<R, F, Fut>(&self, key: CacheKey, fetcher: F) -> Result<Arc<R>>
  where
    R: Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
  {
    let pending = self.ensure_fetch(&key, erase(fetcher, 0), None, false);
    let value = match pending {
      Some(pending) => pending.await?,
      None => self
        .cached_value(&key)
        .ok_or(RequestError::Cancelled)?,
    };

    value
      .downcast::<R>()
      .map_err(|_| RequestError::TypeMismatch {
        key: key.to_string(),
      })
  }

  /// Current state of `key` without triggering a fetch.
  pub fn get_state<R: Clone + 'static>(&self, key: &CacheKey) -> QueryState<R> {
    let (status, data, error) = {
      let store = lock(&self.store);
      match store.get(key) {
        Some(entry) => (entry.status, entry.data.clone(), entry.error.clone()),
        None => return QueryState::default(),
      }
    };
    let data = data.and_then(|raw| raw.downcast_ref::<R>().cloned());
    QueryState {
      status,
      data,
      error,
    }
  }

  /// Register for change notifications on `key`.
  pub fn subscribe(&self, key: &CacheKey) -> Subscription {
    let mut store = lock(&self.store);
    let entry = store.entry(key.clone()).or_insert_with(Entry::new);
    Subscription::new(entry.notify.subscribe())
  }

  /// Number of live subscriptions on `key`.
  pub fn subscriber_count(&self, key: &CacheKey) -> usize {
    lock(&self.store)
      .get(key)
      .map(|entry| entry.notify.receiver_count())
      .unwrap_or(0)
  }

  /// Start a new fetch for `key` with its last known fetcher, superseding
  /// any fetch in flight. Returns `false` if `key` was never fetched.
  pub fn refetch(&self, key: &CacheKey) -> bool {
    let mut store = lock(&self.store);
    let Some(fetcher) = store.get(key).and_then(|entry| entry.fetcher.clone()) else {
      return false;
    };
    let _ = self.start_fetch(&mut store, key, fetcher);
    true
  }

  /// Evict the value stored for `key` and discard any fetch in flight.
  ///
  /// If observers are still subscribed, a fresh fetch starts right away;
  /// otherwise the entry is removed.
  pub fn invalidate(&self, key: &CacheKey) {
    let mut store = lock(&self.store);
    let Some(entry) = store.get_mut(key) else {
      return;
    };

    debug!(key = %key.fingerprint(), "Invalidating query");
    entry.generation = self.next_generation();
    entry.in_flight = None;
    entry.status = QueryStatus::Idle;
    entry.data = None;
    entry.error = None;
    entry.updated_at = None;

    match (entry.notify.receiver_count(), entry.fetcher.clone()) {
      (0, _) => {
        store.remove(key);
      }
      (_, Some(fetcher)) => {
        let _ = self.start_fetch(&mut store, key, fetcher);
      }
      (_, None) => entry.notify(),
    }
  }

  /// Drop every entry. Subscriptions on dropped entries are closed.
  pub fn clear(&self) {
    lock(&self.store).clear();
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

  /// Drop `key` if its last observer is going away and it holds nothing.
  fn release(&self, key: &CacheKey) {
    let mut store = lock(&self.store);
    let vacant = store
      .get(key)
      .is_some_and(|entry| entry.notify.receiver_count() <= 1 && entry.is_vacant());
    if vacant {
      store.remove(key);
    }
  }

  fn cached_value(&self, key: &CacheKey) -> Option<AnyValue> {
    lock(&self.store).get(key).and_then(|entry| entry.data.clone())
  }

  fn in_flight(&self, key: &CacheKey) -> Option<SharedFetch> {
    lock(&self.store)
      .get(key)
      .and_then(|entry| entry.in_flight.clone())
  }

  /// Return the fetch to wait on for `key`, starting one if needed.
  /// `None` means the stored value is fresh.
  fn ensure_fetch(
    &self,
    key: &CacheKey,
    fetcher: ErasedFetcher,
    stale_time: Option<Duration>,
    force: bool,
  ) -> Option<SharedFetch> {
    let mut store = lock(&self.store);
    let entry = store.entry(key.clone()).or_insert_with(Entry::new);

    if !force {
      if let Some(in_flight) = &entry.in_flight {
        debug!(key = %key.fingerprint(), "Joining fetch in flight");
        return Some(in_flight.clone());
      }
      if entry.is_fresh(stale_time) {
        debug!(key = %key.fingerprint(), "Query cache hit");
        return None;
      }
    }

    Some(self.start_fetch(&mut store, key, fetcher))
  }

  fn start_fetch(&self, store: &mut Store, key: &CacheKey, fetcher: ErasedFetcher) -> SharedFetch {
    let generation = self.next_generation();
    let entry = store.entry(key.clone()).or_insert_with(Entry::new);
    entry.generation = generation;

    debug!(key = %key.fingerprint(), generation, "Starting fetch");

    let weak = Arc::downgrade(&self.store);
    let commit_key = key.clone();
    let run = Arc::clone(&fetcher);
    let shared = async move {
      let outcome = run().await;
      commit(&weak, &commit_key, generation, &outcome);
      outcome
    }
    .boxed()
    .shared();

    entry.status = QueryStatus::Loading;
    entry.in_flight = Some(shared.clone());
    entry.fetcher = Some(fetcher);
    entry.notify();

    tokio::spawn(shared.clone());
    shared
  }
}

fn commit(store: &Weak<Mutex<Store>>, key: &CacheKey, generation: u64, outcome: &FetchOutcome) {
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
      "Discarding result of superseded fetch"
    );
    return;
  }

  entry.in_flight = None;
  match outcome {
    Ok(value) => {
      entry.status = QueryStatus::Success;
      entry.data = Some(Arc::clone(value));
      entry.error = None;
      entry.updated_at = Some(Instant::now());
    }
    Err(e) => {
      debug!(key = %key.fingerprint(), error = %e, "Fetch failed");
      entry.status = QueryStatus::Error;
      entry.error = Some(e.clone());
    }
  }
  entry.notify();
}

fn erase<R, F, Fut>(fetcher: F, retry: u32) -> ErasedFetcher
where
  R: Send + Sync + 'static,
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<R>> + Send + 'static,
{
  let fetcher = Arc::new(fetcher);
  Arc::new(move || {
    let fetcher = Arc::clone(&fetcher);
    async move {
      let mut attempt = 0;
      loop {
        match fetcher().await {
          Ok(value) => return Ok(Arc::new(value) as AnyValue),
          Err(e) if attempt < retry => {
            attempt += 1;
            debug!(attempt, error = %e, "Retrying fetch");
          }
          Err(e) => return Err(e),
        }
      }
    }
    .boxed()
  })
}

/// Observer of one cache entry.
///
/// Dropping the observer unsubscribes it; the fetch it started keeps going.
pub struct Query<T> {
  cache: QueryCache,
  key: CacheKey,
  project: Projection<T>,
  fetcher: ErasedFetcher,
  enabled: bool,
  stale_time: Option<Duration>,
  subscription: Subscription,
}

impl<T> Query<T> {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Snapshot of the entry with `select` applied.
  pub fn state(&self) -> QueryState<T> {
    if !self.enabled {
      return QueryState::default();
    }

    let (status, raw, error) = {
      let store = lock(&self.cache.store);
      match store.get(&self.key) {
        Some(entry) => (entry.status, entry.data.clone(), entry.error.clone()),
        None => return QueryState::default(),
      }
    };

    match raw {
      Some(raw) => match (self.project)(raw.as_ref()) {
        Some(data) => QueryState {
          status,
          data: Some(data),
          error,
        },
        None => QueryState {
          status: QueryStatus::Error,
          data: None,
          error: Some(RequestError::TypeMismatch {
            key: self.key.to_string(),
          }),
        },
      },
      None => QueryState {
        status,
        data: None,
        error,
      },
    }
  }

  /// Fetch if the entry is missing, failed, or stale. No-op while a fetch
  /// is in flight or when the query is disabled.
  pub fn fetch(&self) {
    if self.enabled {
      self
        .cache
        .ensure_fetch(&self.key, Arc::clone(&self.fetcher), self.stale_time, false);
    }
  }

  /// Start a new fetch even if data is fresh, superseding one in flight.
  pub fn refetch(&self) {
    if self.enabled {
      self
        .cache
        .ensure_fetch(&self.key, Arc::clone(&self.fetcher), self.stale_time, true);
    }
  }

  /// Wait until no fetch is in flight for the key, then return the state.
  pub async fn settled(&self) -> QueryState<T> {
    while let Some(pending) = self.cache.in_flight(&self.key) {
      let _ = pending.await;
    }
    self.state()
  }

  /// Wait for the next change of the entry. Returns `false` once the entry
  /// has been dropped from the cache.
  pub async fn changed(&mut self) -> bool {
    self.subscription.changed().await
  }
}

impl<T> Drop for Query<T> {
  fn drop(&mut self) {
    // Our own subscription is still registered at this point
    if !self.subscription.is_closed() {
      self.cache.release(&self.key);
    }
  }
}

impl<T> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("enabled", &self.enabled)
      .field("stale_time", &self.stale_time)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache_key;
  use crate::http::JsonRequest;
  use crate::testing::ScriptedFetch;
  use serde_json::Value;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn counting_fetcher(
    counter: &Arc<AtomicU32>,
    delay: Duration,
  ) -> impl Fn() -> BoxFuture<'static, Result<u32>> + Send + Sync + 'static {
    let counter = Arc::clone(counter);
    move || {
      let counter = Arc::clone(&counter);
      async move {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        Ok(n)
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn test_query_success() {
    let cache = QueryCache::new();
    let counter = Arc::new(AtomicU32::new(0));

    let query = cache.use_query(
      cache_key!["n"],
      counting_fetcher(&counter, Duration::ZERO),
      QueryOptions::new(),
    );
    assert!(query.state().is_loading());

    let state = query.settled().await;
    assert!(state.is_success());
    assert_eq!(state.data, Some(0));
    assert!(state.error.is_none());
  }

  #[tokio::test]
  async fn test_disabled_query_stays_idle() {
    let cache = QueryCache::new();
    let counter = Arc::new(AtomicU32::new(0));

    let query = cache.use_query(
      cache_key!["n"],
      counting_fetcher(&counter, Duration::ZERO),
      QueryOptions::new().enabled(false),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(query.state().is_idle());
    assert_eq!(counter.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_concurrent_observers_share_one_request() {
    let fetch = ScriptedFetch::with_delay(Duration::from_millis(20));
    fetch.respond("/alice", 200, r#"{"data":{"name":"alice"}}"#);
    let api = JsonRequest::new(fetch.clone());
    let cache = QueryCache::new();

    let make_fetcher = || {
      let api = api.clone();
      move || {
        let api = api.clone();
        async move { api.get_data::<Value>("/alice").await }
      }
    };

    let first = cache.use_query(cache_key!["profile", "alice"], make_fetcher(), QueryOptions::new());
    let second = cache.use_query(
      cache_key!["profile", String::from("alice")],
      make_fetcher(),
      QueryOptions::new(),
    );

    let (a, b) = tokio::join!(first.settled(), second.settled());
    assert_eq!(fetch.calls(), 1);
    assert_eq!(a.data, b.data);
    assert!(a.is_success());
  }

  #[tokio::test]
  async fn test_fetch_query_coalesces_with_observer() {
    let cache = QueryCache::new();
    let counter = Arc::new(AtomicU32::new(0));
    let key = cache_key!["n"];

    let _query = cache.use_query(
      key.clone(),
      counting_fetcher(&counter, Duration::from_millis(20)),
      QueryOptions::new(),
    );
    let value = cache
      .fetch_query(key, counting_fetcher(&counter, Duration::ZERO))
      .await
      .unwrap();

    assert_eq!(*value, 0);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_fresh_entry_is_served_without_request() {
    let cache = QueryCache::new();
    let counter = Arc::new(AtomicU32::new(0));

    let first = cache.use_query(
      cache_key!["n"],
      counting_fetcher(&counter, Duration::ZERO),
      QueryOptions::new(),
    );
    first.settled().await;

    let second = cache.use_query(
      cache_key!["n"],
      counting_fetcher(&counter, Duration::ZERO),
      QueryOptions::new(),
    );
    assert!(second.state().is_success());
    assert_eq!(second.state().data, Some(0));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_zero_stale_time_refetches() {
    let cache = QueryCache::new();
    let counter = Arc::new(AtomicU32::new(0));
    let options = || QueryOptions::new().stale_time(Duration::ZERO);

    let first = cache.use_query(cache_key!["n"], counting_fetcher(&counter, Duration::ZERO), options());
    first.settled().await;

    let second = cache.use_query(cache_key!["n"], counting_fetcher(&counter, Duration::ZERO), options());
    assert!(second.state().is_loading());
    assert_eq!(second.state().data, Some(0));
    assert_eq!(second.settled().await.data, Some(1));
  }

  #[tokio::test]
  async fn test_failure_keeps_previous_data() {
    let fetch = ScriptedFetch::new();
    fetch.respond("/alice", 200, r#"{"data":"hello"}"#);
    fetch.respond("/alice", 404, "user not found");
    let api = JsonRequest::new(fetch.clone());
    let cache = QueryCache::new();

    let query = cache.use_query(
      cache_key!["profile", "alice"],
      move || {
        let api = api.clone();
        async move { api.get_data::<String>("/alice").await }
      },
      QueryOptions::new(),
    );
    assert_eq!(query.settled().await.data, Some(Some("hello".to_string())));

    query.refetch();
    let state = query.settled().await;
    assert!(state.is_error());
    assert_eq!(state.error.unwrap().to_string(), "user not found");
    assert_eq!(state.data, Some(Some("hello".to_string())));
  }

  #[tokio::test]
  async fn test_unparsable_success_is_null_data() {
    let fetch = ScriptedFetch::new();
    fetch.respond("/alice", 200, "not json");
    let api = JsonRequest::new(fetch.clone());
    let cache = QueryCache::new();

    let query = cache.use_query(
      cache_key!["profile", "alice"],
      move || {
        let api = api.clone();
        async move { api.get_data::<Value>("/alice").await }
      },
      QueryOptions::new(),
    );

    let state = query.settled().await;
    assert!(state.is_success());
    assert_eq!(state.data, Some(None));
  }

  #[tokio::test]
  async fn test_select_projections_are_independent() {
    let cache = QueryCache::new();
    let fetcher = || || async { Ok::<_, RequestError>(vec![3, 1, 2]) };

    let len = cache.use_query(
      cache_key!["list"],
      fetcher(),
      QueryOptions::new().select(|v: &Vec<i32>| v.len()),
    );
    let sum = cache.use_query(
      cache_key!["list"],
      fetcher(),
      QueryOptions::new().select(|v: &Vec<i32>| v.iter().sum::<i32>()),
    );

    assert_eq!(len.settled().await.data, Some(3));
    assert_eq!(sum.state().data, Some(6));
    assert_eq!(cache.get_state::<Vec<i32>>(&cache_key!["list"]).data, Some(vec![3, 1, 2]));
  }

  #[tokio::test]
  async fn test_superseded_fetch_result_is_discarded() {
    let cache = QueryCache::new();
    let counter = Arc::new(AtomicU32::new(0));
    let calls = Arc::clone(&counter);

    // First call is slow, second is fast: the slow one resolves last.
    let query = cache.use_query(
      cache_key!["n"],
      move || {
        let calls = Arc::clone(&calls);
        async move {
          let n = calls.fetch_add(1, Ordering::SeqCst);
          let delay = if n == 0 { 60 } else { 5 };
          tokio::time::sleep(Duration::from_millis(delay)).await;
          Ok::<_, RequestError>(n)
        }
      },
      QueryOptions::new(),
    );
    tokio::time::sleep(Duration::from_millis(1)).await;
    query.refetch();

    assert_eq!(query.settled().await.data, Some(1));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(query.state().data, Some(1));
    assert_eq!(counter.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_subscribers_are_notified() {
    let cache = QueryCache::new();
    let counter = Arc::new(AtomicU32::new(0));

    let mut query = cache.use_query(
      cache_key!["n"],
      counting_fetcher(&counter, Duration::from_millis(5)),
      QueryOptions::new(),
    );

    // Loading was already signalled when the fetch started
    assert!(query.changed().await);
    assert!(query.state().is_loading());

    assert!(query.changed().await);
    assert!(query.state().is_success());
  }

  #[tokio::test]
  async fn test_dropped_observer_unsubscribes_but_fetch_completes() {
    let cache = QueryCache::new();
    let counter = Arc::new(AtomicU32::new(0));
    let key = cache_key!["n"];

    let query = cache.use_query(
      key.clone(),
      counting_fetcher(&counter, Duration::from_millis(5)),
      QueryOptions::new(),
    );
    assert_eq!(cache.subscriber_count(&key), 1);
    drop(query);
    assert_eq!(cache.subscriber_count(&key), 0);

    tokio::time::sleep(Duration::from_millis(30)).await;
    let state = cache.get_state::<u32>(&key);
    assert!(state.is_success());
    assert_eq!(state.data, Some(0));
  }

  #[tokio::test]
  async fn test_retry_reissues_failed_fetch() {
    let cache = QueryCache::new();
    let counter = Arc::new(AtomicU32::new(0));
    let calls = Arc::clone(&counter);

    let query = cache.use_query(
      cache_key!["flaky"],
      move || {
        let calls = Arc::clone(&calls);
        async move {
          match calls.fetch_add(1, Ordering::SeqCst) {
            0 => Err(RequestError::Network("offline".into())),
            n => Ok(n),
          }
        }
      },
      QueryOptions::new().retry(1),
    );

    assert_eq!(query.settled().await.data, Some(1));
    assert_eq!(counter.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_invalidate_refetches_for_observers() {
    let cache = QueryCache::new();
    let counter = Arc::new(AtomicU32::new(0));
    let key = cache_key!["n"];

    let query = cache.use_query(
      key.clone(),
      counting_fetcher(&counter, Duration::ZERO),
      QueryOptions::new(),
    );
    query.settled().await;

    cache.invalidate(&key);
    assert!(query.state().is_loading());
    assert_eq!(query.state().data, None);
    assert_eq!(query.settled().await.data, Some(1));
  }

  #[tokio::test]
  async fn test_invalidate_without_observers_evicts() {
    let cache = QueryCache::new();
    let key = cache_key!["n"];

    cache
      .fetch_query(key.clone(), || async { Ok::<_, RequestError>(7u8) })
      .await
      .unwrap();
    assert_eq!(cache.len(), 1);

    cache.invalidate(&key);
    assert!(cache.is_empty());
    assert!(cache.get_state::<u8>(&key).is_idle());
  }

  /// First call resolves to "old" after 60ms, later calls to "new" at once.
  fn old_then_new(
    calls: &Arc<AtomicU32>,
  ) -> impl Fn() -> BoxFuture<'static, Result<String>> + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move || {
      let calls = Arc::clone(&calls);
      async move {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
          tokio::time::sleep(Duration::from_millis(60)).await;
          Ok("old".to_string())
        } else {
          Ok("new".to_string())
        }
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn test_fetch_from_before_eviction_is_discarded() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = cache_key!["profile", "alice"];

    let old = cache.use_query(key.clone(), old_then_new(&calls), QueryOptions::new());
    drop(old);
    cache.invalidate(&key);
    assert!(cache.is_empty());

    let new = cache.use_query(key.clone(), old_then_new(&calls), QueryOptions::new());
    assert_eq!(new.settled().await.data, Some("new".to_string()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(new.state().data, Some("new".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_fetch_from_before_clear_is_discarded() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = cache_key!["profile", "alice"];

    let _old = cache.use_query(key.clone(), old_then_new(&calls), QueryOptions::new());
    cache.clear();

    let new = cache.use_query(key.clone(), old_then_new(&calls), QueryOptions::new());
    assert_eq!(new.settled().await.data, Some("new".to_string()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(new.state().data, Some("new".to_string()));
    assert_eq!(cache.get_state::<String>(&key).data, Some("new".to_string()));
  }

  #[tokio::test]
  async fn test_unused_idle_entries_are_dropped_with_observer() {
    let cache = QueryCache::new();
    let counter = Arc::new(AtomicU32::new(0));

    let disabled = cache.use_query(
      cache_key!["search", "a"],
      counting_fetcher(&counter, Duration::ZERO),
      QueryOptions::new().enabled(false),
    );
    assert_eq!(cache.len(), 1);
    drop(disabled);
    assert!(cache.is_empty());

    // Entries holding data outlive their observers
    let loaded = cache.use_query(
      cache_key!["search", "b"],
      counting_fetcher(&counter, Duration::ZERO),
      QueryOptions::new(),
    );
    loaded.settled().await;
    drop(loaded);
    assert_eq!(cache.len(), 1);
  }

  #[tokio::test]
  async fn test_observer_of_cleared_entry_leaves_new_entry_alone() {
    let cache = QueryCache::new();
    let counter = Arc::new(AtomicU32::new(0));
    let disabled = || QueryOptions::new().enabled(false);

    let before = cache.use_query(cache_key!["n"], counting_fetcher(&counter, Duration::ZERO), disabled());
    cache.clear();
    let after = cache.use_query(cache_key!["n"], counting_fetcher(&counter, Duration::ZERO), disabled());

    drop(before);
    assert_eq!(cache.subscriber_count(&cache_key!["n"]), 1);
    drop(after);
    assert!(cache.is_empty());
  }

  #[tokio::test]
  async fn test_type_mismatch_is_reported() {
    let cache = QueryCache::new();
    let key = cache_key!["n"];

    cache
      .fetch_query(key.clone(), || async { Ok::<_, RequestError>(7u8) })
      .await
      .unwrap();

    let err = cache
      .fetch_query(key, || async { Ok::<_, RequestError>("seven".to_string()) })
      .await
      .unwrap_err();
    assert!(matches!(err, RequestError::TypeMismatch { .. }));
  }
}
