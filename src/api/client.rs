//! DayKeeper API client with query caching.

use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use url::Url;

use super::types::{DayEntries, Post, Profile, SearchHit};
use crate::cache::{
  CacheKey, InfiniteOptions, InfiniteQuery, InfiniteQueryCache, Query, QueryCache, QueryOptions,
};
use crate::cache_key;
use crate::config::Config;
use crate::day::{resolve_day_key, DayKey};
use crate::error::RequestError;
use crate::http::{AuthenticatedFetch, HttpFetch, JsonRequest};

/// A day-scoped query together with the day it resolved to.
#[derive(Debug)]
pub struct ProfileDay {
  pub day: DayKey,
  pub query: Query<Option<DayEntries>>,
}

/// Typed access to the DayKeeper API.
///
/// All reads go through one [`QueryCache`] and one [`InfiniteQueryCache`]
/// owned by the client, so clones of the client share cached data.
#[derive(Clone)]
pub struct DayKeeperClient {
  base: Url,
  api: JsonRequest,
  queries: QueryCache,
  pages: InfiniteQueryCache,
  stale_time: Option<Duration>,
  retry: u32,
  page_size: Option<usize>,
}

impl DayKeeperClient {
  pub fn new(config: &Config) -> Result<Self> {
    let base = config.api_url()?;
    let fetch = HttpFetch::new(Config::get_api_token(), config.timeout())?;

    let mut client = Self::with_fetch(base, Arc::new(fetch));
    client.stale_time = config.stale_time();
    client.retry = config.cache.retry;
    client.page_size = config.posts.page_size;
    Ok(client)
  }

  /// Build a client over any transport.
  pub fn with_fetch(base: Url, fetch: Arc<dyn AuthenticatedFetch>) -> Self {
    let api = JsonRequest::new(fetch);
    Self {
      base,
      queries: QueryCache::new(),
      pages: InfiniteQueryCache::new(api.clone()),
      api,
      stale_time: None,
      retry: 0,
      page_size: None,
    }
  }

  pub fn query_cache(&self) -> &QueryCache {
    &self.queries
  }

  pub fn page_cache(&self) -> &InfiniteQueryCache {
    &self.pages
  }

  /// `GET {API_URL}/{username}`
  pub fn profile(&self, username: &str) -> Result<Query<Option<Profile>>, RequestError> {
    let url = self.endpoint(&[username])?;
    Ok(self.data_query(
      cache_key!["profile", username],
      url,
      !username.is_empty(),
    ))
  }

  /// `GET {API_URL}/{username}/{DD-MM-YYYY}`
  ///
  /// `raw_day` is normalized first; missing or malformed days mean today.
  pub fn profile_day(&self, username: &str, raw_day: Option<&str>) -> Result<ProfileDay, RequestError> {
    let day = resolve_day_key(raw_day);
    let day_segment = day.to_string();
    let url = self.endpoint(&[username, day_segment.as_str()])?;
    let query = self.data_query(
      cache_key!["profile-day", username, day],
      url,
      !username.is_empty(),
    );
    Ok(ProfileDay { day, query })
  }

  /// `GET {API_URL}/{username}/posts?page=N`
  pub fn posts(&self, username: &str) -> Result<InfiniteQuery<Post>, RequestError> {
    let base = self.endpoint_url(&[username, "posts"])?;
    Ok(self.pages.use_infinite_query(
      cache_key!["posts", username],
      move |page| with_query(&base, &[("page", page.to_string())]),
      self.page_options().enabled(!username.is_empty()),
    ))
  }

  /// `GET {API_URL}/search?q=...&page=N`
  pub fn search(&self, query: &str) -> Result<InfiniteQuery<SearchHit>, RequestError> {
    let base = self.endpoint_url(&["search"])?;
    let q = query.trim().to_string();
    let enabled = !q.is_empty();
    Ok(self.pages.use_infinite_query(
      cache_key!["search", q.as_str()],
      move |page| with_query(&base, &[("q", q.clone()), ("page", page.to_string())]),
      self.page_options().enabled(enabled),
    ))
  }

  /// Drop the cached profile of `username`; live observers refetch it.
  pub fn invalidate_profile(&self, username: &str) {
    self.queries.invalidate(&cache_key!["profile", username]);
  }

  /// Forget everything, e.g. on logout.
  pub fn clear(&self) {
    self.queries.clear();
    self.pages.clear();
  }

  fn data_query<T>(&self, key: CacheKey, url: String, enabled: bool) -> Query<Option<T>>
  where
    T: serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
  {
    let api = self.api.clone();
    let mut options = QueryOptions::new().enabled(enabled).retry(self.retry);
    if let Some(stale_time) = self.stale_time {
      options = options.stale_time(stale_time);
    }

    self.queries.use_query(
      key,
      move || {
        let api = api.clone();
        let url = url.clone();
        async move { api.get_data::<T>(&url).await }
      },
      options,
    )
  }

  fn page_options<T>(&self) -> InfiniteOptions<T> {
    let options = InfiniteOptions::new().retry(self.retry);
    match self.page_size {
      Some(size) => options.page_size(size),
      None => options,
    }
  }

  fn endpoint(&self, segments: &[&str]) -> Result<String, RequestError> {
    self.endpoint_url(segments).map(String::from)
  }

  fn endpoint_url(&self, segments: &[&str]) -> Result<Url, RequestError> {
    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| RequestError::InvalidUrl(self.base.to_string()))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }
}

fn with_query(base: &Url, pairs: &[(&str, String)]) -> String {
  let mut url = base.clone();
  url
    .query_pairs_mut()
    .extend_pairs(pairs.iter().map(|(k, v)| (*k, v.as_str())));
  url.into()
}
