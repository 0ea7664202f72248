//! Snapshot types handed to observers.

use crate::error::RequestError;

/// Lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryStatus {
  /// Not fetched (or disabled)
  #[default]
  Idle,
  /// A fetch is in flight
  Loading,
  /// The last fetch succeeded
  Success,
  /// The last fetch failed
  Error,
}

/// Snapshot of a single-value query.
///
/// While loading or after a failure, `data` still holds the last successful
/// value, if there was one.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
  pub status: QueryStatus,
  pub data: Option<T>,
  pub error: Option<RequestError>,
}

impl<T> Default for QueryState<T> {
  fn default() -> Self {
    Self {
      status: QueryStatus::Idle,
      data: None,
      error: None,
    }
  }
}

impl<T> QueryState<T> {
  pub fn is_idle(&self) -> bool {
    self.status == QueryStatus::Idle
  }

  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_ref()
  }

  pub fn error(&self) -> Option<&RequestError> {
    self.error.as_ref()
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> QueryState<U> {
    QueryState {
      status: self.status,
      data: self.data.map(f),
      error: self.error,
    }
  }
}

/// One fetched page of an ordered resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
  pub items: Vec<T>,
  pub page_param: u32,
  /// Whether the server reported more pages after this one
  pub has_more: bool,
}

/// Snapshot of a paged query. `pages` and `page_params` are parallel.
#[derive(Debug, Clone)]
pub struct PagedQueryState<T> {
  pub pages: Vec<Page<T>>,
  pub page_params: Vec<u32>,
  pub status: QueryStatus,
  pub error: Option<RequestError>,
}

impl<T> Default for PagedQueryState<T> {
  fn default() -> Self {
    Self {
      pages: Vec::new(),
      page_params: Vec::new(),
      status: QueryStatus::Idle,
      error: None,
    }
  }
}

impl<T> PagedQueryState<T> {
  /// All items across pages, in page order.
  pub fn items(&self) -> impl Iterator<Item = &T> {
    self.pages.iter().flat_map(|page| page.items.iter())
  }

  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }
}
