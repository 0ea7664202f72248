//! In-memory query caches.
//!
//! This module provides the client's only cache of record:
//! - [`QueryCache`] for single values, with request coalescing per key
//! - [`InfiniteQueryCache`] for append-only page sequences
//! - Structural [`CacheKey`]s built from scalar parts
//! - Per-key change notifications via [`Subscription`]
//!
//! Every fetch is tagged with a per-key generation; results of superseded
//! fetches never overwrite newer state.

mod infinite;
mod key;
mod query;
mod state;
mod subscription;

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use infinite::{InfiniteOptions, InfiniteQuery, InfiniteQueryCache};
pub use key::{CacheKey, KeyPart};
pub use query::{Query, QueryCache, QueryOptions};
pub use state::{Page, PagedQueryState, QueryState, QueryStatus};
pub use subscription::Subscription;

type AnyValue = Arc<dyn Any + Send + Sync>;

fn lock<S>(store: &Mutex<S>) -> MutexGuard<'_, S> {
  store.lock().unwrap_or_else(PoisonError::into_inner)
}
