//! HTTP transport and JSON decoding.

mod fetch;
mod json;

pub use fetch::{AuthenticatedFetch, CacheMode, FetchResponse, HttpFetch, RequestInit};
pub use json::JsonRequest;
