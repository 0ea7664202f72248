//! Client-side data layer for DayKeeper.
//!
//! - [`http`]: authenticated transport and lenient JSON requests
//! - [`cache`]: keyed query caches with request coalescing and paging
//! - [`day`]: canonical day keys for day-scoped resources
//! - [`api`]: typed, cached access to the DayKeeper API

pub mod api;
pub mod cache;
pub mod config;
pub mod day;
pub mod error;
pub mod http;
pub mod logging;

#[cfg(test)]
mod testing;

pub use error::RequestError;
