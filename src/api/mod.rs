//! DayKeeper API resources and the cached client that serves them.

mod client;
mod types;

pub use client::{DayKeeperClient, ProfileDay};
pub use types::{DayEntries, Note, Post, Profile, SearchHit, Task};
