//! Resources served by the DayKeeper API.
//!
//! Fields default when missing so partially filled responses still decode.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Profile {
  pub username: String,
  pub display_name: Option<String>,
  pub bio: Option<String>,
  pub avatar_url: Option<String>,
  pub followers: u64,
  pub following: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Post {
  pub id: String,
  pub content: String,
  pub created_at: Option<String>,
  pub likes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Task {
  pub id: String,
  pub title: String,
  pub completed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Note {
  pub id: String,
  pub content: String,
}

/// Everything a user recorded on one day
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DayEntries {
  pub posts: Vec<Post>,
  pub tasks: Vec<Task>,
  pub notes: Vec<Note>,
}

impl DayEntries {
  pub fn is_empty(&self) -> bool {
    self.posts.is_empty() && self.tasks.is_empty() && self.notes.is_empty()
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchHit {
  pub username: String,
  pub display_name: Option<String>,
  pub avatar_url: Option<String>,
}
