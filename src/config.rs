use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Environment variable that overrides `api.url`.
pub const API_URL_ENV: &str = "API_URL";
/// Environment variable holding the bearer token.
pub const API_TOKEN_ENV: &str = "DAYKEEPER_API_TOKEN";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub posts: PostsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the DayKeeper API
  pub url: Option<String>,
  /// Per-request timeout in seconds
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      url: None,
      timeout_secs: default_timeout_secs(),
    }
  }
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Age after which cached data is refetched (default: never)
  pub stale_secs: Option<u64>,
  /// Extra attempts for a failing request
  #[serde(default)]
  pub retry: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostsConfig {
  /// Items per page, used when a page does not say whether more follow
  pub page_size: Option<usize>,
}

impl Config {
  /// Load configuration from file, then apply environment overrides.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./daykeeper.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/daykeeper/config.yaml
  ///
  /// Without a config file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    Ok(config.with_env_overrides())
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("daykeeper.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("daykeeper").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  fn with_env_overrides(mut self) -> Self {
    if let Ok(url) = std::env::var(API_URL_ENV) {
      if !url.trim().is_empty() {
        self.api.url = Some(url);
      }
    }
    self
  }

  /// Parsed base URL of the API.
  pub fn api_url(&self) -> Result<Url> {
    let raw = self.api.url.as_deref().ok_or_else(|| {
      eyre!(
        "API URL not configured. Set {} or api.url in the config file.",
        API_URL_ENV
      )
    })?;

    Url::parse(raw).map_err(|e| eyre!("Invalid API URL '{}': {}", raw, e))
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  pub fn stale_time(&self) -> Option<Duration> {
    self.cache.stale_secs.map(Duration::from_secs)
  }

  /// Bearer token for the API, if one was issued.
  ///
  /// Token acquisition happens elsewhere; this only reads $DAYKEEPER_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var(API_TOKEN_ENV)
      .ok()
      .filter(|token| !token.trim().is_empty())
  }
}
