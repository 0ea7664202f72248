use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use daykeeper::api::DayKeeperClient;
use daykeeper::cache::{InfiniteQuery, PagedQueryState};
use daykeeper::config::{ApiConfig, Config};
use daykeeper::logging;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "daykeeper")]
#[command(about = "Fetch DayKeeper profiles, days, posts and search results as JSON")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/daykeeper/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Base URL of the API (overrides $API_URL and the config file)
  #[arg(long)]
  api_url: Option<String>,

  /// Log to stderr instead of the log file
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show a user's profile
  Profile { username: String },
  /// Show a user's posts, tasks and notes for one day (default: today)
  Day {
    username: String,
    /// Day as DD-MM-YYYY
    #[arg(short, long)]
    date: Option<String>,
  },
  /// List a user's posts
  Posts {
    username: String,
    /// Number of pages to load
    #[arg(short, long, default_value_t = 1)]
    pages: usize,
  },
  /// Search for users
  Search {
    query: String,
    /// Number of pages to load
    #[arg(short, long, default_value_t = 1)]
    pages: usize,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.log_stderr)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override API URL if specified on command line
  let config = if let Some(url) = args.api_url {
    Config {
      api: ApiConfig {
        url: Some(url),
        ..config.api
      },
      ..config
    }
  } else {
    config
  };

  let client = DayKeeperClient::new(&config)?;

  match args.command {
    Command::Profile { username } => {
      info!(username = %username, "Fetching profile");
      let state = client.profile(&username)?.settled().await;
      if let Some(e) = state.error {
        return Err(eyre!("Failed to load profile {}: {}", username, e));
      }
      print_json(&state.data.flatten())?;
    }
    Command::Day { username, date } => {
      let profile_day = client.profile_day(&username, date.as_deref())?;
      info!(username = %username, day = %profile_day.day, "Fetching day");
      let state = profile_day.query.settled().await;
      if let Some(e) = state.error {
        return Err(eyre!(
          "Failed to load {} for {}: {}",
          profile_day.day,
          username,
          e
        ));
      }
      print_json(&serde_json::json!({
        "day": profile_day.day.to_string(),
        "entries": state.data.flatten().unwrap_or_default(),
      }))?;
    }
    Command::Posts { username, pages } => {
      info!(username = %username, pages, "Fetching posts");
      let state = load_pages(client.posts(&username)?, pages).await?;
      print_json(&state.items().collect::<Vec<_>>())?;
    }
    Command::Search { query, pages } => {
      info!(query = %query, pages, "Searching");
      let state = load_pages(client.search(&query)?, pages).await?;
      print_json(&state.items().collect::<Vec<_>>())?;
    }
  }

  Ok(())
}

/// Load up to `pages` pages, stopping early at the last page.
async fn load_pages<T>(query: InfiniteQuery<T>, pages: usize) -> Result<PagedQueryState<T>>
where
  T: DeserializeOwned + Clone + Send + Sync + 'static,
{
  let mut state = query.settled().await;
  while state.error.is_none() && state.pages.len() < pages && query.has_next_page() {
    query.fetch_next_page().await;
    state = query.state();
  }

  if let Some(e) = &state.error {
    return Err(eyre!("Failed to load page {}: {}", state.pages.len() + 1, e));
  }
  Ok(state)
}

fn print_json(value: &impl Serialize) -> Result<()> {
  let json =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to encode output: {}", e))?;
  println!("{}", json);
  Ok(())
}
