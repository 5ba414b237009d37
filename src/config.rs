//! Configuration loader and validator for the watch-history importer.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::enrich::EnrichSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub takeout: Takeout,
    pub youtube: Youtube,
    pub quota: Quota,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_database")]
    pub database: String,
}

/// Where the export documents live: a single file or a directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Takeout {
    pub path: String,
}

/// YouTube Data API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Youtube {
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,
}

/// Per-run quota budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Quota {
    pub ceiling: u64,
    #[serde(default = "default_cost_per_call")]
    pub cost_per_call: u64,
    #[serde(default = "default_refresh_after_hours")]
    pub refresh_after_hours: u64,
}

/// Most ids one `videos.list` call accepts.
pub const MAX_BATCH_SIZE: usize = 50;

/// Longest freshness window accepted, a century.
pub const MAX_REFRESH_AFTER_HOURS: u64 = 24 * 365 * 100;

fn default_database() -> String {
    "youtube.db".to_string()
}
fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}
fn default_timeout_seconds() -> u64 {
    15
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_max_backoff_seconds() -> u64 {
    60
}
fn default_cost_per_call() -> u64 {
    11
}
fn default_refresh_after_hours() -> u64 {
    24
}

/// Expand a leading `~/` using `HOME`; other paths are returned as given.
pub fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path.to_string(),
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded.
    pub fn resolved_data_dir(&self) -> String {
        expand_home(&self.data_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        Path::new(&self.resolved_data_dir()).join(&self.database)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// Enrichment knobs derived from the `youtube` and `quota` sections.
    pub fn enrich_settings(&self) -> EnrichSettings {
        EnrichSettings {
            batch_size: self.youtube.batch_size,
            cost_per_call: self.quota.cost_per_call,
            max_retries: self.youtube.max_retries,
            retry_base_ms: self.youtube.retry_base_ms,
            max_backoff_seconds: self.youtube.max_backoff_seconds,
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
/// - `YOUTUBE_API_KEY` in the environment overrides `youtube.api_key`.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    if let Ok(key) = std::env::var("YOUTUBE_API_KEY") {
        if !key.trim().is_empty() {
            cfg.youtube.api_key = key;
        }
    }
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.database.trim().is_empty() {
        return Err(ConfigError::Invalid("app.database must be non-empty"));
    }

    if cfg.takeout.path.trim().is_empty() {
        return Err(ConfigError::Invalid("takeout.path must be non-empty"));
    }

    if cfg.youtube.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("youtube.api_key must be non-empty"));
    }
    if cfg.youtube.batch_size == 0 || cfg.youtube.batch_size > MAX_BATCH_SIZE {
        return Err(ConfigError::Invalid("youtube.batch_size must be within 1..=50"));
    }
    if cfg.youtube.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("youtube.timeout_seconds must be > 0"));
    }

    if cfg.quota.cost_per_call == 0 {
        return Err(ConfigError::Invalid("quota.cost_per_call must be > 0"));
    }
    if cfg.quota.refresh_after_hours > MAX_REFRESH_AFTER_HOURS {
        return Err(ConfigError::Invalid(
            "quota.refresh_after_hours must be at most 876000 (100 years)",
        ));
    }
    // a ceiling below one call's cost is allowed: the run then skips enrichment

    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  database: "youtube.db"

takeout:
  path: "./takeout"

youtube:
  api_key: "YOUR_YOUTUBE_DATA_API_KEY"
  batch_size: 50
  timeout_seconds: 15
  max_retries: 3
  retry_base_ms: 500
  max_backoff_seconds: 60

quota:
  ceiling: 9000
  cost_per_call: 11
  refresh_after_hours: 24
"#
}
