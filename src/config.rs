//! Application configuration and environment variable parsing.
//!
//! This module handles loading configuration settings from the environment (e.g., .env file).
//! It defines the `AppConfig` struct which governs behavior such as the GitHub token, the
//! dataset root, retry limits and cache TTLs. Everything is read once at startup and handed
//! down as explicit values; nothing below `main` reads the environment.

use crate::collector::EventIdentity;
use crate::github::ApiConfig;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration as StdDuration;

/// A unique identifier for a GitHub repository.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId {
    /// The owner of the repository (e.g., "facebook").
    pub owner: String,
    /// The name of the repository (e.g., "react").
    pub repo: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// The `owner/repo` form used in CSV rows.
    pub fn slug(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("'{0}' is not a valid GitHub repository (expected owner/repo or https://github.com/owner/repo)")]
pub struct InvalidRepoId(String);

impl FromStr for RepoId {
    type Err = InvalidRepoId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let path = trimmed
            .strip_prefix("https://github.com/")
            .or_else(|| trimmed.strip_prefix("http://github.com/"))
            .unwrap_or(trimmed);
        let path = path.strip_suffix('/').unwrap_or(path);

        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != 2 || !parts.iter().all(|part| is_valid_segment(part)) {
            return Err(InvalidRepoId(s.to_string()));
        }

        Ok(RepoId::new(parts[0], parts[1]))
    }
}

/// GitHub owner and repository names: ASCII alphanumerics plus `_`, `.` and `-`.
/// `.` and `..` are rejected so a slug can never escape the data directory.
fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Application configuration loaded from environment variables.
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    /// GitHub Personal Access Token. Unauthenticated requests get a much smaller quota.
    pub github_token: Option<String>,

    /// Root of the on-disk dataset.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Base URL of the GitHub REST API.
    #[serde(default = "default_github_api_url")]
    pub github_api_url: String,

    /// Page size for list endpoints (GitHub caps this at 100).
    #[serde(default = "default_per_page")]
    pub github_per_page: u32,

    /// Hard limit on the number of paginated requests per listing.
    #[serde(default = "default_max_pages")]
    pub max_github_api_pages: u32,

    /// Attempts per request before a recoverable error becomes fatal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,

    /// Number of PRs `collect` fetches when `--num-prs` is not given.
    #[serde(default = "default_pr_count")]
    pub default_pr_count: usize,

    /// How timeline events are matched when merging into an existing table.
    #[serde(default)]
    pub event_identity: EventIdentity,

    /// Time to live for cached repository metrics in seconds.
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,

    /// Maximum number of entries to keep in the metrics cache.
    #[serde(default = "default_cache_max_capacity")]
    pub cache_max_capacity: u64,

    /// The number of individual data points (days) in the flow metric.
    #[serde(default = "default_metrics_days")]
    pub metrics_days_to_display: i64,

    /// The size of the trailing window (in days) used for the flow metric's rolling counts.
    #[serde(default = "default_metrics_days")]
    pub metrics_window_size: i64,

    /// Port the dashboard API listens on.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_per_page() -> u32 {
    100
}

fn default_max_pages() -> u32 {
    1000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_secs() -> u64 {
    300
}

fn default_pr_count() -> usize {
    10
}

fn default_cache_ttl_seconds() -> u64 {
    300
}

fn default_cache_max_capacity() -> u64 {
    100
}

fn default_metrics_days() -> i64 {
    30
}

fn default_port() -> u16 {
    3000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            github_token: None,
            data_dir: default_data_dir(),
            github_api_url: default_github_api_url(),
            github_per_page: default_per_page(),
            max_github_api_pages: default_max_pages(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            default_pr_count: default_pr_count(),
            event_identity: EventIdentity::default(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            cache_max_capacity: default_cache_max_capacity(),
            metrics_days_to_display: default_metrics_days(),
            metrics_window_size: default_metrics_days(),
            port: default_port(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    pub fn cache_ttl(&self) -> StdDuration {
        StdDuration::from_secs(self.cache_ttl_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.max(1),
            base_delay: StdDuration::from_millis(self.retry_base_delay_ms),
            max_delay: StdDuration::from_secs(self.retry_max_delay_secs),
        }
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.github_api_url.trim_end_matches('/').to_string(),
            token: self.github_token.clone(),
            per_page: self.github_per_page.clamp(1, 100),
            max_pages: self.max_github_api_pages.max(1),
            retry: self.retry_policy(),
        }
    }
}
