//! Application configuration management
//!
//! Follows the teacher's `config/mod.rs` shape: load from environment
//! variables (via `dotenvy` first), with `anyhow::Context` on required
//! values and sane defaults for optional ones.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hostname used in worker identity (`host:pid:startTime`); defaults to
    /// the OS hostname.
    pub worker_hostname: String,

    /// Postgres connection string.
    pub database_url: String,

    /// `jobs.concurrency`: max parallel running jobs.
    pub jobs_concurrency: usize,
    /// `jobs.pollInterval`: job-claim poll period.
    pub jobs_poll_interval: Duration,

    /// `search.retryIntervalHours`: Awaiting retry cadence.
    pub search_retry_interval_hours: f64,

    /// `rss.enabled` / `rss.pollInterval` / `rss.feedUrls`.
    pub rss_enabled: bool,
    pub rss_poll_interval: Duration,
    pub rss_feed_urls: Vec<String>,

    /// `irc.*`
    pub irc_enabled: bool,
    pub irc_server: String,
    pub irc_port: u16,
    pub irc_ssl: bool,
    pub irc_nickname: String,
    pub irc_channels: Vec<String>,
    pub irc_reconnect: bool,
    pub irc_reconnect_delay: Duration,
    pub irc_reconnect_max_retries: u32,
    /// Base download URL the announce grammar's RSS key + torrent id are
    /// appended to when a message carries no inline URL.
    pub irc_download_base_url: String,

    /// `rateLimiter.<name>.capacity`, tokens-per-second per upstream,
    /// collected from any `RATE_LIMIT_<NAME>_CAPACITY` environment variable.
    pub rate_limiter_capacities: HashMap<String, u32>,
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables, reading `.env` first
    /// if present (mirrors `main.rs`'s `dotenvy::dotenv().ok()` call in the
    /// teacher).
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL is required")?;

        let worker_hostname = env::var("WORKER_HOSTNAME").unwrap_or_else(|_| {
            hostname_fallback()
        });

        let irc_channels = env::var("IRC_CHANNELS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let rss_feed_urls = env::var("RSS_FEED_URLS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let mut rate_limiter_capacities = HashMap::new();
        for (key, value) in env::vars() {
            if let Some(name) = key
                .strip_prefix("RATE_LIMIT_")
                .and_then(|s| s.strip_suffix("_CAPACITY"))
            {
                if let Ok(capacity) = value.parse::<u32>() {
                    rate_limiter_capacities.insert(name.to_lowercase(), capacity);
                }
            }
        }

        Ok(Self {
            worker_hostname,
            database_url,

            jobs_concurrency: env::var("JOBS_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            jobs_poll_interval: Duration::from_millis(env_u64("JOBS_POLL_INTERVAL_MS", 1000)),

            search_retry_interval_hours: env::var("SEARCH_RETRY_INTERVAL_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(6.0),

            rss_enabled: env_bool("RSS_ENABLED", true),
            rss_poll_interval: Duration::from_millis(env_u64("RSS_POLL_INTERVAL_MS", 60_000)),
            rss_feed_urls,

            irc_enabled: env_bool("IRC_ENABLED", false),
            irc_server: env::var("IRC_SERVER").unwrap_or_default(),
            irc_port: env::var("IRC_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(6667),
            irc_ssl: env_bool("IRC_SSL", false),
            irc_nickname: env::var("IRC_NICKNAME").unwrap_or_else(|_| "harvestd".to_string()),
            irc_channels,
            irc_reconnect: env_bool("IRC_RECONNECT", true),
            irc_reconnect_delay: Duration::from_millis(env_u64("IRC_RECONNECT_DELAY_MS", 5000)),
            irc_reconnect_max_retries: env::var("IRC_RECONNECT_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            irc_download_base_url: env::var("IRC_DOWNLOAD_BASE_URL").unwrap_or_default(),

            rate_limiter_capacities,
        })
    }
}

fn hostname_fallback() -> String {
    env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_bool_parses_common_truthy_values() {
        unsafe {
            env::set_var("TEST_FLAG_X", "true");
        }
        assert!(env_bool("TEST_FLAG_X", false));
        unsafe {
            env::remove_var("TEST_FLAG_X");
        }
        assert!(!env_bool("TEST_FLAG_X", false));
    }

    #[test]
    fn dotenv_file_values_are_picked_up_by_env_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join(".env");
        std::fs::write(&env_path, "TEST_FLAG_FROM_DOTENV=true\n").unwrap();

        dotenvy::from_path(&env_path).unwrap();
        assert!(env_bool("TEST_FLAG_FROM_DOTENV", false));

        unsafe {
            env::remove_var("TEST_FLAG_FROM_DOTENV");
        }
    }
}
