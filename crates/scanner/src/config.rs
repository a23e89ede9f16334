//! Scanner configuration, read from `CYLINDER_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::debounce::{DebounceConfig, DEFAULT_COOLDOWN_MS, DEFAULT_COUNTDOWN_SECS, DEFAULT_FRAME_TOLERANCE};
use crate::offline_queue::DEFAULT_MAX_QUEUE_BYTES;

pub const DEFAULT_API_URL: &str = "http://localhost:54321";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_REFERENCE_MAX_AGE_HOURS: i64 = 24;
pub const DEFAULT_SUGGESTION_LIMIT: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScannerConfig {
    pub api_url: String,
    pub api_key: String,
    pub auth_token: Option<String>,
    /// SQLite file; `None` means the platform data dir.
    pub database_path: Option<PathBuf>,
    pub debounce: DebounceConfig,
    pub request_timeout: Duration,
    pub reference_max_age: chrono::Duration,
    pub suggestion_limit: usize,
    /// Cap on the persisted offline queue.
    pub queue_max_bytes: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: String::new(),
            auth_token: None,
            database_path: None,
            debounce: DebounceConfig {
                cooldown_ms: DEFAULT_COOLDOWN_MS,
                countdown_secs: DEFAULT_COUNTDOWN_SECS,
                frame_tolerance: DEFAULT_FRAME_TOLERANCE,
            },
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            reference_max_age: chrono::Duration::hours(DEFAULT_REFERENCE_MAX_AGE_HOURS),
            suggestion_limit: DEFAULT_SUGGESTION_LIMIT,
            queue_max_bytes: DEFAULT_MAX_QUEUE_BYTES,
        }
    }
}

impl ScannerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset or blank keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(url) = get("CYLINDER_API_URL") {
            config.api_url = url;
        }
        if let Some(key) = get("CYLINDER_API_KEY") {
            config.api_key = key;
        }
        config.auth_token = get("CYLINDER_AUTH_TOKEN");
        config.database_path = get("CYLINDER_DATA_DIR").map(|dir| PathBuf::from(dir).join("scanner.db"));

        if let Some(raw) = get("CYLINDER_SCAN_COOLDOWN_MS") {
            config.debounce.cooldown_ms = parse("CYLINDER_SCAN_COOLDOWN_MS", raw)?;
        }
        if let Some(raw) = get("CYLINDER_COUNTDOWN_SECS") {
            config.debounce.countdown_secs = parse("CYLINDER_COUNTDOWN_SECS", raw)?;
        }
        if let Some(raw) = get("CYLINDER_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(parse("CYLINDER_REQUEST_TIMEOUT_SECS", raw)?);
        }
        if let Some(raw) = get("CYLINDER_REFERENCE_MAX_AGE_HOURS") {
            let key = "CYLINDER_REFERENCE_MAX_AGE_HOURS";
            let hours: i64 = parse(key, raw.clone())?;
            config.reference_max_age =
                chrono::Duration::try_hours(hours).ok_or(ConfigError::Invalid { key, value: raw })?;
        }
        if let Some(raw) = get("CYLINDER_QUEUE_MAX_MB") {
            let key = "CYLINDER_QUEUE_MAX_MB";
            let megabytes: usize = parse(key, raw.clone())?;
            config.queue_max_bytes = megabytes
                .checked_mul(1024 * 1024)
                .ok_or(ConfigError::Invalid { key, value: raw })?;
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, raw: String) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Invalid { key, value: raw })
}
