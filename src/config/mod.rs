//! Typed configuration from a TOML file and/or environment variables.
//!
//! Loads once at startup, fails fast if required values are missing or
//! malformed. Environment variables override file values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 10_000;
pub const DEFAULT_REPLAY_CHUNK_SIZE: usize = 1_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// e.g. `sqlite://./engine.db`
    pub database_url: String,
    /// Base directory under which each job gets its own workspace.
    pub workspace_dir: PathBuf,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,
    #[serde(default = "default_replay_chunk_size")]
    pub replay_chunk_size: usize,
    /// Start with job execution disabled.
    #[serde(default)]
    pub safe_mode: bool,
    /// Versions of external data sources, copied into every receipt.
    #[serde(default)]
    pub source_pins: BTreeMap<String, String>,
    #[serde(default)]
    pub otel_endpoint: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_subscriber_queue_capacity() -> usize {
    DEFAULT_SUBSCRIBER_QUEUE_CAPACITY
}

fn default_replay_chunk_size() -> usize {
    DEFAULT_REPLAY_CHUNK_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Defaults for everything except the two required locations.
    pub fn new(database_url: impl Into<String>, workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            database_url: database_url.into(),
            workspace_dir: workspace_dir.into(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            subscriber_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
            replay_chunk_size: DEFAULT_REPLAY_CHUNK_SIZE,
            safe_mode: false,
            source_pins: BTreeMap::new(),
            otel_endpoint: None,
            log_level: default_log_level(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(
            required_var("SPINE_DATABASE_URL")?,
            required_var("SPINE_WORKSPACE_DIR")?,
        );
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid config file {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, then let environment variables override.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let mut config = Self::from_file(path)?;
                if let Ok(url) = std::env::var("SPINE_DATABASE_URL") {
                    config.database_url = url;
                }
                if let Ok(dir) = std::env::var("SPINE_WORKSPACE_DIR") {
                    config.workspace_dir = PathBuf::from(dir);
                }
                config.apply_env()?;
                config.validate()?;
                Ok(config)
            }
            None => Self::from_env(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = parsed_var("SPINE_HEARTBEAT_INTERVAL_MS")? {
            self.heartbeat_interval_ms = v;
        }
        if let Some(v) = parsed_var("SPINE_SUBSCRIBER_QUEUE_CAPACITY")? {
            self.subscriber_queue_capacity = v;
        }
        if let Some(v) = parsed_var("SPINE_REPLAY_CHUNK_SIZE")? {
            self.replay_chunk_size = v;
        }
        if let Some(v) = parsed_var("SPINE_SAFE_MODE")? {
            self.safe_mode = v;
        }
        if let Ok(endpoint) = std::env::var("OTEL_ENDPOINT") {
            self.otel_endpoint = Some(endpoint);
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::Config("database_url must not be empty".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::Config("heartbeat_interval_ms must be positive".into()));
        }
        if self.subscriber_queue_capacity == 0 {
            return Err(Error::Config("subscriber_queue_capacity must be positive".into()));
        }
        if self.replay_chunk_size == 0 {
            return Err(Error::Config("replay_chunk_size must be positive".into()));
        }
        Ok(())
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value for {name}: {e}"))),
        Err(_) => Ok(None),
    }
}
