//! Queue configuration.
//!
//! Values come from explicit builder calls or from the environment
//! (`QueueConfig::from_env`). Each bound port gets its own database file so
//! independently configured instances never share a queue by accident.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

pub const ENV_QUEUE_DIR: &str = "HOSTQ_QUEUE_DIR";
/// Older deployments used this name for the queue directory override.
pub const ENV_QUEUE_DIR_FALLBACK: &str = "MCP_QUEUE_DIR";
pub const ENV_PORT: &str = "HOSTQ_PORT";
pub const ENV_STRICT_PORT: &str = "HOSTQ_STRICT_PORT";
pub const ENV_BUSY_TIMEOUT_MS: &str = "HOSTQ_BUSY_TIMEOUT_MS";
pub const ENV_MAX_CONNECTIONS: &str = "HOSTQ_MAX_CONNECTIONS";
pub const ENV_RECLAIM_INTERVAL_MS: &str = "HOSTQ_RECLAIM_INTERVAL_MS";

const DATABASE_FILE: &str = "jobs.db";

/// Configuration error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Storage and runtime settings for one queue instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Base directory; the database lives in a per-port subdirectory.
    pub queue_dir: PathBuf,
    /// Port this instance is bound to (`None` = unbound).
    pub port: Option<u16>,
    /// Claim only jobs targeted at `port` (no wildcard fallback).
    pub strict_port: bool,
    /// How long a connection waits on a locked database before failing.
    pub busy_timeout: Duration,
    pub max_connections: u32,
    pub reclaim_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_dir: default_queue_dir(),
            port: None,
            strict_port: false,
            busy_timeout: Duration::from_millis(3_000),
            max_connections: 4,
            reclaim_interval: Duration::from_secs(5),
        }
    }
}

impl QueueConfig {
    pub fn new(queue_dir: impl Into<PathBuf>) -> Self {
        Self {
            queue_dir: queue_dir.into(),
            ..Default::default()
        }
    }

    /// Load from the process environment, falling back to defaults for
    /// anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(dir) = get(ENV_QUEUE_DIR).or_else(|| get(ENV_QUEUE_DIR_FALLBACK)) {
            config.queue_dir = PathBuf::from(dir.trim());
        }
        if let Some(raw) = get(ENV_PORT) {
            // Out-of-range ports mean "unbound", matching older deployments.
            config.port = raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|p| (1..=65_535).contains(p))
                .map(|p| p as u16);
        }
        if let Some(raw) = get(ENV_STRICT_PORT) {
            config.strict_port = parse_flag(&raw);
        }
        if let Some(raw) = get(ENV_BUSY_TIMEOUT_MS) {
            config.busy_timeout =
                Duration::from_millis(parse_number(ENV_BUSY_TIMEOUT_MS, &raw)?);
        }
        if let Some(raw) = get(ENV_MAX_CONNECTIONS) {
            let n = parse_number(ENV_MAX_CONNECTIONS, &raw)?;
            if n == 0 || n > u64::from(u32::MAX) {
                return Err(ConfigError::Invalid {
                    var: ENV_MAX_CONNECTIONS,
                    expected: "a positive integer",
                    value: raw,
                });
            }
            config.max_connections = n as u32;
        }
        if let Some(raw) = get(ENV_RECLAIM_INTERVAL_MS) {
            let ms = parse_number(ENV_RECLAIM_INTERVAL_MS, &raw)?;
            config.reclaim_interval = Duration::from_millis(ms.max(1));
        }

        Ok(config)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = (port > 0).then_some(port);
        self
    }

    pub fn with_strict_port(mut self, strict: bool) -> Self {
        self.strict_port = strict;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    /// Directory holding this instance's database (`p<port>` when bound).
    pub fn database_dir(&self) -> PathBuf {
        match self.port {
            Some(port) => self.queue_dir.join(format!("p{port}")),
            None => self.queue_dir.clone(),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_dir().join(DATABASE_FILE)
    }
}

fn default_queue_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(Path::new("hostq"))
        .join("queue")
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_number(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse::<u64>().map_err(|_| ConfigError::Invalid {
        var,
        expected: "a non-negative integer",
        value: raw.to_string(),
    })
}
