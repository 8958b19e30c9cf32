//! Configuration file support for parsedebug
//!
//! Reads from .parsedebug/config.toml, or from the file named by
//! PARSEDEBUG_CONFIG.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Ingestion and progress polling
    #[serde(default)]
    pub load: LoadConfig,

    /// Trace database settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Background query workers
    #[serde(default)]
    pub tasks: TaskConfig,
}

/// Ingestion-related configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoadConfig {
    /// Interval between two load status samples
    /// Default: 1000
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Number of records committed per write transaction
    /// Default: 1000
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Storage-related configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Maximum pooled connections (one is held by the ingester while loading)
    /// Default: 5
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// How long a connection waits on a locked database
    /// Default: 5000
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Where session databases are created (system temp dir when unset)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

/// Task runner configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TaskConfig {
    /// Default: 4
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    1000
}

fn default_pool_size() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_workers() -> usize {
    4
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
            temp_dir: None,
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

impl LoadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Load config from PARSEDEBUG_CONFIG or .parsedebug/config.toml
    /// Returns default config if no file is found or it fails to parse
    pub fn load() -> Self {
        if let Some(path) = Self::find_config_path() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => log::warn!("Ignoring invalid config {}: {}", path.display(), e),
                },
                Err(e) => log::warn!("Unable to read config {}: {}", path.display(), e),
            }
        }
        Self::default()
    }

    /// Find config.toml, env var first, then by walking up the directory tree
    fn find_config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("PARSEDEBUG_CONFIG") {
            return Some(PathBuf::from(path));
        }

        let current_dir = std::env::current_dir().ok()?;
        let mut dir = current_dir.as_path();

        loop {
            let config_path = dir.join(".parsedebug").join("config.toml");
            if config_path.exists() {
                return Some(config_path);
            }

            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        None
    }
}
