//! SteganoScan Sentinel - LSB Steganography Watchdog
//!
//! This crate watches download folders for newly arrived images, runs a
//! chi-square test over even/odd intensity pairs on each one, and raises an
//! alert when the pair counts are suspiciously balanced.

pub mod alert;
pub mod engine;
pub mod logging;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Re-export commonly used types
pub use alert::{AlertSink, BroadcastSink, FanoutSink, LogSink, NullSink};
pub use engine::{
    DetectionResult, DirectoryWatcher, FileMonitor, LsbAnalyzer, ScanDispatcher, ScanStatus,
};

/// Drop folder in the working directory, watched when it exists
pub const TEST_DOWNLOADS_DIR: &str = "test_downloads";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directories watched (non-recursively) for new images
    pub watch_paths: Vec<PathBuf>,
    pub worker_count: usize,
    pub queue_capacity: usize,
    /// p-values strictly above this are flagged
    pub suspicion_threshold: f64,
    /// Pairs whose mean count is not above this are ignored
    pub min_pair_mean: u32,
    pub max_image_dimension: u32,
    pub max_decode_alloc_bytes: u64,
    /// Seconds between watch directory re-validation; 0 disables it
    pub revalidate_interval_secs: u64,
    /// Rolling log file directory; stderr only when unset
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch_paths: default_watch_paths(),
            worker_count: 4,
            queue_capacity: 64,
            suspicion_threshold: 0.95,
            min_pair_mean: 10,
            max_image_dimension: 16_384,
            max_decode_alloc_bytes: 512 * 1024 * 1024,
            revalidate_interval_secs: 0,
            log_dir: None,
        }
    }
}

impl Config {
    /// Load a TOML config file; missing keys keep their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.suspicion_threshold) {
            return Err(ConfigError::Invalid(format!(
                "suspicion_threshold must be within [0, 1], got {}",
                self.suspicion_threshold
            )));
        }
        if self.max_image_dimension == 0 {
            return Err(ConfigError::Invalid(
                "max_image_dimension must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// The platform download folder, plus `./test_downloads` when present
pub fn default_watch_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(downloads) =
        dirs::download_dir().or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
    {
        paths.push(downloads);
    }
    let local = PathBuf::from(TEST_DOWNLOADS_DIR);
    if local.is_dir() {
        paths.push(local);
    }
    paths
}
