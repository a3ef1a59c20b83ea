//! Tracker configuration.

use crate::error::{Result, TrackerError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tracker configuration.
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// path = "/var/lib/osutrack"
/// float_epsilon = 0.0001
/// query_timeout_ms = 2000
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Base directory of the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Decoded rows kept in memory.
    pub row_cache_size: usize,

    /// fsync the row log every N appends (0 and 1 both mean every append).
    pub sync_interval: u64,

    /// Absolute tolerance when comparing level, pp and accuracy.
    pub float_epsilon: f64,

    /// Extra attempts after a conditional append loses a race.
    pub conflict_retries: u32,

    /// Default deadline for read queries. `None` waits indefinitely.
    pub query_timeout_ms: Option<u64>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./osutrack-data"),
            create_if_missing: true,
            row_cache_size: 4096,
            sync_interval: 100,
            float_epsilon: 1e-4,
            conflict_retries: 3,
            query_timeout_ms: None,
        }
    }
}

impl TrackerConfig {
    /// Default configuration rooted at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let parsed: TrackerConfig = toml::from_str(raw)?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Load a configuration file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<()> {
        if !self.float_epsilon.is_finite() || self.float_epsilon < 0.0 {
            return Err(TrackerError::Config(format!(
                "float_epsilon must be a non-negative number, got {}",
                self.float_epsilon
            )));
        }
        Ok(())
    }
}
