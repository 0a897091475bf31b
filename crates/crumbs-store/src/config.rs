//! Backend configuration.
//!
//! [`Config`] names the data directory and the sync strategy. It can be
//! deserialized from TOML via [`Config::load`] or built in code:
//!
//! ```ignore
//! let config = Config::new("data")
//!     .with_sync(SyncConfig::batch(100, 5));
//! ```
//!
//! ```toml
//! data_dir = "data"
//!
//! [sync]
//! strategy = "batch"
//! batch_size = 100
//! batch_interval = 5
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// When relational mutations are mirrored to the flat files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Persist synchronously inside every mutation.
    #[default]
    Immediate,
    /// Queue everything until detach (or an explicit flush).
    OnClose,
    /// Queue and flush at a size threshold or on an interval timer.
    Batch,
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::OnClose => write!(f, "on_close"),
            Self::Batch => write!(f, "batch"),
        }
    }
}

/// Sync strategy settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub strategy: SyncStrategy,
    /// Queue length that triggers a flush under [`SyncStrategy::Batch`].
    /// Zero disables the size trigger.
    pub batch_size: usize,
    /// Seconds between timer flushes under [`SyncStrategy::Batch`].
    /// Zero disables the timer.
    pub batch_interval: u64,
}

impl SyncConfig {
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn on_close() -> Self {
        Self {
            strategy: SyncStrategy::OnClose,
            ..Self::default()
        }
    }

    pub fn batch(batch_size: usize, batch_interval_secs: u64) -> Self {
        Self {
            strategy: SyncStrategy::Batch,
            batch_size,
            batch_interval: batch_interval_secs,
        }
    }

    /// The timer period, if the timer should run.
    pub fn timer_interval(&self) -> Option<Duration> {
        (self.strategy == SyncStrategy::Batch && self.batch_interval > 0)
            .then(|| Duration::from_secs(self.batch_interval))
    }
}

/// Settings consumed by [`crate::Backend::attach`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the flat files and the disposable index.
    pub data_dir: PathBuf,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Config {
    /// Create a configuration with the default (immediate) sync strategy.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            sync: SyncConfig::default(),
        }
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> StoreResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::io(format!("reading config {}", path.display()), e))?;
        Self::from_toml(&content)
    }

    /// Reject settings the backend cannot run with.
    pub fn validate(&self) -> StoreResult<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(StoreError::Config("data_dir must not be empty".into()));
        }
        if self.sync.strategy == SyncStrategy::Batch
            && self.sync.batch_size == 0
            && self.sync.batch_interval == 0
        {
            return Err(StoreError::Config(
                "batch strategy needs batch_size or batch_interval".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let config = Config::from_toml(r#"data_dir = "/tmp/crumbs""#).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/crumbs"));
        assert_eq!(config.sync.strategy, SyncStrategy::Immediate);
    }

    #[test]
    fn parses_batch_section() {
        let config = Config::from_toml(
            r#"
            data_dir = "d"
            [sync]
            strategy = "batch"
            batch_size = 10
            batch_interval = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.sync, SyncConfig::batch(10, 3));
        assert_eq!(config.sync.timer_interval(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn rejects_unknown_strategy() {
        let err = Config::from_toml(
            r#"
            data_dir = "d"
            [sync]
            strategy = "sometimes"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn rejects_batch_without_thresholds() {
        let config = Config::new("d").with_sync(SyncConfig::batch(0, 0));
        assert!(matches!(config.validate(), Err(StoreError::Config(_))));
    }

    #[test]
    fn rejects_empty_data_dir() {
        assert!(Config::new("").validate().is_err());
    }

    #[test]
    fn timer_only_for_batch() {
        let mut sync = SyncConfig::on_close();
        sync.batch_interval = 5;
        assert_eq!(sync.timer_interval(), None);
    }
}
