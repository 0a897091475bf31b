//! Shared helper functions used across CLI subcommands.
//!
//! Includes tracing initialization, configuration resolution and filter
//! argument parsing.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use crumbs_store::{Config, Filter};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Data directory used when neither a config file nor `--data-dir` is given.
pub const DEFAULT_DATA_DIR: &str = "data";

/// Build the store configuration from the command-line options.
///
/// `--data-dir` wins over the file's `data_dir`.
pub fn resolve_config(config: Option<&Path>, data_dir: Option<&Path>) -> Result<Config> {
    let mut resolved = match config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::new(DEFAULT_DATA_DIR),
    };
    if let Some(dir) = data_dir {
        resolved.data_dir = PathBuf::from(dir);
    }
    resolved.validate().context("invalid configuration")?;
    Ok(resolved)
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Turn `key=value` arguments plus paging options into a fetch filter.
pub fn build_filter(pairs: &[String], limit: Option<u64>, offset: Option<u64>) -> Result<Filter> {
    let mut filter = Filter::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("filter `{pair}` is not in key=value form");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("filter `{pair}` has an empty key");
        }
        filter.insert(key.to_string(), parse_value(raw));
    }
    if let Some(limit) = limit {
        filter.insert("limit".into(), Value::from(limit));
    }
    if let Some(offset) = offset {
        filter.insert("offset".into(), Value::from(offset));
    }
    Ok(filter)
}

/// JSON if it parses as JSON, otherwise the raw string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
