//! CLI argument definitions for the crumbs store.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// crumbs -- inspect and maintain a crumbs data directory.
#[derive(Parser)]
#[command(
    name = "crumbs",
    version,
    about = "crumbs -- inspect and maintain a crumbs data directory",
    long_about = "Attaches to a crumbs data directory (JSONL flat files plus a disposable \
                  SQLite index), runs one command, and detaches again, flushing any \
                  pending writes."
)]
pub struct Cli {
    /// TOML configuration file (`data_dir` plus an optional `[sync]` table).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory; overrides the one in the configuration file.
    #[arg(long, global = true, env = "CRUMBS_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the entity tables.
    Tables,

    /// Fetch entities from a table as JSON.
    List {
        /// Table name, e.g. `crumbs` or `stashes`.
        table: String,

        /// Maximum number of entities to return.
        #[arg(long)]
        limit: Option<u64>,

        /// Number of entities to skip.
        #[arg(long)]
        offset: Option<u64>,

        /// Filter as `key=value`; values that parse as JSON are used as
        /// JSON. Repeatable.
        #[arg(long = "filter", short = 'f', value_name = "KEY=VALUE")]
        filters: Vec<String>,
    },

    /// Show one entity.
    Get {
        table: String,
        id: String,
    },

    /// Delete one entity and its cascades.
    Delete {
        table: String,
        id: String,
    },

    /// Show the version history of a stash.
    History {
        stash_id: String,
    },

    /// Rebuild the index, flush, and report record counts per flat file.
    Verify,
}
