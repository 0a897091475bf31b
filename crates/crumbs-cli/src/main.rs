//! CLI entry point for the crumbs store.
//!
//! Every command that touches data attaches to the data directory, runs,
//! and detaches again so pending writes are flushed before exit.

mod cli;
mod helpers;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use crumbs_store::{Backend, Collection, TableName, jsonl};
use serde_json::Value;
use tracing::{info, warn};

use cli::{Cli, Commands};
use helpers::{build_filter, init_tracing, resolve_config};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("info");

    if let Commands::Tables = cli.command {
        for name in TableName::ALL {
            println!("{name}");
        }
        return Ok(());
    }

    let config = resolve_config(cli.config.as_deref(), cli.data_dir.as_deref())?;
    let verify = matches!(cli.command, Commands::Verify);

    let backend = Backend::new();
    backend
        .attach(&config)
        .await
        .with_context(|| format!("failed to attach to {}", config.data_dir.display()))?;

    let result = run(&backend, cli.command).await;

    let detached = backend.detach().await.context("failed to flush and detach");
    if let (Err(_), Err(e)) = (&result, &detached) {
        warn!(error = %e, "detach also failed");
    }
    result?;
    detached?;

    if verify {
        cmd_verify_report(&config.data_dir)?;
    }
    Ok(())
}

async fn run(backend: &Backend, command: Commands) -> Result<()> {
    match command {
        Commands::Tables | Commands::Verify => Ok(()),
        Commands::List {
            table,
            limit,
            offset,
            filters,
        } => cmd_list(backend, &table, &filters, limit, offset).await,
        Commands::Get { table, id } => cmd_get(backend, &table, &id).await,
        Commands::Delete { table, id } => cmd_delete(backend, &table, &id).await,
        Commands::History { stash_id } => cmd_history(backend, &stash_id).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn cmd_list(
    backend: &Backend,
    table: &str,
    filters: &[String],
    limit: Option<u64>,
    offset: Option<u64>,
) -> Result<()> {
    let filter = build_filter(filters, limit, offset)?;
    let accessor = backend.table_by_name(table).await?;
    let entities = accessor
        .fetch(Some(&filter))
        .await
        .with_context(|| format!("failed to fetch {table}"))?;
    println!("{}", serde_json::to_string_pretty(&entities)?);
    Ok(())
}

async fn cmd_get(backend: &Backend, table: &str, id: &str) -> Result<()> {
    let accessor = backend.table_by_name(table).await?;
    let entity = accessor
        .get(id)
        .await
        .with_context(|| format!("failed to get {table}/{id}"))?;
    println!("{}", serde_json::to_string_pretty(&entity)?);
    Ok(())
}

async fn cmd_delete(backend: &Backend, table: &str, id: &str) -> Result<()> {
    let accessor = backend.table_by_name(table).await?;
    accessor
        .delete(id)
        .await
        .with_context(|| format!("failed to delete {table}/{id}"))?;
    info!(table, id, "deleted");
    Ok(())
}

async fn cmd_history(backend: &Backend, stash_id: &str) -> Result<()> {
    let entries = backend
        .stashes()
        .await?
        .history(stash_id)
        .await
        .with_context(|| format!("failed to read history of {stash_id}"))?;
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

/// Count the records in each flat file after a full attach/detach cycle.
fn cmd_verify_report(data_dir: &Path) -> Result<()> {
    println!("{:<20} {:>8}", "collection", "records");
    for collection in Collection::ALL {
        let path = data_dir.join(collection.file_name());
        let records: Vec<Value> = jsonl::read_all(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        println!("{:<20} {:>8}", collection.as_str(), records.len());
    }
    Ok(())
}
