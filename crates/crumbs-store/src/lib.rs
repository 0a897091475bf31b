//! # crumbs-store
//!
//! Storage engine for crumbs (work items), trails, dynamic properties,
//! links, metadata and stashes.
//!
//! Every entity lives twice: in a SQLite index that answers queries and is
//! rebuilt from scratch on every attach, and in one JSONL flat file per
//! collection that survives across sessions. A sync dispatcher decides
//! when committed index mutations reach the flat files.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Backend (attach / detach / table registry)  │
//! ├──────────────────────────────────────────────┤
//! │  Table accessors: crumbs, trails, properties │
//! │  categories, links, metadata, stashes        │
//! ├──────────────────────┬───────────────────────┤
//! │  Database            │  SyncDispatcher       │
//! │  (rusqlite index,    │  immediate / on_close │
//! │   rebuilt on attach) │  / batch + timer      │
//! │                      ├───────────────────────┤
//! │                      │  Mirror → *.jsonl     │
//! └──────────────────────┴───────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use crumbs_store::{Backend, Config, Crumb, SyncConfig, Table};
//!
//! let backend = Backend::new();
//! backend
//!     .attach(&Config::new("data").with_sync(SyncConfig::on_close()))
//!     .await?;
//!
//! let crumbs = backend.crumbs().await?;
//! let stored = crumbs.set("", Crumb::new("write the docs").into()).await?;
//!
//! backend.detach().await?;
//! ```

pub mod backend;
pub mod config;
pub mod db;
pub mod error;
pub mod jsonl;
pub mod mirror;
mod schema;
pub mod seed;
pub mod sync;
pub mod tables;

// ── re-exports ───────────────────────────────────────────────────────

pub use backend::{Backend, INDEX_FILE, index_path};
pub use config::{Config, SyncConfig, SyncStrategy};
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use mirror::Collection;
pub use seed::builtin_names;
pub use sync::{Operation, SyncDispatcher};
pub use tables::{
    BUILTIN_SCHEMAS, Category, CategoryTable, Crumb, CrumbTable, Entity, Filter, Link, LinkTable,
    LinkType, Metadata, MetadataTable, Property, PropertyTable, Stash, StashHistoryEntry,
    StashTable, StashType, Table, TableName, Trail, TrailTable, ValueType,
};
