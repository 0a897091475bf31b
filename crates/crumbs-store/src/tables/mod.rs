//! Entity table accessors.
//!
//! Every entity kind has one accessor implementing [`Table`]. Accessors run
//! each mutation as one SQLite transaction, commit, and only then hand the
//! affected flat-file collections to the [`SyncDispatcher`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::mirror::Collection;
use crate::sync::{Operation, PendingWrite, PersistAction, SyncDispatcher};

pub mod category;
pub mod crumb;
pub mod filter;
pub mod link;
pub mod metadata;
pub mod property;
pub mod stash;
pub mod trail;

pub use category::{Category, CategoryTable};
pub use crumb::{Crumb, CrumbTable};
pub use filter::Filter;
pub use link::{Link, LinkTable, LinkType};
pub use metadata::{BUILTIN_SCHEMAS, Metadata, MetadataTable};
pub use property::{Property, PropertyTable, ValueType};
pub use stash::{Stash, StashHistoryEntry, StashTable, StashType};
pub use trail::{Trail, TrailTable};

// ═══════════════════════════════════════════════════════════════════════
//  Table names
// ═══════════════════════════════════════════════════════════════════════

/// The fixed set of entity kinds exposed through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableName {
    Crumbs,
    Trails,
    Properties,
    Categories,
    Links,
    Metadata,
    Stashes,
}

impl TableName {
    pub const ALL: [TableName; 7] = [
        Self::Crumbs,
        Self::Trails,
        Self::Properties,
        Self::Categories,
        Self::Links,
        Self::Metadata,
        Self::Stashes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crumbs => "crumbs",
            Self::Trails => "trails",
            Self::Properties => "properties",
            Self::Categories => "categories",
            Self::Links => "links",
            Self::Metadata => "metadata",
            Self::Stashes => "stashes",
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableName {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| StoreError::UnknownTable(s.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Entity values
// ═══════════════════════════════════════════════════════════════════════

/// A value of any entity kind, as accepted and returned by [`Table`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Entity {
    Crumb(Crumb),
    Trail(Trail),
    Property(Property),
    Category(Category),
    Link(Link),
    Metadata(Metadata),
    Stash(Stash),
}

impl Entity {
    /// The table this value belongs to.
    pub fn table(&self) -> TableName {
        match self {
            Self::Crumb(_) => TableName::Crumbs,
            Self::Trail(_) => TableName::Trails,
            Self::Property(_) => TableName::Properties,
            Self::Category(_) => TableName::Categories,
            Self::Link(_) => TableName::Links,
            Self::Metadata(_) => TableName::Metadata,
            Self::Stash(_) => TableName::Stashes,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Crumb(v) => &v.id,
            Self::Trail(v) => &v.id,
            Self::Property(v) => &v.id,
            Self::Category(v) => &v.id,
            Self::Link(v) => &v.id,
            Self::Metadata(v) => &v.id,
            Self::Stash(v) => &v.id,
        }
    }
}

macro_rules! entity_conversions {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Entity {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }

            impl TryFrom<Entity> for $ty {
                type Error = StoreError;

                fn try_from(entity: Entity) -> StoreResult<Self> {
                    match entity {
                        Entity::$variant(value) => Ok(value),
                        other => Err(StoreError::InvalidData(format!(
                            "expected {}, got a {} value",
                            stringify!($variant).to_lowercase(),
                            other.table(),
                        ))),
                    }
                }
            }
        )*
    };
}

entity_conversions! {
    Crumb => Crumb,
    Trail => Trail,
    Property => Property,
    Category => Category,
    Link => Link,
    Metadata => Metadata,
    Stash => Stash,
}

// ═══════════════════════════════════════════════════════════════════════
//  Table trait
// ═══════════════════════════════════════════════════════════════════════

/// Uniform Get/Set/Delete/Fetch contract shared by every accessor.
#[async_trait]
pub trait Table: Send + Sync {
    /// Which entity kind this accessor serves.
    fn name(&self) -> TableName;

    /// Load one entity. Empty ids fail with [`StoreError::InvalidId`],
    /// unknown ids with [`StoreError::NotFound`].
    async fn get(&self, id: &str) -> StoreResult<Entity>;

    /// Create (empty `id`) or update-or-insert (non-empty `id`) an entity
    /// and return it as stored, including generated ids and defaults.
    async fn set(&self, id: &str, value: Entity) -> StoreResult<Entity>;

    /// Delete an entity and its cascades.
    async fn delete(&self, id: &str) -> StoreResult<()>;

    /// Query entities. `None` means no filter. The result is never absent.
    async fn fetch(&self, filter: Option<&Filter>) -> StoreResult<Vec<Entity>>;
}

// ═══════════════════════════════════════════════════════════════════════
//  Shared accessor plumbing
// ═══════════════════════════════════════════════════════════════════════

/// What every accessor needs: the index connection and the dispatcher.
#[derive(Clone)]
pub(crate) struct TableContext {
    pub db: Database,
    pub sync: Arc<SyncDispatcher>,
}

impl TableContext {
    pub fn new(db: Database, sync: Arc<SyncDispatcher>) -> Self {
        Self { db, sync }
    }

    /// Hand the collections touched by a committed mutation to the
    /// dispatcher.
    pub async fn persist(
        &self,
        table: TableName,
        operation: Operation,
        collections: &[Collection],
    ) -> StoreResult<()> {
        let actions = collections
            .iter()
            .copied()
            .map(PersistAction::Rewrite)
            .collect();
        self.sync
            .persist(PendingWrite::new(table, operation, actions))
            .await
    }
}

/// Reject empty identifiers.
pub(crate) fn require_id(id: &str) -> StoreResult<()> {
    if id.is_empty() {
        return Err(StoreError::InvalidId);
    }
    Ok(())
}

/// Map a `QueryReturnedNoRows` into `Ok(None)`.
pub(crate) fn optional<T>(result: rusqlite::Result<T>) -> StoreResult<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StoreError::Sqlite(e)),
    }
}

/// Whether a row with `id` exists in `table`. `table` is always a
/// compile-time constant.
pub(crate) fn row_exists(
    conn: &rusqlite::Connection,
    table: &'static str,
    id: &str,
) -> StoreResult<bool> {
    let sql = format!("SELECT 1 FROM {table} WHERE id = ?1");
    Ok(optional(conn.query_row(&sql, [id], |_| Ok(())))?.is_some())
}
