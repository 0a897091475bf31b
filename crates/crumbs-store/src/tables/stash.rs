//! Stashes: named, versioned values with an append-only history.
//!
//! Every Set bumps the version and writes exactly one
//! [`StashHistoryEntry`]. The history flat file is appended to, not
//! rewritten, except when deleting a stash removes its entries.
//!
//! The lock and counter helpers on [`Stash`] only change the value in
//! memory; callers persist the result with [`StashTable::set`], which
//! checks the version they started from.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use super::filter::{self, Filter, Page, Query};
use super::{Entity, Table, TableContext, TableName, optional, require_id};
use crate::db::{self, decode_time, encode_time};
use crate::error::{StoreError, StoreResult};
use crate::mirror::Collection;
use crate::sync::{Operation, PendingWrite, PersistAction};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StashType {
    Resource,
    Artifact,
    Context,
    Counter,
    Lock,
}

impl StashType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resource => "resource",
            Self::Artifact => "artifact",
            Self::Context => "context",
            Self::Counter => "counter",
            Self::Lock => "lock",
        }
    }
}

impl fmt::Display for StashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StashType {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        match s {
            "resource" => Ok(Self::Resource),
            "artifact" => Ok(Self::Artifact),
            "context" => Ok(Self::Context),
            "counter" => Ok(Self::Counter),
            "lock" => Ok(Self::Lock),
            other => Err(StoreError::InvalidStashType(other.to_string())),
        }
    }
}

/// A named value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stash {
    pub id: String,
    /// Unique across stashes.
    pub name: String,
    pub stash_type: StashType,
    pub value: Value,
    /// The version the caller last saw; 0 skips the conflict check.
    #[serde(default)]
    pub version: i64,
    /// Operation recorded by the most recent save.
    #[serde(default)]
    pub last_operation: String,
    /// Tag for the history entry of the next save only. `None` records
    /// `create` on insert and `set` on update.
    #[serde(skip)]
    pub operation: Option<String>,
    #[serde(default)]
    pub changed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Stash {
    pub fn new(name: impl Into<String>, stash_type: StashType, value: Value) -> Self {
        let now = db::now();
        Self {
            id: String::new(),
            name: name.into(),
            stash_type,
            value,
            version: 0,
            last_operation: String::new(),
            operation: None,
            changed_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// An unheld lock.
    pub fn lock(name: impl Into<String>) -> Self {
        Self::new(name, StashType::Lock, json!({}))
    }

    /// A counter starting at zero.
    pub fn counter(name: impl Into<String>) -> Self {
        Self::new(name, StashType::Counter, json!(0))
    }

    pub fn changed_by(mut self, actor: impl Into<String>) -> Self {
        self.changed_by = Some(actor.into());
        self
    }

    /// Record the next save under `operation` instead of `create`/`set`.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Current holder of a lock stash. A lock is held while its value has a
    /// non-empty string `holder`.
    pub fn lock_holder(&self) -> Option<&str> {
        if self.stash_type != StashType::Lock {
            return None;
        }
        self.value
            .get("holder")
            .and_then(Value::as_str)
            .filter(|h| !h.is_empty())
    }

    /// Take the lock for `holder`. Re-acquiring by the current holder
    /// refreshes the acquisition time.
    pub fn acquire(&mut self, holder: &str) -> StoreResult<()> {
        self.expect_type(StashType::Lock)?;
        if let Some(current) = self.lock_holder()
            && current != holder
        {
            return Err(StoreError::LockHeld {
                name: self.name.clone(),
                holder: current.to_string(),
            });
        }
        self.value = json!({
            "holder": holder,
            "acquired_at": db::encode_time(&db::now()),
        });
        self.operation = Some("acquire".into());
        self.changed_by = Some(holder.to_string());
        Ok(())
    }

    /// Give the lock up. Only the current holder may release it.
    pub fn release(&mut self, holder: &str) -> StoreResult<()> {
        self.expect_type(StashType::Lock)?;
        if self.lock_holder() != Some(holder) {
            return Err(StoreError::NotLockHolder {
                name: self.name.clone(),
                caller: holder.to_string(),
            });
        }
        self.value = json!({});
        self.operation = Some("release".into());
        self.changed_by = Some(holder.to_string());
        Ok(())
    }

    /// Add `delta` to a counter and return the new count. A null value
    /// counts as zero.
    pub fn increment(&mut self, delta: i64) -> StoreResult<i64> {
        self.expect_type(StashType::Counter)?;
        let current = match &self.value {
            Value::Null => 0,
            other => other.as_i64().ok_or_else(|| {
                StoreError::InvalidData(format!("counter {} holds {other}", self.name))
            })?,
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| StoreError::InvalidData(format!("counter {} overflowed", self.name)))?;
        self.value = json!(next);
        self.operation = Some("increment".into());
        Ok(next)
    }

    fn expect_type(&self, expected: StashType) -> StoreResult<()> {
        if self.stash_type != expected {
            return Err(StoreError::InvalidStashType(format!(
                "{} is a {} stash, not a {expected}",
                self.name, self.stash_type
            )));
        }
        Ok(())
    }
}

/// One recorded Set of a stash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StashHistoryEntry {
    pub id: String,
    pub stash_id: String,
    pub version: i64,
    pub value: Value,
    pub operation: String,
    #[serde(default)]
    pub changed_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════
//  StashTable
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct StashTable {
    ctx: TableContext,
}

impl StashTable {
    pub(crate) fn new(ctx: TableContext) -> Self {
        Self { ctx }
    }

    /// History of one stash, oldest version first.
    #[instrument(skip(self))]
    pub async fn history(&self, stash_id: &str) -> StoreResult<Vec<StashHistoryEntry>> {
        require_id(stash_id)?;
        let stash_id = stash_id.to_string();
        self.ctx
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {HISTORY_COLUMNS} FROM stash_history WHERE stash_id = ?1 \
                     ORDER BY version, created_at"
                ))?;
                let rows = stmt
                    .query_map([&stash_id], HistoryRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(HistoryRow::into_entry).collect()
            })
            .await
    }
}

#[async_trait]
impl Table for StashTable {
    fn name(&self) -> TableName {
        TableName::Stashes
    }

    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> StoreResult<Entity> {
        require_id(id)?;
        let id = id.to_string();
        self.ctx
            .db
            .execute(move |conn| {
                load(conn, &id)?
                    .map(Entity::Stash)
                    .ok_or(StoreError::NotFound { entity: "stash", id })
            })
            .await
    }

    #[instrument(skip(self, value))]
    async fn set(&self, id: &str, value: Entity) -> StoreResult<Entity> {
        let mut stash = Stash::try_from(value)?;
        if stash.name.trim().is_empty() {
            return Err(StoreError::InvalidName("stash name must not be empty".into()));
        }

        let id = id.to_string();
        let (stash, entry) = self
            .ctx
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                ensure_unique_name(&tx, &stash.name, &id)?;

                let now = db::now();
                let existing = if id.is_empty() { None } else { load(&tx, &id)? };
                let default_operation = match existing {
                    Some(previous) => {
                        if stash.version != 0 && stash.version != previous.version {
                            return Err(StoreError::VersionConflict {
                                id,
                                expected: stash.version,
                                actual: previous.version,
                            });
                        }
                        stash.id = id;
                        stash.version = previous.version + 1;
                        stash.created_at = previous.created_at;
                        "set"
                    }
                    None => {
                        stash.id = if id.is_empty() { db::new_id() } else { id };
                        stash.version = 1;
                        stash.created_at = now;
                        "create"
                    }
                };
                stash.updated_at = now;
                stash.last_operation = stash
                    .operation
                    .take()
                    .filter(|op| !op.is_empty())
                    .unwrap_or_else(|| default_operation.to_string());
                insert(&tx, &stash)?;

                let entry = StashHistoryEntry {
                    id: db::new_id(),
                    stash_id: stash.id.clone(),
                    version: stash.version,
                    value: stash.value.clone(),
                    operation: stash.last_operation.clone(),
                    changed_by: stash.changed_by.clone(),
                    created_at: now,
                };
                insert_history(&tx, &entry)?;
                tx.commit()?;
                Ok((stash, entry))
            })
            .await?;

        debug!(
            stash_id = %stash.id,
            name = %stash.name,
            version = stash.version,
            operation = %stash.last_operation,
            "stash saved"
        );
        self.ctx
            .sync
            .persist(PendingWrite::new(
                TableName::Stashes,
                Operation::Set,
                vec![
                    PersistAction::Rewrite(Collection::Stashes),
                    PersistAction::AppendHistory(vec![entry]),
                ],
            ))
            .await?;
        Ok(Entity::Stash(stash))
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> StoreResult<()> {
        require_id(id)?;
        let id = id.to_string();
        self.ctx
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let stash = load(&tx, &id)?.ok_or_else(|| StoreError::NotFound {
                    entity: "stash",
                    id: id.clone(),
                })?;
                if let Some(holder) = stash.lock_holder() {
                    return Err(StoreError::LockHeld {
                        name: stash.name.clone(),
                        holder: holder.to_string(),
                    });
                }

                tx.execute("DELETE FROM stashes WHERE id = ?1", [&id])?;
                let history = tx.execute("DELETE FROM stash_history WHERE stash_id = ?1", [&id])?;
                let links = tx.execute(
                    "DELETE FROM links WHERE link_type = 'scoped_to' AND to_id = ?1",
                    [&id],
                )?;
                tx.commit()?;
                info!(stash_id = %id, name = %stash.name, history, links, "stash deleted");
                Ok(())
            })
            .await?;

        self.ctx
            .persist(
                TableName::Stashes,
                Operation::Delete,
                &[
                    Collection::Stashes,
                    Collection::StashHistory,
                    Collection::Links,
                ],
            )
            .await
    }

    #[instrument(skip(self, filter))]
    async fn fetch(&self, filter: Option<&Filter>) -> StoreResult<Vec<Entity>> {
        let mut query = Query::new();
        if let Some(raw) = filter::string(filter, "stash_type")? {
            let stash_type: StashType = raw.parse()?;
            query.eq("stash_type", stash_type.as_str());
        }
        if let Some(name) = filter::string(filter, "name")? {
            query.eq("name", name);
        }
        let sql = query.build(
            &format!("SELECT {COLUMNS} FROM stashes"),
            "created_at ASC, id ASC",
            Page::from_filter(filter)?,
        );

        self.ctx
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(query.params(), StashRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .map(|r| r.into_stash().map(Entity::Stash))
                    .collect()
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Shared SQL helpers
// ═══════════════════════════════════════════════════════════════════════

const COLUMNS: &str =
    "id, name, stash_type, value, version, last_operation, changed_by, created_at, updated_at";
const HISTORY_COLUMNS: &str = "id, stash_id, version, value, operation, changed_by, created_at";

fn load(conn: &Connection, id: &str) -> StoreResult<Option<Stash>> {
    optional(conn.query_row(
        &format!("SELECT {COLUMNS} FROM stashes WHERE id = ?1"),
        [id],
        StashRow::read,
    ))?
    .map(StashRow::into_stash)
    .transpose()
}

fn ensure_unique_name(conn: &Connection, name: &str, own_id: &str) -> StoreResult<()> {
    let taken = optional(conn.query_row(
        "SELECT id FROM stashes WHERE name = ?1 AND id != ?2",
        params![name, own_id],
        |row| row.get::<_, String>(0),
    ))?;
    if taken.is_some() {
        return Err(StoreError::DuplicateName {
            entity: "stash",
            name: name.to_string(),
        });
    }
    Ok(())
}

fn insert(conn: &Connection, stash: &Stash) -> StoreResult<()> {
    conn.execute(
        &format!("INSERT OR REPLACE INTO stashes ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
        params![
            stash.id,
            stash.name,
            stash.stash_type.as_str(),
            serde_json::to_string(&stash.value)?,
            stash.version,
            stash.last_operation,
            stash.changed_by,
            encode_time(&stash.created_at),
            encode_time(&stash.updated_at)
        ],
    )?;
    Ok(())
}

fn insert_history(conn: &Connection, entry: &StashHistoryEntry) -> StoreResult<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO stash_history ({HISTORY_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
        ),
        params![
            entry.id,
            entry.stash_id,
            entry.version,
            serde_json::to_string(&entry.value)?,
            entry.operation,
            entry.changed_by,
            encode_time(&entry.created_at)
        ],
    )?;
    Ok(())
}

pub(crate) fn dump(conn: &Connection) -> StoreResult<Vec<Stash>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM stashes ORDER BY created_at, id"
    ))?;
    let rows = stmt
        .query_map([], StashRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(StashRow::into_stash).collect()
}

pub(crate) fn restore(conn: &Connection, records: &[Stash]) -> StoreResult<usize> {
    for stash in records {
        insert(conn, stash)?;
    }
    Ok(records.len())
}

pub(crate) fn dump_history(conn: &Connection) -> StoreResult<Vec<StashHistoryEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {HISTORY_COLUMNS} FROM stash_history ORDER BY created_at, id"
    ))?;
    let rows = stmt
        .query_map([], HistoryRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(HistoryRow::into_entry).collect()
}

pub(crate) fn restore_history(
    conn: &Connection,
    records: &[StashHistoryEntry],
) -> StoreResult<usize> {
    for entry in records {
        insert_history(conn, entry)?;
    }
    Ok(records.len())
}

/// Ids of every history entry in the index.
pub(crate) fn history_ids(conn: &Connection) -> StoreResult<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT id FROM stash_history")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal row mapping
// ═══════════════════════════════════════════════════════════════════════

struct StashRow {
    id: String,
    name: String,
    stash_type: String,
    value: String,
    version: i64,
    last_operation: String,
    changed_by: Option<String>,
    created_at: String,
    updated_at: String,
}

impl StashRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            stash_type: row.get(2)?,
            value: row.get(3)?,
            version: row.get(4)?,
            last_operation: row.get(5)?,
            changed_by: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_stash(self) -> StoreResult<Stash> {
        Ok(Stash {
            id: self.id,
            name: self.name,
            stash_type: self.stash_type.parse()?,
            value: serde_json::from_str(&self.value)?,
            version: self.version,
            last_operation: self.last_operation,
            operation: None,
            changed_by: self.changed_by,
            created_at: decode_time(&self.created_at)?,
            updated_at: decode_time(&self.updated_at)?,
        })
    }
}

struct HistoryRow {
    id: String,
    stash_id: String,
    version: i64,
    value: String,
    operation: String,
    changed_by: Option<String>,
    created_at: String,
}

impl HistoryRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            stash_id: row.get(1)?,
            version: row.get(2)?,
            value: row.get(3)?,
            operation: row.get(4)?,
            changed_by: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_entry(self) -> StoreResult<StashHistoryEntry> {
        Ok(StashHistoryEntry {
            id: self.id,
            stash_id: self.stash_id,
            version: self.version,
            value: serde_json::from_str(&self.value)?,
            operation: self.operation,
            changed_by: self.changed_by,
            created_at: decode_time(&self.created_at)?,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[path = "stash_tests.rs"]
mod tests;
