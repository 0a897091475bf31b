//! Trail persistence. A trail groups crumbs through `belongs_to` links and
//! may branch from a crumb.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::filter::{self, Filter, Page, Query};
use super::{Entity, Table, TableContext, TableName, optional, require_id};
use crate::db::{self, decode_opt_time, decode_time, encode_time};
use crate::error::{StoreError, StoreResult};
use crate::mirror::Collection;
use crate::sync::Operation;

pub const STATE_ACTIVE: &str = "active";
pub const STATE_COMPLETED: &str = "completed";
pub const STATE_ABANDONED: &str = "abandoned";

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trail {
    pub id: String,
    pub state: String,
    /// Crumb this trail branches from, if any.
    #[serde(default)]
    pub parent_crumb_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Trail {
    /// An active trail with a fresh id.
    pub fn new() -> Self {
        Self {
            id: db::new_id(),
            state: STATE_ACTIVE.to_string(),
            parent_crumb_id: None,
            created_at: db::now(),
            completed_at: None,
        }
    }

    pub fn branching_from(mut self, crumb_id: impl Into<String>) -> Self {
        self.parent_crumb_id = Some(crumb_id.into());
        self
    }

    /// Mark the trail completed. Persist with `TrailTable::set`.
    pub fn complete(&mut self) {
        self.finish(STATE_COMPLETED);
    }

    /// Mark the trail abandoned. Persist with `TrailTable::set`.
    pub fn abandon(&mut self) {
        self.finish(STATE_ABANDONED);
    }

    pub fn is_active(&self) -> bool {
        self.completed_at.is_none()
    }

    fn finish(&mut self, state: &str) {
        self.state = state.to_string();
        self.completed_at = Some(db::now());
    }
}

impl Default for Trail {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  TrailTable
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct TrailTable {
    ctx: TableContext,
}

impl TrailTable {
    pub(crate) fn new(ctx: TableContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Table for TrailTable {
    fn name(&self) -> TableName {
        TableName::Trails
    }

    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> StoreResult<Entity> {
        require_id(id)?;
        let id = id.to_string();
        self.ctx
            .db
            .execute(move |conn| {
                load(conn, &id)?
                    .map(Entity::Trail)
                    .ok_or(StoreError::NotFound { entity: "trail", id })
            })
            .await
    }

    #[instrument(skip(self, value))]
    async fn set(&self, id: &str, value: Entity) -> StoreResult<Entity> {
        let mut trail = Trail::try_from(value)?;
        let id = id.to_string();

        let trail = self
            .ctx
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let existing = if id.is_empty() { None } else { load(&tx, &id)? };
                match existing {
                    Some(previous) => {
                        trail.id = id;
                        trail.created_at = previous.created_at;
                    }
                    None => {
                        trail.id = if id.is_empty() { db::new_id() } else { id };
                        trail.created_at = db::now();
                    }
                }
                if trail.state.is_empty() {
                    trail.state = STATE_ACTIVE.to_string();
                }
                insert(&tx, &trail)?;
                tx.commit()?;
                Ok(trail)
            })
            .await?;

        debug!(trail_id = %trail.id, state = %trail.state, "trail saved");
        self.ctx
            .persist(TableName::Trails, Operation::Set, &[Collection::Trails])
            .await?;
        Ok(Entity::Trail(trail))
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> StoreResult<()> {
        require_id(id)?;
        let id = id.to_string();
        self.ctx
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                if tx.execute("DELETE FROM trails WHERE id = ?1", [&id])? == 0 {
                    return Err(StoreError::NotFound { entity: "trail", id });
                }
                let links = tx.execute(
                    "DELETE FROM links WHERE from_id = ?1 OR to_id = ?1",
                    [&id],
                )?;
                tx.commit()?;
                debug!(trail_id = %id, links, "trail deleted");
                Ok(())
            })
            .await?;

        self.ctx
            .persist(
                TableName::Trails,
                Operation::Delete,
                &[Collection::Trails, Collection::Links],
            )
            .await
    }

    #[instrument(skip(self, filter))]
    async fn fetch(&self, filter: Option<&Filter>) -> StoreResult<Vec<Entity>> {
        let mut query = Query::new();
        if let Some(state) = filter::string(filter, "state")? {
            query.eq("state", state);
        }
        if let Some(states) = filter::strings(filter, "states")? {
            query.one_of("state", states);
        }
        if let Some(parent) = filter::string(filter, "parent_crumb_id")? {
            query.eq("parent_crumb_id", parent);
        }
        let sql = query.build(
            &format!("SELECT {COLUMNS} FROM trails"),
            "created_at DESC, id DESC",
            Page::from_filter(filter)?,
        );

        self.ctx
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(query.params(), TrailRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .map(|r| r.into_trail().map(Entity::Trail))
                    .collect()
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Shared SQL helpers
// ═══════════════════════════════════════════════════════════════════════

const COLUMNS: &str = "id, state, parent_crumb_id, created_at, completed_at";

fn load(conn: &Connection, id: &str) -> StoreResult<Option<Trail>> {
    optional(conn.query_row(
        &format!("SELECT {COLUMNS} FROM trails WHERE id = ?1"),
        [id],
        TrailRow::read,
    ))?
    .map(TrailRow::into_trail)
    .transpose()
}

fn insert(conn: &Connection, trail: &Trail) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO trails (id, state, parent_crumb_id, created_at, completed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            trail.id,
            trail.state,
            trail.parent_crumb_id,
            encode_time(&trail.created_at),
            trail.completed_at.as_ref().map(encode_time)
        ],
    )?;
    Ok(())
}

pub(crate) fn dump(conn: &Connection) -> StoreResult<Vec<Trail>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM trails ORDER BY created_at, id"
    ))?;
    let rows = stmt
        .query_map([], TrailRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(TrailRow::into_trail).collect()
}

pub(crate) fn restore(conn: &Connection, records: &[Trail]) -> StoreResult<usize> {
    for trail in records {
        insert(conn, trail)?;
    }
    Ok(records.len())
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal row mapping
// ═══════════════════════════════════════════════════════════════════════

struct TrailRow {
    id: String,
    state: String,
    parent_crumb_id: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl TrailRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            state: row.get(1)?,
            parent_crumb_id: row.get(2)?,
            created_at: row.get(3)?,
            completed_at: row.get(4)?,
        })
    }

    fn into_trail(self) -> StoreResult<Trail> {
        Ok(Trail {
            id: self.id,
            state: self.state,
            parent_crumb_id: self.parent_crumb_id,
            created_at: decode_time(&self.created_at)?,
            completed_at: decode_opt_time(self.completed_at)?,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────
