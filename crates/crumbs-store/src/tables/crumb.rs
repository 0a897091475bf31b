//! Crumb persistence: work items and their dynamic property values.
//!
//! A crumb's properties live in the `crumb_properties` junction, one row
//! per (crumb, property). Creating a crumb writes a row for every defined
//! property, using the caller's value when supplied and the type default
//! otherwise, so the returned crumb always carries the full map.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use super::filter::{self, Filter, Page, Query};
use super::property::{self, Property, ValueType};
use super::{Entity, Table, TableContext, TableName, optional, require_id};
use crate::db::{self, decode_time, encode_time};
use crate::error::{StoreError, StoreResult};
use crate::mirror::Collection;
use crate::sync::Operation;

/// State given to crumbs created without one.
pub const DEFAULT_STATE: &str = "draft";

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// A work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crumb {
    /// Unique identifier (UUID v7).
    pub id: String,
    pub name: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Property id → value.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl Crumb {
    /// An unsaved crumb; id and timestamps are assigned on create.
    pub fn new(name: impl Into<String>) -> Self {
        let now = db::now();
        Self {
            id: String::new(),
            name: name.into(),
            state: String::new(),
            created_at: now,
            updated_at: now,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = state.into();
        self
    }

    pub fn with_property(mut self, property_id: impl Into<String>, value: Value) -> Self {
        self.properties.insert(property_id.into(), value);
        self
    }
}

/// `crumbs.jsonl` line. Property values live in their own file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CrumbRecord {
    pub id: String,
    pub name: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `crumb_properties.jsonl` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CrumbValue {
    pub crumb_id: String,
    pub property_id: String,
    pub value_type: ValueType,
    pub value: Value,
}

// ═══════════════════════════════════════════════════════════════════════
//  CrumbTable
// ═══════════════════════════════════════════════════════════════════════

/// Accessor for crumbs.
#[derive(Clone)]
pub struct CrumbTable {
    ctx: TableContext,
}

impl CrumbTable {
    pub(crate) fn new(ctx: TableContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Table for CrumbTable {
    fn name(&self) -> TableName {
        TableName::Crumbs
    }

    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> StoreResult<Entity> {
        require_id(id)?;
        let id = id.to_string();
        self.ctx
            .db
            .execute(move |conn| {
                load(conn, &id)?
                    .map(Entity::Crumb)
                    .ok_or(StoreError::NotFound { entity: "crumb", id })
            })
            .await
    }

    #[instrument(skip(self, value))]
    async fn set(&self, id: &str, value: Entity) -> StoreResult<Entity> {
        let crumb = Crumb::try_from(value)?;
        if crumb.name.trim().is_empty() {
            return Err(StoreError::InvalidName("crumb name must not be empty".into()));
        }

        let id = id.to_string();
        let (crumb, created) = self
            .ctx
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let result = save(&tx, &id, crumb)?;
                tx.commit()?;
                Ok(result)
            })
            .await?;

        debug!(crumb_id = %crumb.id, created, properties = crumb.properties.len(), "crumb saved");
        self.ctx
            .persist(
                TableName::Crumbs,
                Operation::Set,
                &[Collection::Crumbs, Collection::CrumbProperties],
            )
            .await?;
        Ok(Entity::Crumb(crumb))
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> StoreResult<()> {
        require_id(id)?;
        let id = id.to_string();
        self.ctx
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let deleted = tx.execute("DELETE FROM crumbs WHERE id = ?1", [&id])?;
                if deleted == 0 {
                    return Err(StoreError::NotFound { entity: "crumb", id });
                }
                let values = tx.execute("DELETE FROM crumb_properties WHERE crumb_id = ?1", [&id])?;
                let metadata = tx.execute("DELETE FROM metadata WHERE crumb_id = ?1", [&id])?;
                let links = tx.execute(
                    "DELETE FROM links WHERE from_id = ?1 OR to_id = ?1",
                    [&id],
                )?;
                tx.commit()?;
                debug!(crumb_id = %id, values, metadata, links, "crumb deleted");
                Ok(())
            })
            .await?;

        self.ctx
            .persist(
                TableName::Crumbs,
                Operation::Delete,
                &[
                    Collection::Crumbs,
                    Collection::CrumbProperties,
                    Collection::Metadata,
                    Collection::Links,
                ],
            )
            .await
    }

    #[instrument(skip(self, filter))]
    async fn fetch(&self, filter: Option<&Filter>) -> StoreResult<Vec<Entity>> {
        let mut query = Query::new();
        if let Some(state) = filter::string(filter, "state")? {
            query.eq("c.state", state);
        }
        if let Some(states) = filter::strings(filter, "states")? {
            query.one_of("c.state", states);
        }
        if let Some(trail_id) = filter::string(filter, "trail_id")? {
            query.raw(
                "c.id IN (SELECT from_id FROM links WHERE link_type = 'belongs_to' AND to_id = {})",
                trail_id,
            );
        }
        if let Some(parent_id) = filter::string(filter, "parent_id")? {
            query.raw(
                "c.id IN (SELECT from_id FROM links WHERE link_type = 'child_of' AND to_id = {})",
                parent_id,
            );
        }
        let sql = query.build(
            "SELECT c.id, c.name, c.state, c.created_at, c.updated_at FROM crumbs c",
            "c.created_at DESC, c.id DESC",
            Page::from_filter(filter)?,
        );

        self.ctx
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(query.params(), CrumbRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .map(|row| {
                        let mut crumb = row.into_crumb()?;
                        crumb.properties = load_values(conn, &crumb.id)?;
                        Ok(Entity::Crumb(crumb))
                    })
                    .collect()
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Save path
// ═══════════════════════════════════════════════════════════════════════

/// Insert or update `crumb` inside the caller's transaction and return the
/// stored crumb with its full property map.
fn save(conn: &Connection, id: &str, mut crumb: Crumb) -> StoreResult<(Crumb, bool)> {
    let defined: HashMap<String, Property> = property::load_all(conn)?
        .into_iter()
        .map(|p| (p.id.clone(), p))
        .collect();

    for (property_id, value) in &crumb.properties {
        if let Some(p) = defined.get(property_id)
            && !p.value_type.accepts(value)
        {
            return Err(StoreError::InvalidValueType(format!(
                "property {} expects {}, got {value}",
                p.name, p.value_type
            )));
        }
    }

    let existing = if id.is_empty() { None } else { load_record(conn, id)? };
    let now = db::now();
    let created = existing.is_none();

    match existing {
        Some(previous) => {
            crumb.id = id.to_string();
            crumb.created_at = previous.created_at;
            crumb.updated_at = now;
            if crumb.state.is_empty() {
                crumb.state = previous.state;
            }
            conn.execute(
                "UPDATE crumbs SET name = ?2, state = ?3, updated_at = ?4 WHERE id = ?1",
                params![crumb.id, crumb.name, crumb.state, encode_time(&now)],
            )?;
        }
        None => {
            crumb.id = if id.is_empty() { db::new_id() } else { id.to_string() };
            if crumb.state.is_empty() {
                crumb.state = DEFAULT_STATE.to_string();
            }
            crumb.created_at = now;
            crumb.updated_at = now;
            insert(conn, &record_of(&crumb))?;

            for p in defined.values() {
                crumb
                    .properties
                    .entry(p.id.clone())
                    .or_insert_with(|| p.value_type.default_value());
            }
        }
    }

    for (property_id, value) in &crumb.properties {
        let value_type = defined
            .get(property_id)
            .map(|p| p.value_type)
            .unwrap_or_else(|| ValueType::infer(value));
        upsert_value(
            conn,
            &CrumbValue {
                crumb_id: crumb.id.clone(),
                property_id: property_id.clone(),
                value_type,
                value: value.clone(),
            },
        )?;
    }

    crumb.properties = load_values(conn, &crumb.id)?;
    Ok((crumb, created))
}

fn record_of(crumb: &Crumb) -> CrumbRecord {
    CrumbRecord {
        id: crumb.id.clone(),
        name: crumb.name.clone(),
        state: crumb.state.clone(),
        created_at: crumb.created_at,
        updated_at: crumb.updated_at,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Shared SQL helpers
// ═══════════════════════════════════════════════════════════════════════

pub(crate) fn load(conn: &Connection, id: &str) -> StoreResult<Option<Crumb>> {
    let Some(record) = load_record(conn, id)? else {
        return Ok(None);
    };
    Ok(Some(Crumb {
        properties: load_values(conn, &record.id)?,
        id: record.id,
        name: record.name,
        state: record.state,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }))
}

fn load_record(conn: &Connection, id: &str) -> StoreResult<Option<CrumbRecord>> {
    optional(conn.query_row(
        "SELECT id, name, state, created_at, updated_at FROM crumbs WHERE id = ?1",
        [id],
        CrumbRow::read,
    ))?
    .map(CrumbRow::into_record)
    .transpose()
}

fn load_values(conn: &Connection, crumb_id: &str) -> StoreResult<BTreeMap<String, Value>> {
    let mut stmt =
        conn.prepare("SELECT property_id, value FROM crumb_properties WHERE crumb_id = ?1")?;
    let rows = stmt
        .query_map([crumb_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(property_id, raw)| Ok((property_id, serde_json::from_str(&raw)?)))
        .collect()
}

fn insert(conn: &Connection, record: &CrumbRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO crumbs (id, name, state, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.id,
            record.name,
            record.state,
            encode_time(&record.created_at),
            encode_time(&record.updated_at)
        ],
    )?;
    Ok(())
}

fn upsert_value(conn: &Connection, value: &CrumbValue) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO crumb_properties (crumb_id, property_id, value_type, value) \
         VALUES (?1, ?2, ?3, ?4)",
        params![
            value.crumb_id,
            value.property_id,
            value.value_type.as_str(),
            serde_json::to_string(&value.value)?
        ],
    )?;
    Ok(())
}

pub(crate) fn dump(conn: &Connection) -> StoreResult<Vec<CrumbRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, state, created_at, updated_at FROM crumbs ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map([], CrumbRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(CrumbRow::into_record).collect()
}

pub(crate) fn restore(conn: &Connection, records: &[CrumbRecord]) -> StoreResult<usize> {
    for record in records {
        insert(conn, record)?;
    }
    Ok(records.len())
}

pub(crate) fn dump_values(conn: &Connection) -> StoreResult<Vec<CrumbValue>> {
    let mut stmt = conn.prepare(
        "SELECT crumb_id, property_id, value_type, value FROM crumb_properties \
         ORDER BY crumb_id, property_id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(crumb_id, property_id, value_type, raw)| {
            Ok(CrumbValue {
                crumb_id,
                property_id,
                value_type: value_type.parse()?,
                value: serde_json::from_str(&raw)?,
            })
        })
        .collect()
}

pub(crate) fn restore_values(conn: &Connection, records: &[CrumbValue]) -> StoreResult<usize> {
    for value in records {
        upsert_value(conn, value)?;
    }
    Ok(records.len())
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal row mapping
// ═══════════════════════════════════════════════════════════════════════

struct CrumbRow {
    id: String,
    name: String,
    state: String,
    created_at: String,
    updated_at: String,
}

impl CrumbRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            state: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn into_record(self) -> StoreResult<CrumbRecord> {
        Ok(CrumbRecord {
            id: self.id,
            name: self.name,
            state: self.state,
            created_at: decode_time(&self.created_at)?,
            updated_at: decode_time(&self.updated_at)?,
        })
    }

    fn into_crumb(self) -> StoreResult<Crumb> {
        let record = self.into_record()?;
        Ok(Crumb {
            id: record.id,
            name: record.name,
            state: record.state,
            created_at: record.created_at,
            updated_at: record.updated_at,
            properties: BTreeMap::new(),
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[path = "crumb_tests.rs"]
mod tests;
