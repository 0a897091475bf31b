//! Metadata: schema-tagged notes attached to a crumb, optionally scoped to
//! one of its properties.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::filter::{self, Filter, Page, Query};
use super::{Entity, Table, TableContext, TableName, optional, require_id, row_exists};
use crate::db::{self, decode_time, encode_time};
use crate::error::{StoreError, StoreResult};
use crate::mirror::Collection;
use crate::sync::Operation;

/// Schemas a metadata entry may name.
pub const BUILTIN_SCHEMAS: &[&str] = &["comments", "attachments"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: String,
    pub schema_name: String,
    pub crumb_id: String,
    #[serde(default)]
    pub property_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Metadata {
    pub fn new(
        schema_name: impl Into<String>,
        crumb_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            schema_name: schema_name.into(),
            crumb_id: crumb_id.into(),
            property_id: None,
            content: content.into(),
            created_at: db::now(),
        }
    }

    pub fn for_property(mut self, property_id: impl Into<String>) -> Self {
        self.property_id = Some(property_id.into());
        self
    }
}

#[derive(Clone)]
pub struct MetadataTable {
    ctx: TableContext,
}

impl MetadataTable {
    pub(crate) fn new(ctx: TableContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Table for MetadataTable {
    fn name(&self) -> TableName {
        TableName::Metadata
    }

    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> StoreResult<Entity> {
        require_id(id)?;
        let id = id.to_string();
        self.ctx
            .db
            .execute(move |conn| {
                load(conn, &id)?
                    .map(Entity::Metadata)
                    .ok_or(StoreError::NotFound {
                        entity: "metadata",
                        id,
                    })
            })
            .await
    }

    #[instrument(skip(self, value))]
    async fn set(&self, id: &str, value: Entity) -> StoreResult<Entity> {
        let mut entry = Metadata::try_from(value)?;
        if !BUILTIN_SCHEMAS.contains(&entry.schema_name.as_str()) {
            return Err(StoreError::SchemaNotFound(entry.schema_name));
        }
        if entry.content.trim().is_empty() {
            return Err(StoreError::InvalidContent);
        }
        if entry.property_id.as_deref() == Some("") {
            entry.property_id = None;
        }

        let id = id.to_string();
        let entry = self
            .ctx
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                if !row_exists(&tx, "crumbs", &entry.crumb_id)? {
                    return Err(StoreError::NotFound {
                        entity: "crumb",
                        id: entry.crumb_id,
                    });
                }
                if let Some(property_id) = &entry.property_id
                    && !row_exists(&tx, "properties", property_id)?
                {
                    return Err(StoreError::PropertyNotFound(property_id.clone()));
                }

                let existing = if id.is_empty() { None } else { load(&tx, &id)? };
                match existing {
                    Some(previous) => {
                        entry.id = id;
                        entry.created_at = previous.created_at;
                    }
                    None => {
                        entry.id = if id.is_empty() { db::new_id() } else { id };
                        entry.created_at = db::now();
                    }
                }
                insert(&tx, &entry)?;
                tx.commit()?;
                Ok(entry)
            })
            .await?;

        debug!(metadata_id = %entry.id, schema = %entry.schema_name, crumb_id = %entry.crumb_id, "metadata saved");
        self.ctx
            .persist(TableName::Metadata, Operation::Set, &[Collection::Metadata])
            .await?;
        Ok(Entity::Metadata(entry))
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> StoreResult<()> {
        require_id(id)?;
        let id = id.to_string();
        self.ctx
            .db
            .execute(move |conn| {
                if conn.execute("DELETE FROM metadata WHERE id = ?1", [&id])? == 0 {
                    return Err(StoreError::NotFound {
                        entity: "metadata",
                        id,
                    });
                }
                Ok(())
            })
            .await?;

        self.ctx
            .persist(
                TableName::Metadata,
                Operation::Delete,
                &[Collection::Metadata],
            )
            .await
    }

    #[instrument(skip(self, filter))]
    async fn fetch(&self, filter: Option<&Filter>) -> StoreResult<Vec<Entity>> {
        let mut query = Query::new();
        if let Some(schema) = filter::string(filter, "schema_name")? {
            query.eq("schema_name", schema);
        }
        if let Some(crumb_id) = filter::string(filter, "crumb_id")? {
            query.eq("crumb_id", crumb_id);
        }
        if let Some(property_id) = filter::string(filter, "property_id")? {
            query.eq("property_id", property_id);
        }
        if let Some(needle) = filter::string(filter, "content")? {
            query.raw("instr(fold_case(content), fold_case({})) > 0", needle);
        }
        let sql = query.build(
            &format!("SELECT {COLUMNS} FROM metadata"),
            "created_at ASC, id ASC",
            Page::from_filter(filter)?,
        );

        self.ctx
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(query.params(), MetadataRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .map(|r| r.into_metadata().map(Entity::Metadata))
                    .collect()
            })
            .await
    }
}

const COLUMNS: &str = "id, schema_name, crumb_id, property_id, content, created_at";

fn load(conn: &Connection, id: &str) -> StoreResult<Option<Metadata>> {
    optional(conn.query_row(
        &format!("SELECT {COLUMNS} FROM metadata WHERE id = ?1"),
        [id],
        MetadataRow::read,
    ))?
    .map(MetadataRow::into_metadata)
    .transpose()
}

fn insert(conn: &Connection, entry: &Metadata) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (id, schema_name, crumb_id, property_id, content, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.id,
            entry.schema_name,
            entry.crumb_id,
            entry.property_id,
            entry.content,
            encode_time(&entry.created_at)
        ],
    )?;
    Ok(())
}

pub(crate) fn dump(conn: &Connection) -> StoreResult<Vec<Metadata>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM metadata ORDER BY created_at, id"
    ))?;
    let rows = stmt
        .query_map([], MetadataRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(MetadataRow::into_metadata).collect()
}

pub(crate) fn restore(conn: &Connection, records: &[Metadata]) -> StoreResult<usize> {
    for entry in records {
        insert(conn, entry)?;
    }
    Ok(records.len())
}

struct MetadataRow {
    id: String,
    schema_name: String,
    crumb_id: String,
    property_id: Option<String>,
    content: String,
    created_at: String,
}

impl MetadataRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            schema_name: row.get(1)?,
            crumb_id: row.get(2)?,
            property_id: row.get(3)?,
            content: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_metadata(self) -> StoreResult<Metadata> {
        Ok(Metadata {
            id: self.id,
            schema_name: self.schema_name,
            crumb_id: self.crumb_id,
            property_id: self.property_id,
            content: self.content,
            created_at: decode_time(&self.created_at)?,
        })
    }
}
