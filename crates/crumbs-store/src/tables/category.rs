//! Categories: the enumerated values of a categorical property.

use async_trait::async_trait;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::filter::{self, Filter, Page, Query};
use super::property::{self, ValueType};
use super::{Entity, Table, TableContext, TableName, optional, require_id};
use crate::db;
use crate::error::{StoreError, StoreResult};
use crate::mirror::Collection;
use crate::sync::Operation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    /// Owning property; must be categorical.
    pub property_id: String,
    /// Unique within the property.
    pub name: String,
    /// Sort position, lowest first.
    #[serde(default)]
    pub ordinal: i64,
}

impl Category {
    pub fn new(property_id: impl Into<String>, name: impl Into<String>, ordinal: i64) -> Self {
        Self {
            id: String::new(),
            property_id: property_id.into(),
            name: name.into(),
            ordinal,
        }
    }
}

#[derive(Clone)]
pub struct CategoryTable {
    ctx: TableContext,
}

impl CategoryTable {
    pub(crate) fn new(ctx: TableContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Table for CategoryTable {
    fn name(&self) -> TableName {
        TableName::Categories
    }

    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> StoreResult<Entity> {
        require_id(id)?;
        let id = id.to_string();
        self.ctx
            .db
            .execute(move |conn| {
                load(conn, &id)?
                    .map(Entity::Category)
                    .ok_or(StoreError::NotFound {
                        entity: "category",
                        id,
                    })
            })
            .await
    }

    #[instrument(skip(self, value))]
    async fn set(&self, id: &str, value: Entity) -> StoreResult<Entity> {
        let mut category = Category::try_from(value)?;
        if category.name.trim().is_empty() {
            return Err(StoreError::InvalidName(
                "category name must not be empty".into(),
            ));
        }

        let id = id.to_string();
        let category = self
            .ctx
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                category.id = if id.is_empty() { db::new_id() } else { id };
                validate(&tx, &category)?;
                insert(&tx, &category)?;
                tx.commit()?;
                Ok(category)
            })
            .await?;

        debug!(category_id = %category.id, property_id = %category.property_id, "category saved");
        self.ctx
            .persist(TableName::Categories, Operation::Set, &[Collection::Categories])
            .await?;
        Ok(Entity::Category(category))
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> StoreResult<()> {
        require_id(id)?;
        let id = id.to_string();
        self.ctx
            .db
            .execute(move |conn| {
                if conn.execute("DELETE FROM categories WHERE id = ?1", [&id])? == 0 {
                    return Err(StoreError::NotFound {
                        entity: "category",
                        id,
                    });
                }
                debug!(category_id = %id, "category deleted");
                Ok(())
            })
            .await?;

        self.ctx
            .persist(
                TableName::Categories,
                Operation::Delete,
                &[Collection::Categories],
            )
            .await
    }

    #[instrument(skip(self, filter))]
    async fn fetch(&self, filter: Option<&Filter>) -> StoreResult<Vec<Entity>> {
        let mut query = Query::new();
        if let Some(property_id) = filter::string(filter, "property_id")? {
            query.eq("property_id", property_id);
        }
        if let Some(name) = filter::string(filter, "name")? {
            query.eq("name", name);
        }
        let sql = query.build(
            &format!("SELECT {COLUMNS} FROM categories"),
            "ordinal ASC, name ASC",
            Page::from_filter(filter)?,
        );

        self.ctx
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(query.params(), read)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows.into_iter().map(Entity::Category).collect())
            })
            .await
    }
}

/// Property must exist and be categorical; the name must be free within
/// that property.
fn validate(conn: &Connection, category: &Category) -> StoreResult<()> {
    let property = property::load(conn, &category.property_id)?
        .ok_or_else(|| StoreError::PropertyNotFound(category.property_id.clone()))?;
    if property.value_type != ValueType::Categorical {
        return Err(StoreError::InvalidValueType(format!(
            "property {} is {}, categories need a categorical property",
            property.name, property.value_type
        )));
    }

    let taken = optional(conn.query_row(
        "SELECT id FROM categories WHERE property_id = ?1 AND name = ?2 AND id != ?3",
        params![category.property_id, category.name, category.id],
        |row| row.get::<_, String>(0),
    ))?;
    if taken.is_some() {
        return Err(StoreError::DuplicateName {
            entity: "category",
            name: category.name.clone(),
        });
    }
    Ok(())
}

const COLUMNS: &str = "id, property_id, name, ordinal";

fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        property_id: row.get(1)?,
        name: row.get(2)?,
        ordinal: row.get(3)?,
    })
}

fn load(conn: &Connection, id: &str) -> StoreResult<Option<Category>> {
    optional(conn.query_row(
        &format!("SELECT {COLUMNS} FROM categories WHERE id = ?1"),
        [id],
        read,
    ))
}

pub(crate) fn insert(conn: &Connection, category: &Category) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO categories (id, property_id, name, ordinal) \
         VALUES (?1, ?2, ?3, ?4)",
        params![
            category.id,
            category.property_id,
            category.name,
            category.ordinal
        ],
    )?;
    Ok(())
}

pub(crate) fn dump(conn: &Connection) -> StoreResult<Vec<Category>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM categories ORDER BY property_id, ordinal, name"
    ))?;
    let rows = stmt.query_map([], read)?.collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn restore(conn: &Connection, records: &[Category]) -> StoreResult<usize> {
    for category in records {
        insert(conn, category)?;
    }
    Ok(records.len())
}
