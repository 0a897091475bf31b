//! Property definitions: the dynamic attribute schema attached to crumbs.
//!
//! Defining a new property backfills a default value row in
//! `crumb_properties` for every existing crumb. Updating a property never
//! touches crumb values.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::filter::{self, Filter, Page, Query};
use super::{Entity, Table, TableContext, TableName, optional, require_id};
use crate::db::{self, decode_time, encode_time};
use crate::error::{StoreError, StoreResult};
use crate::mirror::Collection;
use crate::sync::Operation;

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// The type of value a property holds on each crumb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Text,
    Integer,
    Boolean,
    Timestamp,
    List,
    Categorical,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::List => "list",
            Self::Categorical => "categorical",
        }
    }

    /// The value a crumb gets when nobody supplied one.
    pub fn default_value(&self) -> Value {
        match self {
            Self::Text | Self::Categorical => json!(""),
            Self::Integer => json!(0),
            Self::Boolean => json!(false),
            Self::Timestamp => Value::Null,
            Self::List => json!([]),
        }
    }

    /// Whether `value` has the JSON shape this type stores.
    ///
    /// Categorical values are category ids, or empty for "unset".
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Text | Self::Categorical => value.is_string(),
            Self::Integer => value.is_i64(),
            Self::Boolean => value.is_boolean(),
            Self::Timestamp => match value {
                Value::Null => true,
                Value::String(s) => DateTime::parse_from_rfc3339(s).is_ok(),
                _ => false,
            },
            Self::List => value.is_array(),
        }
    }

    /// Best guess for a value stored against a property id that is not
    /// defined yet.
    pub(crate) fn infer(value: &Value) -> Self {
        match value {
            Value::Bool(_) => Self::Boolean,
            Value::Number(_) => Self::Integer,
            Value::Array(_) => Self::List,
            _ => Self::Text,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        match s {
            "text" => Ok(Self::Text),
            "integer" => Ok(Self::Integer),
            "boolean" => Ok(Self::Boolean),
            "timestamp" => Ok(Self::Timestamp),
            "list" => Ok(Self::List),
            "categorical" => Ok(Self::Categorical),
            other => Err(StoreError::InvalidValueType(format!(
                "unknown value type: {other}"
            ))),
        }
    }
}

/// A property definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    /// Unique identifier (UUID v7).
    pub id: String,
    /// Unique across all properties.
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub value_type: ValueType,
    pub created_at: DateTime<Utc>,
}

impl Property {
    /// An unsaved definition; the id and timestamp are assigned on create.
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            description: String::new(),
            value_type,
            created_at: db::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  PropertyTable
// ═══════════════════════════════════════════════════════════════════════

/// Accessor for property definitions.
#[derive(Clone)]
pub struct PropertyTable {
    ctx: TableContext,
}

impl PropertyTable {
    pub(crate) fn new(ctx: TableContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Table for PropertyTable {
    fn name(&self) -> TableName {
        TableName::Properties
    }

    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> StoreResult<Entity> {
        require_id(id)?;
        let id = id.to_string();
        self.ctx
            .db
            .execute(move |conn| {
                load(conn, &id)?
                    .map(Entity::Property)
                    .ok_or(StoreError::NotFound {
                        entity: "property",
                        id,
                    })
            })
            .await
    }

    #[instrument(skip(self, value))]
    async fn set(&self, id: &str, value: Entity) -> StoreResult<Entity> {
        let mut property = Property::try_from(value)?;
        if property.name.trim().is_empty() {
            return Err(StoreError::InvalidName(
                "property name must not be empty".into(),
            ));
        }

        let id = id.to_string();
        let (property, created, backfilled) = self
            .ctx
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                ensure_unique_name(&tx, &property.name, &id)?;

                let existing = if id.is_empty() { None } else { load(&tx, &id)? };
                let result = match existing {
                    Some(previous) => {
                        // Stored values keep the type they were written with.
                        if previous.value_type != property.value_type {
                            return Err(StoreError::InvalidValueType(format!(
                                "property {} is {}; its value type cannot change to {}",
                                previous.name,
                                previous.value_type.as_str(),
                                property.value_type.as_str()
                            )));
                        }
                        property.id = id;
                        property.created_at = previous.created_at;
                        tx.execute(
                            "UPDATE properties SET name = ?2, description = ?3, value_type = ?4 \
                             WHERE id = ?1",
                            params![
                                property.id,
                                property.name,
                                property.description,
                                property.value_type.as_str()
                            ],
                        )?;
                        (property, false, 0)
                    }
                    None => {
                        property.id = if id.is_empty() { db::new_id() } else { id };
                        property.created_at = db::now();
                        insert(&tx, &property)?;
                        let backfilled = backfill(&tx, &property)?;
                        (property, true, backfilled)
                    }
                };
                tx.commit()?;
                Ok(result)
            })
            .await?;

        debug!(property_id = %property.id, name = %property.name, created, backfilled, "property saved");

        let collections: &[Collection] = if created {
            &[Collection::Properties, Collection::CrumbProperties]
        } else {
            &[Collection::Properties]
        };
        self.ctx
            .persist(TableName::Properties, Operation::Set, collections)
            .await?;
        Ok(Entity::Property(property))
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> StoreResult<()> {
        require_id(id)?;
        let id = id.to_string();
        self.ctx
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let deleted = tx.execute("DELETE FROM properties WHERE id = ?1", [&id])?;
                if deleted == 0 {
                    return Err(StoreError::NotFound {
                        entity: "property",
                        id,
                    });
                }
                tx.execute("DELETE FROM categories WHERE property_id = ?1", [&id])?;
                tx.execute("DELETE FROM crumb_properties WHERE property_id = ?1", [&id])?;
                tx.commit()?;
                debug!(property_id = %id, "property deleted");
                Ok(())
            })
            .await?;

        self.ctx
            .persist(
                TableName::Properties,
                Operation::Delete,
                &[
                    Collection::Properties,
                    Collection::Categories,
                    Collection::CrumbProperties,
                ],
            )
            .await
    }

    #[instrument(skip(self, filter))]
    async fn fetch(&self, filter: Option<&Filter>) -> StoreResult<Vec<Entity>> {
        let mut query = Query::new();
        if let Some(name) = filter::string(filter, "name")? {
            query.eq("name", name);
        }
        if let Some(raw) = filter::string(filter, "value_type")? {
            let value_type: ValueType = raw.parse()?;
            query.eq("value_type", value_type.as_str());
        }
        let sql = query.build(
            &format!("SELECT {COLUMNS} FROM properties"),
            "name ASC",
            Page::from_filter(filter)?,
        );

        self.ctx
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(query.params(), PropertyRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .map(|r| r.into_property().map(Entity::Property))
                    .collect()
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Shared SQL helpers
// ═══════════════════════════════════════════════════════════════════════

const COLUMNS: &str = "id, name, description, value_type, created_at";

pub(crate) fn load(conn: &Connection, id: &str) -> StoreResult<Option<Property>> {
    optional(conn.query_row(
        &format!("SELECT {COLUMNS} FROM properties WHERE id = ?1"),
        [id],
        PropertyRow::read,
    ))?
    .map(PropertyRow::into_property)
    .transpose()
}

/// All property definitions, for crumb auto-initialization.
pub(crate) fn load_all(conn: &Connection) -> StoreResult<Vec<Property>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM properties ORDER BY created_at, id"
    ))?;
    let rows = stmt
        .query_map([], PropertyRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(PropertyRow::into_property).collect()
}

pub(crate) fn count(conn: &Connection) -> StoreResult<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM properties", [], |row| row.get(0))?)
}

fn ensure_unique_name(conn: &Connection, name: &str, own_id: &str) -> StoreResult<()> {
    let taken = optional(conn.query_row(
        "SELECT id FROM properties WHERE name = ?1 AND id != ?2",
        params![name, own_id],
        |row| row.get::<_, String>(0),
    ))?;
    if taken.is_some() {
        return Err(StoreError::DuplicateName {
            entity: "property",
            name: name.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn insert(conn: &Connection, property: &Property) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO properties (id, name, description, value_type, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            property.id,
            property.name,
            property.description,
            property.value_type.as_str(),
            encode_time(&property.created_at)
        ],
    )?;
    Ok(())
}

/// Give every crumb without a value for `property` the type default.
/// Existing rows are left alone.
pub(crate) fn backfill(conn: &Connection, property: &Property) -> StoreResult<usize> {
    let default = serde_json::to_string(&property.value_type.default_value())?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO crumb_properties (crumb_id, property_id, value_type, value) \
         SELECT id, ?1, ?2, ?3 FROM crumbs",
        params![property.id, property.value_type.as_str(), default],
    )?;
    Ok(inserted)
}

pub(crate) fn dump(conn: &Connection) -> StoreResult<Vec<Property>> {
    load_all(conn)
}

pub(crate) fn restore(conn: &Connection, records: &[Property]) -> StoreResult<usize> {
    for property in records {
        insert(conn, property)?;
    }
    Ok(records.len())
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal row mapping
// ═══════════════════════════════════════════════════════════════════════

/// Raw row before enum and timestamp parsing.
struct PropertyRow {
    id: String,
    name: String,
    description: String,
    value_type: String,
    created_at: String,
}

impl PropertyRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            value_type: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_property(self) -> StoreResult<Property> {
        Ok(Property {
            id: self.id,
            name: self.name,
            description: self.description,
            value_type: self.value_type.parse()?,
            created_at: decode_time(&self.created_at)?,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::test_support::context;
    use crate::tables::{Crumb, CrumbTable};
    use serde_json::json;

    #[tokio::test]
    async fn create_and_get() {
        let (_dir, ctx) = context();
        let table = PropertyTable::new(ctx);

        let stored = table
            .set("", Property::new("estimate", ValueType::Integer).into())
            .await
            .unwrap();
        let Entity::Property(stored) = stored else {
            panic!("expected a property");
        };
        assert!(!stored.id.is_empty());

        let fetched = table.get(&stored.id).await.unwrap();
        assert_eq!(fetched, Entity::Property(stored));
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let (_dir, ctx) = context();
        let table = PropertyTable::new(ctx);
        table
            .set("", Property::new("owner", ValueType::Text).into())
            .await
            .unwrap();

        let err = table
            .set("", Property::new("owner", ValueType::Integer).into())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName { .. }));
    }

    #[tokio::test]
    async fn update_keeps_own_name() {
        let (_dir, ctx) = context();
        let table = PropertyTable::new(ctx);
        let Entity::Property(mut p) = table
            .set("", Property::new("owner", ValueType::Text).into())
            .await
            .unwrap()
        else {
            unreachable!()
        };

        p.description = "who does it".into();
        let id = p.id.clone();
        let Entity::Property(updated) = table.set(&id, p.clone().into()).await.unwrap() else {
            unreachable!()
        };
        assert_eq!(updated.description, "who does it");
        assert_eq!(updated.created_at, p.created_at);
    }

    #[tokio::test]
    async fn value_type_change_rejected() {
        let (_dir, ctx) = context();
        let table = PropertyTable::new(ctx.clone());
        let crumbs = CrumbTable::new(ctx);
        let Entity::Property(p) = table
            .set("", Property::new("estimate", ValueType::Integer).into())
            .await
            .unwrap()
        else {
            unreachable!()
        };
        let Entity::Crumb(crumb) = crumbs.set("", Crumb::new("sized").into()).await.unwrap() else {
            unreachable!()
        };

        let mut retyped = p.clone();
        retyped.value_type = ValueType::Text;
        let err = table.set(&p.id, retyped.into()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidValueType(_)));
        assert_eq!(table.get(&p.id).await.unwrap(), Entity::Property(p));

        let Entity::Crumb(reloaded) = crumbs.get(&crumb.id).await.unwrap() else {
            unreachable!()
        };
        crumbs.set(&crumb.id, reloaded.into()).await.unwrap();
    }

    #[tokio::test]
    async fn empty_name_rejected() {
        let (_dir, ctx) = context();
        let table = PropertyTable::new(ctx);
        let err = table
            .set("", Property::new("  ", ValueType::Text).into())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidName(_)));
    }

    #[tokio::test]
    async fn definition_backfills_existing_crumbs() {
        let (_dir, ctx) = context();
        let crumbs = CrumbTable::new(ctx.clone());
        let properties = PropertyTable::new(ctx);

        let Entity::Crumb(crumb) = crumbs.set("", Crumb::new("first").into()).await.unwrap() else {
            unreachable!()
        };
        let Entity::Property(p) = properties
            .set("", Property::new("labels", ValueType::List).into())
            .await
            .unwrap()
        else {
            unreachable!()
        };

        let Entity::Crumb(reloaded) = crumbs.get(&crumb.id).await.unwrap() else {
            unreachable!()
        };
        assert_eq!(reloaded.properties.get(&p.id), Some(&json!([])));
    }

    #[tokio::test]
    async fn update_does_not_backfill_again() {
        let (_dir, ctx) = context();
        let crumbs = CrumbTable::new(ctx.clone());
        let properties = PropertyTable::new(ctx);

        let Entity::Property(p) = properties
            .set("", Property::new("points", ValueType::Integer).into())
            .await
            .unwrap()
        else {
            unreachable!()
        };
        let mut crumb = Crumb::new("task");
        crumb.properties.insert(p.id.clone(), json!(8));
        let Entity::Crumb(crumb) = crumbs.set("", crumb.into()).await.unwrap() else {
            unreachable!()
        };

        let mut renamed = p.clone();
        renamed.name = "story_points".into();
        properties.set(&p.id, renamed.into()).await.unwrap();

        let Entity::Crumb(reloaded) = crumbs.get(&crumb.id).await.unwrap() else {
            unreachable!()
        };
        assert_eq!(reloaded.properties.get(&p.id), Some(&json!(8)));
    }

    #[tokio::test]
    async fn fetch_orders_by_name_and_filters_type() {
        let (_dir, ctx) = context();
        let table = PropertyTable::new(ctx);
        for (name, vt) in [
            ("zeta", ValueType::Text),
            ("alpha", ValueType::Boolean),
            ("mid", ValueType::Text),
        ] {
            table.set("", Property::new(name, vt).into()).await.unwrap();
        }

        let names: Vec<String> = table
            .fetch(None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| Property::try_from(e).unwrap().name)
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);

        let filter = json!({"value_type": "text"}).as_object().unwrap().clone();
        assert_eq!(table.fetch(Some(&filter)).await.unwrap().len(), 2);

        let bad = json!({"value_type": "float"}).as_object().unwrap().clone();
        assert!(matches!(
            table.fetch(Some(&bad)).await,
            Err(StoreError::InvalidValueType(_))
        ));
    }

    #[test]
    fn defaults_per_type() {
        assert_eq!(ValueType::Text.default_value(), json!(""));
        assert_eq!(ValueType::Integer.default_value(), json!(0));
        assert_eq!(ValueType::Boolean.default_value(), json!(false));
        assert_eq!(ValueType::Timestamp.default_value(), Value::Null);
        assert_eq!(ValueType::List.default_value(), json!([]));
        assert_eq!(ValueType::Categorical.default_value(), json!(""));
    }

    #[test]
    fn accepts_matches_shapes() {
        assert!(ValueType::Integer.accepts(&json!(3)));
        assert!(!ValueType::Integer.accepts(&json!("3")));
        assert!(ValueType::Timestamp.accepts(&json!("2026-01-01T00:00:00Z")));
        assert!(!ValueType::Timestamp.accepts(&json!("yesterday")));
        assert!(ValueType::List.accepts(&json!(["a"])));
    }
}
