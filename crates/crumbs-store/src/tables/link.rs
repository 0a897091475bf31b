//! Typed, directed edges between entities.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    /// crumb → trail
    BelongsTo,
    /// child crumb → parent crumb
    ChildOf,
    /// trail → crumb it branches from
    BranchesFrom,
    /// stash → scope
    ScopedTo,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BelongsTo => "belongs_to",
            Self::ChildOf => "child_of",
            Self::BranchesFrom => "branches_from",
            Self::ScopedTo => "scoped_to",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkType {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        match s {
            "belongs_to" => Ok(Self::BelongsTo),
            "child_of" => Ok(Self::ChildOf),
            "branches_from" => Ok(Self::BranchesFrom),
            "scoped_to" => Ok(Self::ScopedTo),
            other => Err(StoreError::InvalidData(format!("unknown link type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub id: String,
    pub link_type: LinkType,
    pub from_id: String,
    pub to_id: String,
    pub created_at: DateTime<Utc>,
}

impl Link {
    pub fn new(link_type: LinkType, from_id: impl Into<String>, to_id: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            link_type,
            from_id: from_id.into(),
            to_id: to_id.into(),
            created_at: db::now(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  LinkTable
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct LinkTable {
    ctx: TableContext,
}

impl LinkTable {
    pub(crate) fn new(ctx: TableContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Table for LinkTable {
    fn name(&self) -> TableName {
        TableName::Links
    }

    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> StoreResult<Entity> {
        require_id(id)?;
        let id = id.to_string();
        self.ctx
            .db
            .execute(move |conn| {
                load(conn, &id)?
                    .map(Entity::Link)
                    .ok_or(StoreError::NotFound { entity: "link", id })
            })
            .await
    }

    #[instrument(skip(self, value))]
    async fn set(&self, id: &str, value: Entity) -> StoreResult<Entity> {
        let mut link = Link::try_from(value)?;
        if link.from_id.is_empty() || link.to_id.is_empty() {
            return Err(StoreError::InvalidData(
                "link needs both from_id and to_id".into(),
            ));
        }

        let id = id.to_string();
        let link = self
            .ctx
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let existing = if id.is_empty() { None } else { load(&tx, &id)? };
                match existing {
                    Some(previous) => {
                        link.id = id;
                        link.created_at = previous.created_at;
                    }
                    None => {
                        link.id = if id.is_empty() { db::new_id() } else { id };
                        link.created_at = db::now();
                    }
                }
                ensure_unique(&tx, &link)?;
                insert(&tx, &link)?;
                tx.commit()?;
                Ok(link)
            })
            .await?;

        debug!(
            link_id = %link.id,
            link_type = %link.link_type,
            from = %link.from_id,
            to = %link.to_id,
            "link saved"
        );
        self.ctx
            .persist(TableName::Links, Operation::Set, &[Collection::Links])
            .await?;
        Ok(Entity::Link(link))
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> StoreResult<()> {
        require_id(id)?;
        let id = id.to_string();
        self.ctx
            .db
            .execute(move |conn| {
                if conn.execute("DELETE FROM links WHERE id = ?1", [&id])? == 0 {
                    return Err(StoreError::NotFound { entity: "link", id });
                }
                Ok(())
            })
            .await?;

        self.ctx
            .persist(TableName::Links, Operation::Delete, &[Collection::Links])
            .await
    }

    #[instrument(skip(self, filter))]
    async fn fetch(&self, filter: Option<&Filter>) -> StoreResult<Vec<Entity>> {
        let mut query = Query::new();
        if let Some(raw) = filter::string(filter, "link_type")? {
            let link_type: LinkType = raw
                .parse()
                .map_err(|_| StoreError::InvalidFilter(format!("unknown link type: {raw}")))?;
            query.eq("link_type", link_type.as_str());
        }
        if let Some(from_id) = filter::string(filter, "from_id")? {
            query.eq("from_id", from_id);
        }
        if let Some(to_id) = filter::string(filter, "to_id")? {
            query.eq("to_id", to_id);
        }
        let sql = query.build(
            &format!("SELECT {COLUMNS} FROM links"),
            "created_at DESC, id DESC",
            Page::from_filter(filter)?,
        );

        self.ctx
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(query.params(), LinkRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .map(|r| r.into_link().map(Entity::Link))
                    .collect()
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Shared SQL helpers
// ═══════════════════════════════════════════════════════════════════════

const COLUMNS: &str = "id, link_type, from_id, to_id, created_at";

fn load(conn: &Connection, id: &str) -> StoreResult<Option<Link>> {
    optional(conn.query_row(
        &format!("SELECT {COLUMNS} FROM links WHERE id = ?1"),
        [id],
        LinkRow::read,
    ))?
    .map(LinkRow::into_link)
    .transpose()
}

fn ensure_unique(conn: &Connection, link: &Link) -> StoreResult<()> {
    let taken = optional(conn.query_row(
        "SELECT id FROM links WHERE link_type = ?1 AND from_id = ?2 AND to_id = ?3 AND id != ?4",
        params![link.link_type.as_str(), link.from_id, link.to_id, link.id],
        |row| row.get::<_, String>(0),
    ))?;
    if taken.is_some() {
        return Err(StoreError::DuplicateName {
            entity: "link",
            name: format!("{} {} -> {}", link.link_type, link.from_id, link.to_id),
        });
    }
    Ok(())
}

fn insert(conn: &Connection, link: &Link) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO links (id, link_type, from_id, to_id, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            link.id,
            link.link_type.as_str(),
            link.from_id,
            link.to_id,
            encode_time(&link.created_at)
        ],
    )?;
    Ok(())
}

pub(crate) fn dump(conn: &Connection) -> StoreResult<Vec<Link>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM links ORDER BY created_at, id"
    ))?;
    let rows = stmt
        .query_map([], LinkRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(LinkRow::into_link).collect()
}

pub(crate) fn restore(conn: &Connection, records: &[Link]) -> StoreResult<usize> {
    for link in records {
        insert(conn, link)?;
    }
    Ok(records.len())
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal row mapping
// ═══════════════════════════════════════════════════════════════════════

struct LinkRow {
    id: String,
    link_type: String,
    from_id: String,
    to_id: String,
    created_at: String,
}

impl LinkRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            link_type: row.get(1)?,
            from_id: row.get(2)?,
            to_id: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_link(self) -> StoreResult<Link> {
        Ok(Link {
            id: self.id,
            link_type: self.link_type.parse()?,
            from_id: self.from_id,
            to_id: self.to_id,
            created_at: decode_time(&self.created_at)?,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::test_support::context;
    use serde_json::json;

    #[tokio::test]
    async fn create_and_get() {
        let (_dir, ctx) = context();
        let table = LinkTable::new(ctx);

        let link = Link::try_from(
            table
                .set("", Link::new(LinkType::ChildOf, "a", "b").into())
                .await
                .unwrap(),
        )
        .unwrap();
        assert!(!link.id.is_empty());
        assert_eq!(table.get(&link.id).await.unwrap(), Entity::Link(link));
    }

    #[tokio::test]
    async fn duplicate_triple_rejected() {
        let (_dir, ctx) = context();
        let table = LinkTable::new(ctx);

        table
            .set("", Link::new(LinkType::BelongsTo, "c1", "t1").into())
            .await
            .unwrap();
        let err = table
            .set("", Link::new(LinkType::BelongsTo, "c1", "t1").into())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName { entity: "link", .. }));

        // A different type between the same endpoints is a different link.
        table
            .set("", Link::new(LinkType::ChildOf, "c1", "t1").into())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resaving_a_link_is_not_a_duplicate() {
        let (_dir, ctx) = context();
        let table = LinkTable::new(ctx);
        let link = Link::try_from(
            table
                .set("", Link::new(LinkType::ScopedTo, "s1", "t1").into())
                .await
                .unwrap(),
        )
        .unwrap();
        let id = link.id.clone();
        table.set(&id, link.into()).await.unwrap();
        assert_eq!(table.fetch(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn endpoints_required() {
        let (_dir, ctx) = context();
        let table = LinkTable::new(ctx);
        let err = table
            .set("", Link::new(LinkType::ChildOf, "", "b").into())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));
    }

    #[tokio::test]
    async fn fetch_filters() {
        let (_dir, ctx) = context();
        let table = LinkTable::new(ctx);
        for (lt, from, to) in [
            (LinkType::BelongsTo, "c1", "t1"),
            (LinkType::BelongsTo, "c2", "t1"),
            (LinkType::ChildOf, "c2", "c1"),
        ] {
            table.set("", Link::new(lt, from, to).into()).await.unwrap();
        }

        let by_type = json!({"link_type": "belongs_to"}).as_object().unwrap().clone();
        assert_eq!(table.fetch(Some(&by_type)).await.unwrap().len(), 2);

        let by_from = json!({"from_id": "c2"}).as_object().unwrap().clone();
        assert_eq!(table.fetch(Some(&by_from)).await.unwrap().len(), 2);

        let both = json!({"link_type": "belongs_to", "to_id": "t1", "from_id": "c1"})
            .as_object()
            .unwrap()
            .clone();
        assert_eq!(table.fetch(Some(&both)).await.unwrap().len(), 1);

        let bad = json!({"link_type": "owns"}).as_object().unwrap().clone();
        assert!(matches!(
            table.fetch(Some(&bad)).await,
            Err(StoreError::InvalidFilter(_))
        ));
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let (_dir, ctx) = context();
        let table = LinkTable::new(ctx);
        let id = table
            .set("", Link::new(LinkType::ChildOf, "a", "b").into())
            .await
            .unwrap()
            .id()
            .to_string();
        table.delete(&id).await.unwrap();
        assert!(matches!(
            table.get(&id).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
