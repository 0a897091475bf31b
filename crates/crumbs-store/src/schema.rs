//! Relational schema for the index.
//!
//! The index is rebuilt on every attach, so there is no version tracking:
//! every table is created from scratch in declaration order. Columns
//! mirror the flat-file record fields one to one.

use rusqlite::Connection;
use tracing::debug;

use crate::error::StoreResult;

/// One table (and its indexes) in the index schema.
struct TableDef {
    name: &'static str,
    sql: &'static str,
}

/// All tables in creation order. Cascades are applied by the accessors,
/// so no foreign keys are declared and flat files can load in any order.
static TABLES: &[TableDef] = &[
    TableDef {
        name: "crumbs",
        sql: r#"
            CREATE TABLE crumbs (
                id         TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                state      TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX idx_crumbs_state ON crumbs(state);
            CREATE INDEX idx_crumbs_created ON crumbs(created_at);
        "#,
    },
    TableDef {
        name: "trails",
        sql: r#"
            CREATE TABLE trails (
                id              TEXT PRIMARY KEY,
                state           TEXT NOT NULL,
                parent_crumb_id TEXT,
                created_at      TEXT NOT NULL,
                completed_at    TEXT
            );
            CREATE INDEX idx_trails_state ON trails(state);
            CREATE INDEX idx_trails_parent ON trails(parent_crumb_id);
        "#,
    },
    TableDef {
        name: "properties",
        sql: r#"
            CREATE TABLE properties (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                value_type  TEXT NOT NULL CHECK(value_type IN ('text','integer','boolean','timestamp','list','categorical')),
                created_at  TEXT NOT NULL
            );
            CREATE UNIQUE INDEX idx_properties_name ON properties(name);
        "#,
    },
    TableDef {
        name: "categories",
        sql: r#"
            CREATE TABLE categories (
                id          TEXT PRIMARY KEY,
                property_id TEXT NOT NULL,
                name        TEXT NOT NULL,
                ordinal     INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX idx_categories_property ON categories(property_id);
        "#,
    },
    TableDef {
        name: "crumb_properties",
        sql: r#"
            CREATE TABLE crumb_properties (
                crumb_id    TEXT NOT NULL,
                property_id TEXT NOT NULL,
                value_type  TEXT NOT NULL,
                value       TEXT NOT NULL,
                PRIMARY KEY (crumb_id, property_id)
            );
            CREATE INDEX idx_crumb_properties_property ON crumb_properties(property_id);
        "#,
    },
    TableDef {
        name: "links",
        sql: r#"
            CREATE TABLE links (
                id         TEXT PRIMARY KEY,
                link_type  TEXT NOT NULL,
                from_id    TEXT NOT NULL,
                to_id      TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX idx_links_unique ON links(link_type, from_id, to_id);
            CREATE INDEX idx_links_from ON links(from_id);
            CREATE INDEX idx_links_to ON links(to_id);
        "#,
    },
    TableDef {
        name: "metadata",
        sql: r#"
            CREATE TABLE metadata (
                id          TEXT PRIMARY KEY,
                schema_name TEXT NOT NULL,
                crumb_id    TEXT NOT NULL,
                property_id TEXT,
                content     TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );
            CREATE INDEX idx_metadata_crumb ON metadata(crumb_id);
            CREATE INDEX idx_metadata_schema ON metadata(schema_name);
        "#,
    },
    TableDef {
        name: "stashes",
        sql: r#"
            CREATE TABLE stashes (
                id             TEXT PRIMARY KEY,
                name           TEXT NOT NULL,
                stash_type     TEXT NOT NULL,
                value          TEXT NOT NULL,
                version        INTEGER NOT NULL,
                last_operation TEXT NOT NULL,
                changed_by     TEXT,
                created_at     TEXT NOT NULL,
                updated_at     TEXT NOT NULL
            );
            CREATE UNIQUE INDEX idx_stashes_name ON stashes(name);
            CREATE INDEX idx_stashes_type ON stashes(stash_type);
        "#,
    },
    TableDef {
        name: "stash_history",
        sql: r#"
            CREATE TABLE stash_history (
                id         TEXT PRIMARY KEY,
                stash_id   TEXT NOT NULL,
                version    INTEGER NOT NULL,
                value      TEXT NOT NULL,
                operation  TEXT NOT NULL,
                changed_by TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX idx_stash_history_stash ON stash_history(stash_id, version);
        "#,
    },
];

/// Create every table on a fresh connection, in a single transaction.
pub(crate) fn create(conn: &Connection) -> StoreResult<()> {
    let tx = conn.unchecked_transaction()?;
    for table in TABLES {
        debug!(table = table.name, "creating table");
        tx.execute_batch(table.sql)?;
    }
    tx.commit()?;
    Ok(())
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_builds_every_table() {
        let conn = Connection::open_in_memory().unwrap();
        create(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .map(|r| r.unwrap())
                .collect()
        };

        for def in TABLES {
            assert!(tables.contains(&def.name.to_string()), "missing {}", def.name);
        }
    }

    #[test]
    fn link_triple_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        create(&conn).unwrap();

        conn.execute(
            "INSERT INTO links (id, link_type, from_id, to_id, created_at) \
             VALUES ('l1', 'child_of', 'a', 'b', 't')",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO links (id, link_type, from_id, to_id, created_at) \
             VALUES ('l2', 'child_of', 'a', 'b', 't')",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn property_value_type_is_checked() {
        let conn = Connection::open_in_memory().unwrap();
        create(&conn).unwrap();

        let bad = conn.execute(
            "INSERT INTO properties (id, name, value_type, created_at) VALUES ('p', 'n', 'float', 't')",
            [],
        );
        assert!(bad.is_err());
    }
}
