//! Mapping between index tables and their flat files.
//!
//! A [`Mirror`] knows, for every [`Collection`], how to dump the table into
//! its JSONL file, how to restore the file into the table on attach, and
//! how to append history entries without writing any entry twice.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::jsonl;
use crate::tables::{StashHistoryEntry, category, crumb, link, metadata, property, stash, trail};

/// One flat file and the table it mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Crumbs,
    Trails,
    Properties,
    Categories,
    CrumbProperties,
    Links,
    Metadata,
    Stashes,
    StashHistory,
}

impl Collection {
    pub const ALL: [Collection; 9] = [
        Self::Crumbs,
        Self::Trails,
        Self::Properties,
        Self::Categories,
        Self::CrumbProperties,
        Self::Links,
        Self::Metadata,
        Self::Stashes,
        Self::StashHistory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crumbs => "crumbs",
            Self::Trails => "trails",
            Self::Properties => "properties",
            Self::Categories => "categories",
            Self::CrumbProperties => "crumb_properties",
            Self::Links => "links",
            Self::Metadata => "metadata",
            Self::Stashes => "stashes",
            Self::StashHistory => "stash_history",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.jsonl", self.as_str())
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat-file side of the backend.
#[derive(Clone)]
pub(crate) struct Mirror {
    db: Database,
    data_dir: PathBuf,
    /// Ids of history entries known to be in `stash_history.jsonl`.
    history_ids: Arc<Mutex<HashSet<String>>>,
}

impl Mirror {
    pub fn new(db: Database, data_dir: PathBuf) -> Self {
        Self {
            db,
            data_dir,
            history_ids: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn path(&self, collection: Collection) -> PathBuf {
        self.data_dir.join(collection.file_name())
    }

    /// Create any missing flat file.
    pub async fn ensure_files(&self) -> StoreResult<()> {
        let data_dir = self.data_dir.clone();
        tokio::task::spawn_blocking(move || {
            for collection in Collection::ALL {
                jsonl::ensure_file(&data_dir.join(collection.file_name()))?;
            }
            Ok(())
        })
        .await?
    }

    /// Load every flat file into the index in one transaction.
    pub async fn load_all(&self) -> StoreResult<()> {
        let data_dir = self.data_dir.clone();
        let history_ids = self
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                for collection in Collection::ALL {
                    let path = data_dir.join(collection.file_name());
                    let count = restore(&tx, collection, &path)?;
                    debug!(collection = %collection, records = count, "collection loaded");
                }
                let ids = stash::history_ids(&tx)?;
                tx.commit()?;
                Ok(ids)
            })
            .await?;

        info!(history_entries = history_ids.len(), "flat files loaded into index");
        *self.guard()? = history_ids;
        Ok(())
    }

    /// Rewrite one flat file from its table.
    pub async fn rewrite(&self, collection: Collection) -> StoreResult<()> {
        let path = self.path(collection);
        let written = self
            .db
            .execute(move |conn| dump(conn, collection, &path))
            .await
            .map_err(|e| persist_error(collection, e))?;

        if let Some(ids) = written {
            *self.guard()? = ids;
        }
        Ok(())
    }

    /// Append history entries that are not yet in the history file.
    pub async fn append_history(&self, entries: Vec<StashHistoryEntry>) -> StoreResult<()> {
        let fresh: Vec<StashHistoryEntry> = {
            let known = self.guard()?;
            entries
                .into_iter()
                .filter(|e| !known.contains(&e.id))
                .collect()
        };
        if fresh.is_empty() {
            return Ok(());
        }

        let path = self.path(Collection::StashHistory);
        let ids: Vec<String> = fresh.iter().map(|e| e.id.clone()).collect();
        tokio::task::spawn_blocking(move || jsonl::append(&path, &fresh))
            .await?
            .map_err(|e| persist_error(Collection::StashHistory, e))?;

        self.guard()?.extend(ids);
        Ok(())
    }

    fn guard(&self) -> StoreResult<std::sync::MutexGuard<'_, HashSet<String>>> {
        self.history_ids
            .lock()
            .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))
    }
}

fn persist_error(collection: Collection, source: StoreError) -> StoreError {
    StoreError::Persist {
        collection: collection.as_str(),
        source: Box::new(source),
    }
}

/// Read `path` strictly and insert every record into the collection's table.
fn restore(conn: &Connection, collection: Collection, path: &Path) -> StoreResult<usize> {
    match collection {
        Collection::Crumbs => crumb::restore(conn, &jsonl::load(path)?),
        Collection::Trails => trail::restore(conn, &jsonl::load(path)?),
        Collection::Properties => property::restore(conn, &jsonl::load(path)?),
        Collection::Categories => category::restore(conn, &jsonl::load(path)?),
        Collection::CrumbProperties => crumb::restore_values(conn, &jsonl::load(path)?),
        Collection::Links => link::restore(conn, &jsonl::load(path)?),
        Collection::Metadata => metadata::restore(conn, &jsonl::load(path)?),
        Collection::Stashes => stash::restore(conn, &jsonl::load(path)?),
        Collection::StashHistory => stash::restore_history(conn, &jsonl::load(path)?),
    }
}

/// Write the collection's table to `path`. For the history collection,
/// returns the ids now in the file.
fn dump(
    conn: &Connection,
    collection: Collection,
    path: &Path,
) -> StoreResult<Option<HashSet<String>>> {
    match collection {
        Collection::Crumbs => jsonl::write_all(path, &crumb::dump(conn)?)?,
        Collection::Trails => jsonl::write_all(path, &trail::dump(conn)?)?,
        Collection::Properties => jsonl::write_all(path, &property::dump(conn)?)?,
        Collection::Categories => jsonl::write_all(path, &category::dump(conn)?)?,
        Collection::CrumbProperties => jsonl::write_all(path, &crumb::dump_values(conn)?)?,
        Collection::Links => jsonl::write_all(path, &link::dump(conn)?)?,
        Collection::Metadata => jsonl::write_all(path, &metadata::dump(conn)?)?,
        Collection::Stashes => jsonl::write_all(path, &stash::dump(conn)?)?,
        Collection::StashHistory => {
            let entries = stash::dump_history(conn)?;
            jsonl::write_all(path, &entries)?;
            return Ok(Some(entries.into_iter().map(|e| e.id).collect()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::Trail;
    use serde_json::json;

    fn history_entry(id: &str, version: i64) -> StashHistoryEntry {
        StashHistoryEntry {
            id: id.to_string(),
            stash_id: "s1".to_string(),
            version,
            value: json!(version),
            operation: "set".to_string(),
            changed_by: None,
            created_at: crate::db::now(),
        }
    }

    #[test]
    fn file_names_are_snake_case_jsonl() {
        assert_eq!(Collection::CrumbProperties.file_name(), "crumb_properties.jsonl");
        assert_eq!(Collection::StashHistory.file_name(), "stash_history.jsonl");
    }

    #[tokio::test]
    async fn rewrite_then_load_round_trips_a_table() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let mirror = Mirror::new(db.clone(), dir.path().to_path_buf());
        mirror.ensure_files().await.unwrap();

        let trail = Trail::new();
        let stored = trail.clone();
        db.execute(move |conn| trail::restore(conn, &[stored]).map(|_| ()))
            .await
            .unwrap();
        mirror.rewrite(Collection::Trails).await.unwrap();

        let fresh = Database::open_in_memory().unwrap();
        let reloaded = Mirror::new(fresh.clone(), dir.path().to_path_buf());
        reloaded.load_all().await.unwrap();
        let trails = fresh.execute(|conn| trail::dump(conn)).await.unwrap();
        assert_eq!(trails, vec![trail]);
    }

    #[tokio::test]
    async fn append_history_skips_known_entries() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let mirror = Mirror::new(db, dir.path().to_path_buf());
        mirror.ensure_files().await.unwrap();

        mirror
            .append_history(vec![history_entry("h1", 1)])
            .await
            .unwrap();
        mirror
            .append_history(vec![history_entry("h1", 1), history_entry("h2", 2)])
            .await
            .unwrap();

        let lines: Vec<StashHistoryEntry> =
            jsonl::read_all(&mirror.path(Collection::StashHistory)).unwrap();
        let ids: Vec<_> = lines.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["h1", "h2"]);
    }

    #[tokio::test]
    async fn load_all_fails_on_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let mirror = Mirror::new(db, dir.path().to_path_buf());
        mirror.ensure_files().await.unwrap();
        std::fs::write(mirror.path(Collection::Links), "{oops}\n").unwrap();

        let err = mirror.load_all().await.unwrap_err();
        assert!(matches!(err, StoreError::Load { line: 1, .. }));
    }
}
