//! Attachment lifecycle: the single entry point applications hold.
//!
//! [`Backend::attach`] rebuilds the index from the flat files, seeds the
//! built-in properties when needed, starts the sync machinery and
//! publishes one accessor per [`TableName`]. [`Backend::detach`] stops the
//! timer, flushes every pending write and closes the index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, SyncStrategy};
use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::mirror::{Collection, Mirror};
use crate::seed;
use crate::sync::{FlushTimer, SyncDispatcher};
use crate::tables::{
    CategoryTable, CrumbTable, LinkTable, MetadataTable, PropertyTable, StashTable, Table,
    TableContext, TableName, TrailTable,
};

/// File name of the disposable index inside the data directory.
pub const INDEX_FILE: &str = "index.db";

/// Storage backend for crumbs, trails, properties and their relations.
#[derive(Default)]
pub struct Backend {
    state: RwLock<Option<Attachment>>,
}

/// Everything that exists only while attached.
struct Attachment {
    data_dir: PathBuf,
    db: Database,
    sync: Arc<SyncDispatcher>,
    timer: Option<FlushTimer>,
    tables: Tables,
    registry: HashMap<TableName, Arc<dyn Table>>,
}

#[derive(Clone)]
struct Tables {
    crumbs: CrumbTable,
    trails: TrailTable,
    properties: PropertyTable,
    categories: CategoryTable,
    links: LinkTable,
    metadata: MetadataTable,
    stashes: StashTable,
}

impl Tables {
    fn new(ctx: TableContext) -> Self {
        Self {
            crumbs: CrumbTable::new(ctx.clone()),
            trails: TrailTable::new(ctx.clone()),
            properties: PropertyTable::new(ctx.clone()),
            categories: CategoryTable::new(ctx.clone()),
            links: LinkTable::new(ctx.clone()),
            metadata: MetadataTable::new(ctx.clone()),
            stashes: StashTable::new(ctx),
        }
    }

    fn registry(&self) -> HashMap<TableName, Arc<dyn Table>> {
        let tables: [Arc<dyn Table>; 7] = [
            Arc::new(self.crumbs.clone()),
            Arc::new(self.trails.clone()),
            Arc::new(self.properties.clone()),
            Arc::new(self.categories.clone()),
            Arc::new(self.links.clone()),
            Arc::new(self.metadata.clone()),
            Arc::new(self.stashes.clone()),
        ];
        tables.into_iter().map(|t| (t.name(), t)).collect()
    }
}

impl Backend {
    pub fn new() -> Self {
        Self::default()
    }

    // ── lifecycle ────────────────────────────────────────────────────

    /// Attach to `config.data_dir`, rebuilding the index from the flat
    /// files. On failure the backend stays detached.
    #[instrument(skip(self, config), fields(data_dir = %config.data_dir.display()))]
    pub async fn attach(&self, config: &Config) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.is_some() {
            return Err(StoreError::AlreadyAttached);
        }
        config.validate()?;

        let data_dir = config.data_dir.clone();
        tokio::fs::create_dir_all(&data_dir).await.map_err(|e| {
            StoreError::io(format!("creating data dir {}", data_dir.display()), e)
        })?;

        let db = Database::create_fresh(data_dir.join(INDEX_FILE)).await?;
        match Self::prepare(&db, config).await {
            Ok(attachment) => {
                info!(
                    strategy = %config.sync.strategy,
                    timer = attachment.timer.is_some(),
                    "backend attached"
                );
                *state = Some(attachment);
                Ok(())
            }
            Err(e) => {
                if let Err(close_err) = db.close().await {
                    warn!(error = %close_err, "closing index after failed attach");
                }
                Err(e)
            }
        }
    }

    async fn prepare(db: &Database, config: &Config) -> StoreResult<Attachment> {
        let mirror = Mirror::new(db.clone(), config.data_dir.clone());
        mirror.ensure_files().await?;
        mirror.load_all().await?;

        let seeded = db.execute_mut(seed::seed_builtins).await?;
        if seeded > 0 {
            for collection in [
                Collection::Properties,
                Collection::Categories,
                Collection::CrumbProperties,
            ] {
                mirror.rewrite(collection).await?;
            }
        }

        let sync = Arc::new(SyncDispatcher::new(&config.sync, mirror));
        let timer = match config.sync.timer_interval() {
            Some(period) if config.sync.strategy == SyncStrategy::Batch => {
                Some(FlushTimer::start(Arc::clone(&sync), period))
            }
            _ => None,
        };

        let tables = Tables::new(TableContext::new(db.clone(), Arc::clone(&sync)));
        Ok(Attachment {
            data_dir: config.data_dir.clone(),
            db: db.clone(),
            sync,
            timer,
            registry: tables.registry(),
            tables,
        })
    }

    /// Flush every pending write and close the index. A no-op when already
    /// detached.
    ///
    /// If the flush fails the error is returned and the backend stays
    /// attached with the timer stopped; calling `detach` again retries the
    /// writes that did not reach disk.
    #[instrument(skip(self))]
    pub async fn detach(&self) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let Some(attachment) = state.as_mut() else {
            debug!("detach on a detached backend");
            return Ok(());
        };

        if let Some(mut timer) = attachment.timer.take() {
            timer.stop().await;
        }
        attachment.sync.flush().await?;

        if let Some(attachment) = state.take() {
            attachment.db.close().await?;
            info!(data_dir = %attachment.data_dir.display(), "backend detached");
        }
        Ok(())
    }

    pub async fn is_attached(&self) -> bool {
        self.state.read().await.is_some()
    }

    /// Data directory of the current attachment.
    pub async fn data_dir(&self) -> StoreResult<PathBuf> {
        self.with(|a| Ok(a.data_dir.clone())).await
    }

    // ── sync ─────────────────────────────────────────────────────────

    /// Write every queued mutation to the flat files now.
    pub async fn flush(&self) -> StoreResult<()> {
        let sync = self.with(|a| Ok(Arc::clone(&a.sync))).await?;
        sync.flush().await
    }

    /// Number of mutations waiting for a flush.
    pub async fn pending_writes(&self) -> StoreResult<usize> {
        let sync = self.with(|a| Ok(Arc::clone(&a.sync))).await?;
        Ok(sync.pending().await)
    }

    // ── accessors ────────────────────────────────────────────────────

    /// The accessor for `name`.
    pub async fn table(&self, name: TableName) -> StoreResult<Arc<dyn Table>> {
        self.with(|a| {
            a.registry
                .get(&name)
                .cloned()
                .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
        })
        .await
    }

    /// The accessor for a table name given as a string.
    pub async fn table_by_name(&self, name: &str) -> StoreResult<Arc<dyn Table>> {
        // Detached wins over an unknown name.
        if !self.is_attached().await {
            return Err(StoreError::Detached);
        }
        self.table(name.parse()?).await
    }

    pub async fn crumbs(&self) -> StoreResult<CrumbTable> {
        self.with(|a| Ok(a.tables.crumbs.clone())).await
    }

    pub async fn trails(&self) -> StoreResult<TrailTable> {
        self.with(|a| Ok(a.tables.trails.clone())).await
    }

    pub async fn properties(&self) -> StoreResult<PropertyTable> {
        self.with(|a| Ok(a.tables.properties.clone())).await
    }

    pub async fn categories(&self) -> StoreResult<CategoryTable> {
        self.with(|a| Ok(a.tables.categories.clone())).await
    }

    pub async fn links(&self) -> StoreResult<LinkTable> {
        self.with(|a| Ok(a.tables.links.clone())).await
    }

    pub async fn metadata(&self) -> StoreResult<MetadataTable> {
        self.with(|a| Ok(a.tables.metadata.clone())).await
    }

    pub async fn stashes(&self) -> StoreResult<StashTable> {
        self.with(|a| Ok(a.tables.stashes.clone())).await
    }

    async fn with<T>(&self, f: impl FnOnce(&Attachment) -> StoreResult<T>) -> StoreResult<T> {
        let state = self.state.read().await;
        let attachment = state.as_ref().ok_or(StoreError::Detached)?;
        f(attachment)
    }
}

/// Path of the index file for a data directory.
pub fn index_path(data_dir: &Path) -> PathBuf {
    data_dir.join(INDEX_FILE)
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;

    #[tokio::test]
    async fn attach_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::new();
        let config = Config::new(dir.path());

        backend.attach(&config).await.unwrap();
        assert!(matches!(
            backend.attach(&config).await,
            Err(StoreError::AlreadyAttached)
        ));
        backend.detach().await.unwrap();
    }

    #[tokio::test]
    async fn detached_backend_refuses_lookups() {
        let backend = Backend::new();
        assert!(!backend.is_attached().await);
        assert!(matches!(
            backend.table(TableName::Crumbs).await,
            Err(StoreError::Detached)
        ));
        assert!(matches!(
            backend.table_by_name("widgets").await,
            Err(StoreError::Detached)
        ));
        backend.detach().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_table_name() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::new();
        backend.attach(&Config::new(dir.path())).await.unwrap();

        assert!(matches!(
            backend.table_by_name("widgets").await,
            Err(StoreError::UnknownTable(_))
        ));
        for name in TableName::ALL {
            let table = backend.table_by_name(name.as_str()).await.unwrap();
            assert_eq!(table.name(), name);
        }
        backend.detach().await.unwrap();
    }

    #[tokio::test]
    async fn attach_creates_files_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("nested").join("data");
        let backend = Backend::new();
        backend.attach(&Config::new(&data_dir)).await.unwrap();

        for collection in Collection::ALL {
            assert!(data_dir.join(collection.file_name()).is_file());
        }
        assert!(index_path(&data_dir).is_file());
        assert_eq!(backend.data_dir().await.unwrap(), data_dir);
        backend.detach().await.unwrap();
    }

    #[tokio::test]
    async fn failed_attach_stays_detached() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("crumbs.jsonl"), "not json\n").unwrap();

        let backend = Backend::new();
        let err = backend.attach(&Config::new(dir.path())).await.unwrap_err();
        assert!(matches!(err, StoreError::Load { line: 1, .. }));
        assert!(!backend.is_attached().await);
    }

    #[tokio::test]
    async fn invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::new();
        let config = Config::new(dir.path()).with_sync(SyncConfig::batch(0, 0));
        assert!(matches!(
            backend.attach(&config).await,
            Err(StoreError::Config(_))
        ));
    }
}
