//! SQLite index database setup.
//!
//! The [`Database`] struct wraps a `rusqlite::Connection` behind an
//! `Arc<Mutex<>>` and exposes async methods that use
//! `tokio::task::spawn_blocking` to avoid blocking the async runtime.
//!
//! The index is disposable: [`Database::create_fresh`] deletes any prior
//! file before opening, and the schema is built from scratch every time.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use rusqlite::functions::FunctionFlags;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::schema;

/// Thread-safe handle to the SQLite index.
///
/// Clones share one connection. After [`Database::close`] every clone
/// fails with [`StoreError::Detached`].
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl Database {
    /// Delete any index at `path` (with its WAL side files), open a new one,
    /// apply pragmas and create the schema.
    pub async fn create_fresh(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || {
            for suffix in ["", "-wal", "-shm"] {
                let mut stale = path.clone().into_os_string();
                stale.push(suffix);
                match std::fs::remove_file(&stale) {
                    Ok(()) => debug!(path = ?stale, "removed stale index file"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(StoreError::io(
                            format!("removing stale index {}", Path::new(&stale).display()),
                            e,
                        ));
                    }
                }
            }
            let db = Self::open(&path)?;
            db.with_conn(schema::create)?;
            Ok(db)
        })
        .await?
    }

    /// Open (or create) a database at `path` and apply pragmas.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening index database");

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn)?;
        Self::register_functions(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Create an in-memory database with the schema applied. Useful for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");

        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;
        Self::register_functions(&conn)?;
        schema::create(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Execute a closure against the connection on the blocking pool.
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            let conn = guard.as_ref().ok_or(StoreError::Detached)?;
            f(conn)
        })
        .await?
    }

    /// Execute a mutable closure (for transactions) on the blocking pool.
    ///
    /// The closure receives a `&mut Connection` so it can call
    /// `conn.transaction()`.
    pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            let conn = guard.as_mut().ok_or(StoreError::Detached)?;
            f(conn)
        })
        .await?
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) -> StoreResult<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            if let Some(conn) = guard.take() {
                conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
                info!("index database closed");
            }
            Ok(())
        })
        .await?
    }

    /// Run `f` synchronously on the calling thread. Only for setup paths
    /// that already run on the blocking pool.
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
        let conn = guard.as_ref().ok_or(StoreError::Detached)?;
        f(conn)
    }

    // ── pragmas ──────────────────────────────────────────────────────

    fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
        debug!("applying SQLite pragmas");

        // WAL mode: readers never block the single writer.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        // The index is rebuilt from the flat files on every attach, so a
        // lost transaction on power failure costs nothing.
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.pragma_update(None, "temp_store", "MEMORY")?;

        // Busy timeout so concurrent writers wait instead of failing immediately.
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;

        Ok(())
    }

    // ── SQL functions ────────────────────────────────────────────────

    /// `fold_case(text)`: Unicode lowercase. SQLite's `lower()` folds ASCII only.
    fn register_functions(conn: &Connection) -> StoreResult<()> {
        conn.create_scalar_function(
            "fold_case",
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let text: Option<String> = ctx.get(0)?;
                Ok(text.map(|t| t.to_lowercase()))
            },
        )?;
        Ok(())
    }
}

// ── identifiers and timestamps ───────────────────────────────────────

/// Produce a new time-ordered identifier (UUID v7).
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Fixed-width RFC 3339 so that lexical order in SQLite matches time order.
pub(crate) fn encode_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_time(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp {raw:?}: {e}")))
}

pub(crate) fn decode_opt_time(raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(decode_time).transpose()
}

/// Current time truncated to the stored precision, so values handed back
/// to callers compare equal to what a later read returns.
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    let micros = now.timestamp_micros();
    DateTime::from_timestamp_micros(micros).unwrap_or(now)
}

// ── tests ────────────────────────────────────────────────────────────
