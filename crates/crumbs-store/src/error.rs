//! Error types for the crumbs-store crate.
//!
//! All storage operations return [`StoreError`] via [`StoreResult`].
//! The first group of variants are the kinds callers match on; the rest
//! wrap engine, file and runtime failures with enough context to locate
//! them.

use std::path::PathBuf;

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `attach` was called on a backend that is already attached.
    #[error("backend is already attached")]
    AlreadyAttached,

    /// The backend (or the accessor's connection) is detached.
    #[error("backend is detached")]
    Detached,

    /// The requested table name is not an entity kind.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// An empty identifier was supplied where one is required.
    #[error("invalid id: identifier must not be empty")]
    InvalidId,

    /// The value does not fit the table or a required field is missing.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A required name is empty.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// The requested record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A uniqueness constraint would be violated.
    #[error("duplicate {entity}: {name}")]
    DuplicateName { entity: &'static str, name: String },

    /// A fetch filter carries a value of the wrong shape.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// A property value or value type is not acceptable.
    #[error("invalid value type: {0}")]
    InvalidValueType(String),

    /// Metadata refers to a schema that is not registered.
    #[error("metadata schema not found: {0}")]
    SchemaNotFound(String),

    /// Metadata content is empty.
    #[error("invalid content: metadata content must not be empty")]
    InvalidContent,

    /// A referenced property does not exist.
    #[error("property not found: {0}")]
    PropertyNotFound(String),

    /// A stash type string is not recognized.
    #[error("invalid stash type: {0}")]
    InvalidStashType(String),

    /// The lock stash is held by another holder.
    #[error("lock {name} is held by {holder}")]
    LockHeld { name: String, holder: String },

    /// Release was attempted by someone other than the current holder.
    #[error("{caller} does not hold lock {name}")]
    NotLockHolder { name: String, caller: String },

    /// The caller's stash version is stale.
    #[error("version conflict on {id}: expected {expected}, stored {actual}")]
    VersionConflict {
        id: String,
        expected: i64,
        actual: i64,
    },

    /// Configuration failed validation or could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// File system operation failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A flat file contains a malformed record.
    #[error("malformed record at {}:{line}: {source}", path.display())]
    Load {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Writing a collection to its flat file failed.
    #[error("persisting {collection} failed: {source}")]
    Persist {
        collection: &'static str,
        #[source]
        source: Box<StoreError>,
    },

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl StoreError {
    /// Wrap an I/O error with a description of what was being attempted.
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
