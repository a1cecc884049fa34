/// Errors from database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A table with this name is already registered, or the table handle
    /// already belongs to a database.
    #[error("table {0:?} is already registered")]
    DuplicateTable(String),

    /// The table was never registered with this database.
    #[error("table {0:?} is not registered")]
    TableNotRegistered(String),

    /// The write transaction does not hold the table's lock.
    #[error("table {0:?} is not locked by this write transaction")]
    TableNotLocked(String),

    /// Table names must match `^[a-z][a-z0-9_-]{0,30}$`.
    #[error("invalid table name {0:?}")]
    InvalidTableName(String),

    /// Index names follow the same rules as table names.
    #[error("invalid index name {index:?} in table {table:?}")]
    InvalidIndexName { table: String, index: String },

    /// Two indexes of one table share a name.
    #[error("duplicate index {index:?} in table {table:?}")]
    DuplicateIndex { table: String, index: String },

    /// A query referenced an index the table does not have.
    #[error("table {table:?} has no index {index:?}")]
    IndexNotFound { table: String, index: String },

    /// The primary index was declared non-unique.
    #[error("primary index {index:?} of table {table:?} must be unique")]
    PrimaryNotUnique { table: String, index: String },

    /// The primary key function must yield exactly one key per object.
    #[error("primary key of table {table:?} yielded {count} keys, expected exactly one")]
    PrimaryKeyCount { table: String, count: usize },

    /// The delete tracker was closed, or its registering transaction did not
    /// commit.
    #[error("delete tracker {tracker:?} of table {table:?} is closed")]
    TrackerClosed { table: String, tracker: String },

    /// A unique secondary key is owned by a different object.
    #[error("unique index {index:?} of table {table:?} already holds key {key}")]
    UniqueConstraint {
        table: String,
        index: String,
        key: String,
    },

    /// Non-unique index keys carry their length in a u16 suffix.
    #[error("key of length {len} is too long for non-unique index {index:?}")]
    KeyTooLong { index: String, len: usize },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The background worker needs a tokio runtime.
    #[error("no tokio runtime available to start the graveyard worker")]
    NoRuntime,

    /// `start` was called twice.
    #[error("graveyard worker already started")]
    AlreadyStarted,

    /// `stop` was called without a running worker.
    #[error("graveyard worker not started")]
    NotStarted,

    /// The background worker panicked or was cancelled.
    #[error("graveyard worker failed: {0}")]
    Worker(String),

    /// Encoding objects as JSON failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Writing a dump failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
