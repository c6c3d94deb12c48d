//! Failure modes of the persistence layer.
//!
//! Everything a store can report collapses into four cases: the driver
//! failed, the row is not there, a JSON TEXT column did not parse back,
//! or a migration could not be applied. Callers in the engine crate wrap
//! this into their own error type via `#[from]`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    /// The underlying Postgres driver reported a failure.
    #[error("storage backend error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// An update or delete targeted a row that does not exist.
    #[error("no such row")]
    NotFound,

    /// A `definition`/`parameters`/`output` TEXT column no longer parses
    /// as JSON. Indicates the column was written outside the store.
    #[error("unparseable json column: {0}")]
    CorruptJson(#[from] serde_json::Error),

    /// Applying the embedded migrations failed.
    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}
