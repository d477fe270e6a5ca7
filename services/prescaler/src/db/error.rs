//! Database error types.

use thiserror::Error;

/// Repository operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}. Run from repo root or services/prescaler.")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// A record the caller named does not exist (or is soft-deleted).
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
}

impl DbError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        DbError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}
