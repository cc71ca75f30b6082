//! Database error types.

use thiserror::Error;

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum DbError {
    /// A connection could not be established or acquired.
    #[error("database connection failed: {0}")]
    ConnectionFailed(#[source] sqlx::Error),

    /// A query failed to execute.
    #[error("database query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// A migration failed to apply.
    #[error("database migration failed: {0}")]
    MigrationFailed(#[from] sqlx::migrate::MigrateError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_failed_from_sqlx() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DbError::QueryFailed(_)));
        assert!(err.to_string().contains("query failed"));
    }
}
