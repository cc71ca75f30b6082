//! Database migration management.
//!
//! Migrations are embedded at compile time from the `migrations/` directory
//! and run in filename order (0001_, 0002_, ...).

use crate::error::DbError;
use crate::pool::Database;

/// Run all pending database migrations against the primary.
///
/// # Errors
///
/// Returns `DbError::MigrationFailed` if any migration fails to apply.
pub async fn run_migrations(db: &Database) -> Result<(), DbError> {
    tracing::info!("Running database migrations...");

    sqlx::migrate!("./migrations")
        .run(db.writer())
        .await
        .map_err(DbError::MigrationFailed)?;

    tracing::info!("Migrations completed successfully");
    Ok(())
}
