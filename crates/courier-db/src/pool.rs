//! Connection pool management for PostgreSQL.
//!
//! The delivery path is read-heavy (slim delivery loads, endpoint and
//! project lookups) while writes are small and frequent (status and
//! metadata updates, attempt rows). [`Database`] therefore carries two
//! bindings: the primary pool for writes and an optional replica pool that
//! read paths prefer when configured.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::error::DbError;

/// Primary and read-replica pool bindings.
#[derive(Debug, Clone)]
pub struct Database {
    primary: PgPool,
    replica: Option<PgPool>,
}

impl Database {
    /// Connect to the primary, and to a read replica when a DSN is given.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ConnectionFailed` if either pool cannot be
    /// established.
    pub async fn connect(
        primary_url: &str,
        replica_url: Option<&str>,
        options: DatabaseOptions,
    ) -> Result<Self, DbError> {
        let primary = pool_with_options(primary_url, &options).await?;
        let replica = match replica_url {
            Some(url) => Some(pool_with_options(url, &options).await?),
            None => None,
        };

        Ok(Self { primary, replica })
    }

    /// Wrap existing pools, e.g. ones created in `main`.
    #[must_use]
    pub fn from_pools(primary: PgPool, replica: Option<PgPool>) -> Self {
        Self { primary, replica }
    }

    /// The primary binding. All writes go here.
    #[must_use]
    pub fn writer(&self) -> &PgPool {
        &self.primary
    }

    /// The read binding: the replica when configured, the primary otherwise.
    #[must_use]
    pub fn reader(&self) -> &PgPool {
        self.replica.as_ref().unwrap_or(&self.primary)
    }

    /// Close all connections in both pools.
    pub async fn close(&self) {
        self.primary.close().await;
        if let Some(replica) = &self.replica {
            replica.close().await;
        }
    }
}

async fn pool_with_options(url: &str, options: &DatabaseOptions) -> Result<PgPool, DbError> {
    PgPoolOptions::new()
        .min_connections(options.min_connections)
        .max_connections(options.max_connections)
        .acquire_timeout(options.acquire_timeout)
        .connect(url)
        .await
        .map_err(DbError::ConnectionFailed)
}

/// Configuration options for the connection pools.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Minimum number of connections to maintain per pool.
    ///
    /// Default: 1
    pub min_connections: u32,

    /// Maximum number of connections allowed per pool.
    ///
    /// Default: 10
    pub max_connections: u32,

    /// Maximum time to wait when acquiring a connection.
    ///
    /// Default: 5 seconds
    pub acquire_timeout: Duration,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = DatabaseOptions::default();
        assert_eq!(options.min_connections, 1);
        assert_eq!(options.max_connections, 10);
        assert_eq!(options.acquire_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_custom_options() {
        let options = DatabaseOptions {
            min_connections: 4,
            max_connections: 64,
            acquire_timeout: Duration::from_secs(30),
        };
        assert_eq!(options.min_connections, 4);
        assert_eq!(options.max_connections, 64);
        assert_eq!(options.acquire_timeout, Duration::from_secs(30));
    }
}
