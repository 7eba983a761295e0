//! Database-specific connection pools.
//!
//! Uses concrete sqlx pools (PgPool, MySqlPool) rather than AnyPool to keep
//! full type support per backend.

use crate::config::ConnectionConfig;
use crate::error::{DbError, DbResult};
use sqlx::{MySqlPool, PgPool, mysql::MySqlPoolOptions, postgres::PgPoolOptions};
use thiserror::Error;

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
}

impl DatabaseType {
    /// Sniff the backend from a DSN scheme.
    pub fn from_dsn(dsn: &str) -> Option<Self> {
        let lower = dsn.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else {
            None
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// DSN scheme not handled by any supported backend.
#[derive(Debug, Error)]
#[error("unsupported database scheme in DSN: `{0}`")]
pub struct UnsupportedScheme(pub String);

/// Database-specific connection pool.
#[derive(Debug, Clone)]
pub enum DbPool {
    Postgres(PgPool),
    MySql(MySqlPool),
}

impl DbPool {
    /// Dial the server and build a pool for the configured backend.
    ///
    /// Fails with [`DbError::ClientCreation`] on invalid pool options, an
    /// unknown scheme, or any transport/auth failure from the driver; the
    /// underlying error is kept as the source.
    pub async fn connect(config: &ConnectionConfig) -> DbResult<Self> {
        config
            .pool_options
            .validate()
            .map_err(DbError::client_creation)?;

        let db_type = DatabaseType::from_dsn(&config.dsn).ok_or_else(|| {
            let scheme = config.dsn.split("://").next().unwrap_or("").to_string();
            DbError::client_creation(UnsupportedScheme(scheme))
        })?;

        let opts = &config.pool_options;
        match db_type {
            DatabaseType::PostgreSQL => {
                let pool = PgPoolOptions::new()
                    .min_connections(opts.min_connections_or_default())
                    .max_connections(opts.max_connections_or_default())
                    .acquire_timeout(opts.acquire_timeout_or_default())
                    .idle_timeout(Some(opts.idle_timeout_or_default()))
                    .connect(&config.dsn)
                    .await
                    .map_err(DbError::client_creation)?;
                Ok(DbPool::Postgres(pool))
            }
            DatabaseType::MySQL => {
                let pool = MySqlPoolOptions::new()
                    .min_connections(opts.min_connections_or_default())
                    .max_connections(opts.max_connections_or_default())
                    .acquire_timeout(opts.acquire_timeout_or_default())
                    .idle_timeout(Some(opts.idle_timeout_or_default()))
                    .connect(&config.dsn)
                    .await
                    .map_err(DbError::client_creation)?;
                Ok(DbPool::MySql(pool))
            }
        }
    }

    /// Health check: run a trivial query against the server.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        match self {
            DbPool::Postgres(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
            DbPool::MySql(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
        }
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        match self {
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::MySql(pool) => pool.close().await,
        }
    }

    /// Get the backend type for this pool.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::MySql(_) => DatabaseType::MySQL,
        }
    }
}
