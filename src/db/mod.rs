//! sqlx-backed factory adapter.
//!
//! This module is the thin shim between the registry and the external
//! database client: DSN parsing, pool construction, and the optional
//! startup health check. Everything past the pool - queries, transactions,
//! cursors - is sqlx's surface, passed through unchanged.

pub mod database;
pub mod pool;

pub use database::{Database, DatabaseFactory, extract_database_name};
pub use pool::{DatabaseType, DbPool, UnsupportedScheme};
