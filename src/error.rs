//! Error types for the connection registry.
//!
//! All fallible registry and factory operations return [`DbError`]. Shutdown
//! is the one exception: it aggregates every close failure into a
//! [`CloseError`] instead of short-circuiting on the first one, so each
//! underlying cause stays individually inspectable.

use thiserror::Error;

/// Boxed error cause preserved behind a `#[source]` attribute.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum DbError {
    /// Requested logical name is absent from the configuration table.
    #[error("connection config not found: `{0}`")]
    ConfigNotFound(String),

    /// DSN does not encode a target database name in its path.
    #[error("database name not found in DSN")]
    MissingDatabaseName,

    /// Transport, authentication, or DSN parse failure while creating the
    /// underlying client.
    #[error("failed to create database client: {0}")]
    ClientCreation(#[source] BoxError),

    /// The startup health check failed: the client was created but the
    /// server is unreachable.
    #[error("could not connect to database: {0}")]
    ConnectivityCheck(#[source] BoxError),
}

impl DbError {
    /// Create a client creation error from any underlying cause.
    pub fn client_creation(source: impl Into<BoxError>) -> Self {
        Self::ClientCreation(source.into())
    }

    /// Create a connectivity check error from any underlying cause.
    pub fn connectivity(source: impl Into<BoxError>) -> Self {
        Self::ConnectivityCheck(source.into())
    }

    /// Check if this error is retryable.
    ///
    /// Configuration errors are not: the caller must fix the config or the
    /// name. Transport-level failures may succeed on a later attempt; the
    /// registry itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ClientCreation(_) | Self::ConnectivityCheck(_))
    }
}

/// Result type alias for registry operations.
pub type DbResult<T> = Result<T, DbError>;

/// A single failed close, tagged with the channel it belongs to.
#[derive(Debug, Error)]
#[error("failed to close connection `{channel}`: {source}")]
pub struct CloseFailure {
    channel: String,
    source: DbError,
}

impl CloseFailure {
    pub fn new(channel: impl Into<String>, source: DbError) -> Self {
        Self {
            channel: channel.into(),
            source,
        }
    }

    /// Logical name of the connection that failed to close.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The underlying close error.
    pub fn error(&self) -> &DbError {
        &self.source
    }
}

/// Aggregated shutdown failures.
///
/// Returned by [`ConnectionRegistry::close`](crate::ConnectionRegistry::close)
/// when one or more handles fail to close. Every cause is kept as a
/// [`CloseFailure`] so callers can match on individual errors rather than
/// parse a concatenated string.
#[derive(Debug)]
pub struct CloseError {
    failures: Vec<CloseFailure>,
}

impl CloseError {
    /// Build from a non-empty list of failures.
    pub(crate) fn new(failures: Vec<CloseFailure>) -> Self {
        debug_assert!(!failures.is_empty());
        Self { failures }
    }

    /// Every close failure, in the order they were encountered.
    ///
    /// Always non-empty: an all-successful shutdown returns `Ok(())`
    /// instead of constructing this error.
    pub fn failures(&self) -> &[CloseFailure] {
        &self.failures
    }
}

impl std::fmt::Display for CloseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to close {} connection(s): ", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures.first().map(|f| f as _)
    }
}
