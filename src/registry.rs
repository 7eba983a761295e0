//! The connection registry: name-keyed, lazily-initialized connection cache.
//!
//! [`ConnectionRegistry`] maps logical connection names to live handles. Each
//! name resolves to exactly one handle no matter how many callers race on it:
//! a per-name `OnceCell` makes concurrent first resolutions of the same name
//! await the single in-flight factory call instead of creating duplicates.
//! The factory call itself always runs outside the map lock, so resolutions
//! of different names never block each other on slow network I/O.
//!
//! Lifecycle: `new(channels, factory)` → `resolve(name)` any number of times
//! → `close()` once at shutdown. Handles are never evicted individually.

use crate::config::{Channels, ConnectionConfig};
use crate::error::{CloseError, CloseFailure, DbError, DbResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

/// A live connection bound to one target database.
///
/// Cached handles are owned by the registry; callers receive shared
/// references and must not close them directly - the registry closes
/// everything it owns in [`ConnectionRegistry::close`].
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// The name of the database this handle is bound to.
    fn name(&self) -> &str;

    /// Health check against the server.
    async fn ping(&self) -> DbResult<()>;

    /// Close the underlying connection.
    async fn close(&self) -> DbResult<()>;
}

/// Turns a configuration entry into a ready-to-use connection handle.
///
/// The factory wraps the external database client: it parses the DSN, dials
/// the server, and optionally verifies connectivity. It may block for
/// non-trivial time; the registry guarantees it is never invoked while
/// holding the cache lock.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    type Handle: ConnectionHandle;

    async fn create(&self, config: &ConnectionConfig) -> DbResult<Self::Handle>;
}

/// Lazily-initializing registry of named connection handles.
pub struct ConnectionRegistry<F: ConnectionFactory> {
    channels: Channels,
    factory: F,
    /// Per-name lazy handles. OnceCell ensures single-flight creation.
    handles: RwLock<HashMap<String, Arc<OnceCell<Arc<F::Handle>>>>>,
}

impl<F: ConnectionFactory> ConnectionRegistry<F> {
    /// Create a registry over an immutable configuration table.
    pub fn new(channels: Channels, factory: F) -> Self {
        Self {
            channels,
            factory,
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a logical name to its cached or newly created handle.
    ///
    /// On a cache hit this takes only a read lock and returns the shared
    /// handle. On a miss, the configuration is looked up first (unknown
    /// names fail with [`DbError::ConfigNotFound`] without touching the
    /// factory), then the factory runs outside the lock; concurrent callers
    /// for the same name await that one creation. A factory failure caches
    /// nothing - the next resolve retries.
    pub async fn resolve(&self, name: &str) -> DbResult<Arc<F::Handle>> {
        // Fast path: already initialized.
        {
            let handles = self.handles.read().await;
            if let Some(cell) = handles.get(name) {
                if let Some(handle) = cell.get() {
                    return Ok(Arc::clone(handle));
                }
            }
        }

        // Unknown names never allocate a cell or reach the factory.
        let config = self.config(name)?;

        let cell = {
            let handles = self.handles.read().await;
            if let Some(cell) = handles.get(name) {
                Arc::clone(cell)
            } else {
                drop(handles);
                let mut handles = self.handles.write().await;
                // Double-check after acquiring write lock
                Arc::clone(
                    handles
                        .entry(name.to_string())
                        .or_insert_with(|| Arc::new(OnceCell::new())),
                )
            }
        }; // Lock released here - the factory call below must not hold it

        let handle = cell
            .get_or_try_init(|| async {
                debug!(channel = %name, "creating connection");
                let handle = self.factory.create(config).await?;
                info!(channel = %name, database = %handle.name(), "connection created");
                Ok::<_, DbError>(Arc::new(handle))
            })
            .await?;

        Ok(Arc::clone(handle))
    }

    /// Look up the configuration for a logical name.
    ///
    /// Pure read against the immutable table, no side effects.
    pub fn config(&self, name: &str) -> DbResult<&ConnectionConfig> {
        self.channels
            .get(name)
            .ok_or_else(|| DbError::ConfigNotFound(name.to_string()))
    }

    /// Number of live handles currently cached.
    pub async fn handle_count(&self) -> usize {
        let handles = self.handles.read().await;
        handles.values().filter(|cell| cell.get().is_some()).count()
    }

    /// Close every cached handle.
    ///
    /// Attempts all handles even when some fail and aggregates the failures
    /// into a [`CloseError`]. Returns `Ok(())` if the cache is empty or all
    /// closes succeed. Expected to run once at shutdown with no concurrent
    /// resolves afterward; this is a usage contract, not enforced.
    pub async fn close(&self) -> Result<(), CloseError> {
        // Snapshot under the read lock, close outside it.
        let snapshot: Vec<(String, Arc<F::Handle>)> = {
            let handles = self.handles.read().await;
            handles
                .iter()
                .filter_map(|(name, cell)| cell.get().map(|h| (name.clone(), Arc::clone(h))))
                .collect()
        };

        let mut failures = Vec::new();
        for (name, handle) in snapshot {
            info!(channel = %name, "closing connection");
            if let Err(err) = handle.close().await {
                warn!(channel = %name, error = %err, "failed to close connection");
                failures.push(CloseFailure::new(name, err));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CloseError::new(failures))
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for ConnectionRegistry<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct StubHandle {
        name: String,
        close_calls: Arc<AtomicUsize>,
        fail_close: bool,
    }

    #[async_trait]
    impl ConnectionHandle for StubHandle {
        fn name(&self) -> &str {
            &self.name
        }

        async fn ping(&self) -> DbResult<()> {
            Ok(())
        }

        async fn close(&self) -> DbResult<()> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                Err(DbError::connectivity("connection reset"))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct StubFactory {
        create_calls: AtomicUsize,
        close_calls: Arc<AtomicUsize>,
        fail_create: bool,
        /// DSNs whose handles should fail their close call.
        fail_close_for: Vec<String>,
        delay: Option<std::time::Duration>,
    }

    #[async_trait]
    impl ConnectionFactory for StubFactory {
        type Handle = StubHandle;

        async fn create(&self, config: &ConnectionConfig) -> DbResult<StubHandle> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_create {
                return Err(DbError::client_creation("dial refused"));
            }
            Ok(StubHandle {
                name: config.dsn.rsplit('/').next().unwrap_or_default().to_string(),
                close_calls: Arc::clone(&self.close_calls),
                fail_close: self.fail_close_for.contains(&config.dsn),
            })
        }
    }

    fn channels(entries: &[(&str, &str)]) -> Channels {
        entries
            .iter()
            .map(|(name, dsn)| (name.to_string(), ConnectionConfig::new(*dsn, false)))
            .collect()
    }

    #[tokio::test]
    async fn test_resolve_caches_and_returns_same_handle() {
        let registry = ConnectionRegistry::new(
            channels(&[("primary", "postgres://host/db1")]),
            StubFactory::default(),
        );

        let first = registry.resolve("primary").await.unwrap();
        let second = registry.resolve("primary").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.factory.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.handle_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_name_never_reaches_factory() {
        let registry = ConnectionRegistry::new(
            channels(&[("primary", "postgres://host/db1")]),
            StubFactory::default(),
        );

        let err = registry.resolve("unknown").await.unwrap_err();
        assert!(matches!(err, DbError::ConfigNotFound(name) if name == "unknown"));
        assert_eq!(registry.factory.create_calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.handle_count().await, 0);
    }

    #[tokio::test]
    async fn test_factory_failure_is_not_cached() {
        let registry = ConnectionRegistry::new(
            channels(&[("primary", "postgres://host/db1")]),
            StubFactory {
                fail_create: true,
                ..Default::default()
            },
        );

        assert!(registry.resolve("primary").await.is_err());
        assert_eq!(registry.handle_count().await, 0);

        // A later resolve retries the factory rather than replaying the error.
        assert!(registry.resolve("primary").await.is_err());
        assert_eq!(registry.factory.create_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_same_name_racers_share_one_factory_call() {
        // Unlike the lost-update cache this replaces, racing resolutions of
        // one name await a single in-flight creation: no duplicate
        // connections, no orphaned handles.
        let registry = Arc::new(ConnectionRegistry::new(
            channels(&[("primary", "postgres://host/db1")]),
            StubFactory {
                delay: Some(std::time::Duration::from_millis(50)),
                ..Default::default()
            },
        ));

        let (a, b) = tokio::join!(registry.resolve("primary"), registry.resolve("primary"));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.factory.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_names_do_not_serialize() {
        let delay = std::time::Duration::from_millis(100);
        let registry = ConnectionRegistry::new(
            channels(&[("one", "postgres://host/db1"), ("two", "postgres://host/db2")]),
            StubFactory {
                delay: Some(delay),
                ..Default::default()
            },
        );

        let started = tokio::time::Instant::now();
        let (a, b) = tokio::join!(registry.resolve("one"), registry.resolve("two"));
        a.unwrap();
        b.unwrap();

        // Both factory calls overlap: one delay period, not two.
        let elapsed = started.elapsed();
        assert!(elapsed < delay * 2, "resolutions serialized: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_close_on_empty_registry_is_ok() {
        let registry = ConnectionRegistry::new(Channels::new(), StubFactory::default());
        assert!(registry.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_closes_every_handle() {
        let close_calls = Arc::new(AtomicUsize::new(0));
        let registry = ConnectionRegistry::new(
            channels(&[
                ("one", "postgres://host/db1"),
                ("two", "postgres://host/db2"),
                ("three", "postgres://host/db3"),
            ]),
            StubFactory {
                close_calls: Arc::clone(&close_calls),
                ..Default::default()
            },
        );

        for name in ["one", "two", "three"] {
            registry.resolve(name).await.unwrap();
        }

        registry.close().await.unwrap();
        assert_eq!(close_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_close_aggregates_all_failures() {
        let close_calls = Arc::new(AtomicUsize::new(0));
        let registry = ConnectionRegistry::new(
            channels(&[
                ("one", "postgres://host/db1"),
                ("two", "postgres://host/db2"),
                ("three", "postgres://host/db3"),
            ]),
            StubFactory {
                close_calls: Arc::clone(&close_calls),
                fail_close_for: vec![
                    "postgres://host/db1".to_string(),
                    "postgres://host/db3".to_string(),
                ],
                ..Default::default()
            },
        );

        for name in ["one", "two", "three"] {
            registry.resolve(name).await.unwrap();
        }

        let err = registry.close().await.unwrap_err();

        // All three were attempted despite two failing.
        assert_eq!(close_calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.failures().len(), 2);

        let mut failed: Vec<&str> = err.failures().iter().map(|f| f.channel()).collect();
        failed.sort_unstable();
        assert_eq!(failed, vec!["one", "three"]);
        for failure in err.failures() {
            assert!(matches!(failure.error(), DbError::ConnectivityCheck(_)));
        }
    }

    #[tokio::test]
    async fn test_config_lookup() {
        let registry = ConnectionRegistry::new(
            channels(&[("primary", "postgres://host/db1")]),
            StubFactory::default(),
        );

        assert_eq!(
            registry.config("primary").unwrap().dsn,
            "postgres://host/db1"
        );
        assert!(matches!(
            registry.config("missing"),
            Err(DbError::ConfigNotFound(_))
        ));
    }
}
