use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bb8::{ManageConnection, Pool, PooledConnection};
use tokio::sync::Mutex;

use super::pool::SqlitePool;
use crate::error::SessionDbError;

/// One rusqlite connection, lockable from async code and `spawn_blocking` alike.
pub type SharedSqliteConnection = Arc<Mutex<rusqlite::Connection>>;

pub(crate) type SqlitePooledConnection = PooledConnection<'static, SqliteManager>;

static NEXT_MEMORY_DB: AtomicU64 = AtomicU64::new(1);

/// Options for configuring a `SQLite` pool.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    pub db_path: String,
    pub max_connections: u32,
    pub busy_timeout: Duration,
    pub wal: bool,
    /// Capacity of rusqlite's per-connection `prepare_cached` cache.
    pub statement_cache_capacity: usize,
}

impl SqliteOptions {
    #[must_use]
    pub fn new(db_path: String) -> Self {
        Self {
            db_path,
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
            wal: true,
            statement_cache_capacity: 64,
        }
    }

    /// A private shared-cache in-memory database. Every pooled connection
    /// sees the same data for as long as one of them stays open.
    #[must_use]
    pub fn memory() -> Self {
        let n = NEXT_MEMORY_DB.fetch_add(1, Ordering::Relaxed);
        let mut opts = Self::new(format!(
            "file:sql_session_mem_{}_{n}?mode=memory&cache=shared",
            std::process::id()
        ));
        opts.wal = false;
        opts
    }

    fn is_memory(&self) -> bool {
        self.db_path.contains(":memory:") || self.db_path.contains("mode=memory")
    }
}

/// Fluent builder for `SQLite` options.
#[derive(Debug, Clone)]
pub struct SqliteOptionsBuilder {
    opts: SqliteOptions,
}

impl SqliteOptionsBuilder {
    #[must_use]
    pub fn new(db_path: String) -> Self {
        Self {
            opts: SqliteOptions::new(db_path),
        }
    }

    #[must_use]
    pub fn memory() -> Self {
        Self {
            opts: SqliteOptions::memory(),
        }
    }

    #[must_use]
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.opts.max_connections = max_connections.max(1);
        self
    }

    #[must_use]
    pub fn busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.opts.busy_timeout = busy_timeout;
        self
    }

    #[must_use]
    pub fn wal(mut self, wal: bool) -> Self {
        self.opts.wal = wal;
        self
    }

    #[must_use]
    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.opts.statement_cache_capacity = capacity;
        self
    }

    #[must_use]
    pub fn finish(self) -> SqliteOptions {
        self.opts
    }

    /// Build the pool directly, without a [`Db`](crate::db::Db) on top.
    ///
    /// # Errors
    ///
    /// Returns `SessionDbError` if pool creation or the initial smoke test fails.
    pub async fn build(self) -> Result<SqlitePool, SessionDbError> {
        SqlitePool::connect(&self.finish()).await
    }
}

/// bb8 manager for `SQLite` connections.
#[derive(Debug, Clone)]
pub struct SqliteManager {
    opts: SqliteOptions,
}

impl SqliteManager {
    #[must_use]
    pub fn new(opts: SqliteOptions) -> Self {
        Self { opts }
    }

    /// Build a pool from this manager.
    ///
    /// # Errors
    /// Returns `SessionDbError` if creating the pool fails.
    pub async fn build_pool(self) -> Result<Pool<SqliteManager>, SessionDbError> {
        let max_size = self.opts.max_connections.max(1);
        // shared-cache memory databases vanish once the last connection closes
        let min_idle = self.opts.is_memory().then_some(1);
        Pool::builder()
            .max_size(max_size)
            .min_idle(min_idle)
            .idle_timeout(None)
            .build(self)
            .await
            .map_err(|e| SessionDbError::ConnectionError(format!("sqlite pool error: {e}")))
    }
}

impl ManageConnection for SqliteManager {
    type Connection = SharedSqliteConnection;
    type Error = rusqlite::Error;

    #[allow(clippy::manual_async_fn)]
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send {
        let opts = self.opts.clone();
        async move {
            let conn = rusqlite::Connection::open(&opts.db_path)?;
            conn.busy_timeout(opts.busy_timeout)?;
            conn.set_prepared_statement_cache_capacity(opts.statement_cache_capacity);
            if opts.wal {
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            }
            Ok(Arc::new(Mutex::new(conn)))
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn is_valid(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let conn = Arc::clone(conn);
        async move { conn.lock().await.execute_batch("SELECT 1") }
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_options() {
        let opts = SqliteOptionsBuilder::new("app.db".into())
            .max_connections(0)
            .busy_timeout(Duration::from_millis(250))
            .wal(false)
            .finish();
        assert_eq!(opts.max_connections, 1);
        assert_eq!(opts.busy_timeout, Duration::from_millis(250));
        assert!(!opts.wal);
    }

    #[test]
    fn memory_databases_are_distinct() {
        let a = SqliteOptions::memory();
        let b = SqliteOptions::memory();
        assert_ne!(a.db_path, b.db_path);
        assert!(a.is_memory());
        assert!(!SqliteOptions::new("x.db".into()).is_memory());
    }
}
