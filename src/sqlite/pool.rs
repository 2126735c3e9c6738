use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bb8::Pool;
use tracing::debug;

use super::config::{SharedSqliteConnection, SqliteManager, SqliteOptions, SqlitePooledConnection};
use super::params::Params;
use super::prepared::SqlitePrepared;
use super::query::{build_result_set, execute_statement};
use super::transaction::SqliteTx;
use crate::error::SessionDbError;
use crate::pool::{ConnPool, PreparedHandle, Preparer, QueryContext, Tx, TxBeginner, TxOptions};
use crate::results::ResultSet;
use crate::types::{ExecResult, RowValues};

/// bb8-backed `SQLite` pool. Cheap to clone.
#[derive(Clone)]
pub struct SqlitePool {
    pool: Pool<SqliteManager>,
    opts: Arc<SqliteOptions>,
}

impl SqlitePool {
    /// Build the pool and run a smoke test on one connection.
    ///
    /// # Errors
    /// Returns `SessionDbError::ConnectionError` if pool creation fails, or the
    /// driver error from the smoke test.
    pub async fn connect(opts: &SqliteOptions) -> Result<Self, SessionDbError> {
        let pool = SqliteManager::new(opts.clone()).build_pool().await?;
        let pool = Self {
            pool,
            opts: Arc::new(opts.clone()),
        };
        pool.ping().await?;
        debug!(
            path = %pool.opts.db_path,
            max_connections = pool.opts.max_connections,
            "sqlite pool ready"
        );
        Ok(pool)
    }

    #[must_use]
    pub fn options(&self) -> &SqliteOptions {
        &self.opts
    }

    pub(crate) async fn checkout(&self) -> Result<SqlitePooledConnection, SessionDbError> {
        self.pool.get_owned().await.map_err(|err| match err {
            bb8::RunError::User(e) => SessionDbError::SqliteError(e),
            bb8::RunError::TimedOut => {
                SessionDbError::ConnectionError("sqlite checkout timed out".into())
            }
        })
    }

    /// Run a batch of statements on one pooled connection.
    ///
    /// # Errors
    /// Returns the driver error.
    pub async fn execute_batch(&self, sql: &str) -> Result<(), SessionDbError> {
        let conn = self.checkout().await?;
        let sql = sql.to_owned();
        run_blocking(Arc::clone(&*conn), move |guard| {
            guard.execute_batch(&sql).map_err(SessionDbError::SqliteError)
        })
        .await
    }
}

impl fmt::Debug for SqlitePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlitePool")
            .field("path", &self.opts.db_path)
            .field("state", &self.pool.state())
            .finish()
    }
}

pub(crate) async fn run_blocking<F, R>(
    conn: SharedSqliteConnection,
    func: F,
) -> Result<R, SessionDbError>
where
    F: FnOnce(&mut rusqlite::Connection) -> Result<R, SessionDbError> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = conn.blocking_lock();
        func(&mut guard)
    })
    .await?
}

/// Prepare (through rusqlite's per-connection cache) and run a DML statement.
pub(crate) async fn execute_on(
    conn: SharedSqliteConnection,
    sql: &str,
    params: &[RowValues],
) -> Result<ExecResult, SessionDbError> {
    let sql = sql.to_owned();
    let params = Params::convert(params);
    run_blocking(conn, move |guard| {
        let mut stmt = guard.prepare_cached(&sql)?;
        execute_statement(guard, &mut stmt, params.as_values())
    })
    .await
}

pub(crate) async fn query_on(
    conn: SharedSqliteConnection,
    sql: &str,
    params: &[RowValues],
) -> Result<ResultSet, SessionDbError> {
    let sql = sql.to_owned();
    let params = Params::convert(params);
    run_blocking(conn, move |guard| {
        let mut stmt = guard.prepare_cached(&sql)?;
        build_result_set(&mut stmt, params.as_values())
    })
    .await
}

/// Compile `sql` once so syntax errors surface at prepare time.
pub(crate) async fn validate_on(conn: SharedSqliteConnection, sql: &str) -> Result<(), SessionDbError> {
    let sql = sql.to_owned();
    run_blocking(conn, move |guard| {
        guard.prepare_cached(&sql)?;
        Ok(())
    })
    .await
}

#[async_trait]
impl ConnPool for SqlitePool {
    async fn execute(
        &self,
        _ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ExecResult, SessionDbError> {
        let conn = self.checkout().await?;
        execute_on(Arc::clone(&*conn), sql, params).await
    }

    async fn query(
        &self,
        _ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SessionDbError> {
        let conn = self.checkout().await?;
        query_on(Arc::clone(&*conn), sql, params).await
    }

    async fn ping(&self) -> Result<(), SessionDbError> {
        let conn = self.checkout().await?;
        run_blocking(Arc::clone(&*conn), |guard| {
            guard
                .execute_batch("SELECT 1")
                .map_err(SessionDbError::SqliteError)
        })
        .await
    }

    fn as_preparer(&self) -> Option<&dyn Preparer> {
        Some(self)
    }

    fn as_tx_beginner(&self) -> Option<&dyn TxBeginner> {
        Some(self)
    }
}

#[async_trait]
impl Preparer for SqlitePool {
    async fn prepare(
        &self,
        _ctx: &QueryContext,
        template: &str,
    ) -> Result<Arc<dyn PreparedHandle>, SessionDbError> {
        let conn = self.checkout().await?;
        validate_on(Arc::clone(&*conn), template).await?;
        Ok(Arc::new(SqlitePrepared::new(self.clone(), template)))
    }
}

#[async_trait]
impl TxBeginner for SqlitePool {
    async fn begin(
        &self,
        _ctx: &QueryContext,
        opts: TxOptions,
    ) -> Result<Arc<dyn Tx>, SessionDbError> {
        let conn = self.checkout().await?;
        // deferred transactions take the write lock on first write
        let begin = if opts.read_only {
            "BEGIN DEFERRED"
        } else {
            "BEGIN IMMEDIATE"
        };
        run_blocking(Arc::clone(&*conn), move |guard| {
            guard.execute_batch(begin).map_err(SessionDbError::SqliteError)
        })
        .await?;
        Ok(Arc::new(SqliteTx::new(conn, self.clone())))
    }
}
