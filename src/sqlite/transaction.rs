use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::warn;

use super::config::{SharedSqliteConnection, SqlitePooledConnection};
use super::pool::{execute_on, query_on, run_blocking, validate_on, SqlitePool};
use super::prepared::SqlitePrepared;
use crate::error::SessionDbError;
use crate::pool::{ConnPool, DbConnector, PreparedHandle, Preparer, QueryContext, Tx};
use crate::results::ResultSet;
use crate::types::{ExecResult, RowValues};

/// Transaction that owns one pooled `SQLite` connection until commit/rollback.
///
/// Dropping it unfinished spawns a best-effort rollback on the runtime
/// before the connection goes back to the pool.
pub struct SqliteTx {
    conn: Mutex<Option<SqlitePooledConnection>>,
    handle: SharedSqliteConnection,
    pool: SqlitePool,
    finished: AtomicBool,
}

impl SqliteTx {
    pub(crate) fn new(conn: SqlitePooledConnection, pool: SqlitePool) -> Self {
        let handle = Arc::clone(&*conn);
        Self {
            conn: Mutex::new(Some(conn)),
            handle,
            pool,
            finished: AtomicBool::new(false),
        }
    }

    fn ensure_active(&self) -> Result<SharedSqliteConnection, SessionDbError> {
        if self.finished.load(Ordering::Acquire) {
            Err(SessionDbError::InvalidTransaction)
        } else {
            Ok(Arc::clone(&self.handle))
        }
    }

    /// Run `sql` to end the transaction, then hand the connection back.
    async fn finish(&self, sql: &'static str) -> Result<(), SessionDbError> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(SessionDbError::InvalidTransaction);
        }
        let res = run_blocking(Arc::clone(&self.handle), move |guard| {
            match guard.execute_batch(sql) {
                Ok(()) => Ok(()),
                Err(err) => {
                    // the connection must not return to the pool mid-transaction
                    if !guard.is_autocommit() {
                        let _ = guard.execute_batch("ROLLBACK");
                    }
                    Err(SessionDbError::SqliteError(err))
                }
            }
        })
        .await;
        self.conn.lock().unwrap_or_else(PoisonError::into_inner).take();
        res
    }
}

impl fmt::Debug for SqliteTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteTx")
            .field("finished", &self.finished.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ConnPool for SqliteTx {
    async fn execute(
        &self,
        _ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ExecResult, SessionDbError> {
        execute_on(self.ensure_active()?, sql, params).await
    }

    async fn query(
        &self,
        _ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SessionDbError> {
        query_on(self.ensure_active()?, sql, params).await
    }

    async fn ping(&self) -> Result<(), SessionDbError> {
        run_blocking(self.ensure_active()?, |guard| {
            guard
                .execute_batch("SELECT 1")
                .map_err(SessionDbError::SqliteError)
        })
        .await
    }

    fn as_preparer(&self) -> Option<&dyn Preparer> {
        Some(self)
    }

    fn as_db_connector(&self) -> Option<&dyn DbConnector> {
        Some(self)
    }
}

#[async_trait]
impl Preparer for SqliteTx {
    async fn prepare(
        &self,
        _ctx: &QueryContext,
        template: &str,
    ) -> Result<Arc<dyn PreparedHandle>, SessionDbError> {
        validate_on(self.ensure_active()?, template).await?;
        Ok(Arc::new(SqlitePrepared::new(self.pool.clone(), template)))
    }
}

#[async_trait]
impl Tx for SqliteTx {
    async fn commit(&self) -> Result<(), SessionDbError> {
        self.finish("COMMIT").await
    }

    async fn rollback(&self) -> Result<(), SessionDbError> {
        self.finish("ROLLBACK").await
    }

    async fn execute_prepared(
        &self,
        _ctx: &QueryContext,
        stmt: &dyn PreparedHandle,
        params: &[RowValues],
    ) -> Result<ExecResult, SessionDbError> {
        execute_on(self.ensure_active()?, stmt.template(), params).await
    }

    async fn query_prepared(
        &self,
        _ctx: &QueryContext,
        stmt: &dyn PreparedHandle,
        params: &[RowValues],
    ) -> Result<ResultSet, SessionDbError> {
        query_on(self.ensure_active()?, stmt.template(), params).await
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl DbConnector for SqliteTx {
    fn db_conn(&self) -> Option<Arc<dyn ConnPool>> {
        Some(Arc::new(self.pool.clone()))
    }
}

impl Drop for SqliteTx {
    fn drop(&mut self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let conn = self
            .conn
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handle = Arc::clone(&self.handle);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let res = run_blocking(handle, |guard| {
                    guard
                        .execute_batch("ROLLBACK")
                        .map_err(SessionDbError::SqliteError)
                })
                .await;
                if let Err(err) = res {
                    warn!(error = %err, "rollback of dropped sqlite transaction failed");
                }
                drop(conn);
            });
        } else if let Ok(guard) = handle.try_lock() {
            let _ = guard.execute_batch("ROLLBACK");
        }
    }
}
