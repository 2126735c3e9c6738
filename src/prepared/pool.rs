use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{evict_on_bad_conn, no_preparer, PreparedTx};
use crate::error::SessionDbError;
use crate::pool::{ConnPool, DbConnector, Preparer, QueryContext, TxOptions};
use crate::results::{CustomDbRow, ResultSet};
use crate::stmt_store::StatementStore;
use crate::types::{ExecResult, RowValues};

/// Connection pool that compiles each template once and reuses the handle.
///
/// Transactions started from it share the same store; see [`PreparedTx`].
#[derive(Debug)]
pub struct PreparedPool {
    conn: Arc<dyn ConnPool>,
    store: Arc<StatementStore>,
}

impl PreparedPool {
    #[must_use]
    pub fn new(conn: Arc<dyn ConnPool>, max_size: usize, ttl: Duration) -> Self {
        Self::with_store(conn, Arc::new(StatementStore::new(max_size, ttl)))
    }

    #[must_use]
    pub fn with_store(conn: Arc<dyn ConnPool>, store: Arc<StatementStore>) -> Self {
        Self { conn, store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<StatementStore> {
        &self.store
    }

    /// The wrapped pool.
    #[must_use]
    pub fn raw(&self) -> &Arc<dyn ConnPool> {
        &self.conn
    }

    /// Begin a transaction on the wrapped pool and bind it to this store.
    ///
    /// # Errors
    /// Returns [`SessionDbError::InvalidTransaction`] if the wrapped pool
    /// cannot begin transactions, or the driver's error.
    pub async fn begin(
        self: &Arc<Self>,
        ctx: &QueryContext,
        opts: TxOptions,
    ) -> Result<Arc<PreparedTx>, SessionDbError> {
        let beginner = self
            .conn
            .as_tx_beginner()
            .ok_or(SessionDbError::InvalidTransaction)?;
        let tx = beginner.begin(ctx, opts).await?;
        Ok(Arc::new(PreparedTx::new(Arc::clone(self), tx)))
    }

    /// Release every cached statement. The pool stays usable; later calls recompile.
    pub fn close(&self) {
        debug!(cached = self.store.len(), "closing prepared statements");
        self.store.close_all();
    }

    /// Same as [`PreparedPool::close`].
    pub fn reset(&self) {
        self.close();
    }

    /// The raw pool behind this wrapper.
    #[must_use]
    pub fn db_conn(&self) -> Option<Arc<dyn ConnPool>> {
        self.conn
            .as_db_connector()
            .and_then(|connector| connector.db_conn())
            .or_else(|| Some(Arc::clone(&self.conn)))
    }

    fn preparer(&self) -> Result<&dyn Preparer, SessionDbError> {
        self.conn.as_preparer().ok_or_else(no_preparer)
    }
}

#[async_trait]
impl ConnPool for PreparedPool {
    async fn execute(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ExecResult, SessionDbError> {
        ctx.check()?;
        let stmt = self
            .store
            .get_or_compile(ctx, sql, self.preparer()?, false)
            .await?;
        let res = ctx.run(stmt.handle()?.execute(ctx, params)).await;
        evict_on_bad_conn(&self.store, &stmt, res)
    }

    async fn query(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SessionDbError> {
        ctx.check()?;
        let stmt = self
            .store
            .get_or_compile(ctx, sql, self.preparer()?, false)
            .await?;
        let res = ctx.run(stmt.handle()?.query(ctx, params)).await;
        evict_on_bad_conn(&self.store, &stmt, res)
    }

    async fn query_row(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<Option<CustomDbRow>, SessionDbError> {
        ctx.check()?;
        let stmt = self
            .store
            .get_or_compile(ctx, sql, self.preparer()?, false)
            .await?;
        let res = ctx.run(stmt.handle()?.query_row(ctx, params)).await;
        evict_on_bad_conn(&self.store, &stmt, res)
    }

    async fn ping(&self) -> Result<(), SessionDbError> {
        self.db_conn().ok_or(SessionDbError::InvalidDb)?.ping().await
    }

    fn as_db_connector(&self) -> Option<&dyn DbConnector> {
        Some(self)
    }
}

impl DbConnector for PreparedPool {
    fn db_conn(&self) -> Option<Arc<dyn ConnPool>> {
        PreparedPool::db_conn(self)
    }
}
