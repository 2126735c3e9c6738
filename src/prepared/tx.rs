use std::sync::Arc;

use async_trait::async_trait;

use super::{evict_on_bad_conn, no_preparer, PreparedPool};
use crate::error::SessionDbError;
use crate::pool::{ConnPool, DbConnector, Preparer, QueryContext, Tx};
use crate::results::{CustomDbRow, ResultSet};
use crate::types::{ExecResult, RowValues};

/// A transaction routed through its parent pool's statement store.
///
/// Templates are compiled in the transaction scope and dispatched on the
/// transaction's own connection.
#[derive(Debug)]
pub struct PreparedTx {
    pool: Arc<PreparedPool>,
    tx: Option<Arc<dyn Tx>>,
}

impl PreparedTx {
    #[must_use]
    pub fn new(pool: Arc<PreparedPool>, tx: Arc<dyn Tx>) -> Self {
        Self { pool, tx: Some(tx) }
    }

    /// A wrapper with no transaction behind it; every call fails with
    /// [`SessionDbError::InvalidTransaction`].
    #[must_use]
    pub fn unbound(pool: Arc<PreparedPool>) -> Self {
        Self { pool, tx: None }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<PreparedPool> {
        &self.pool
    }

    #[must_use]
    pub fn inner(&self) -> Option<&Arc<dyn Tx>> {
        self.tx.as_ref()
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_finished())
    }

    /// # Errors
    /// Returns [`SessionDbError::InvalidTransaction`] with no bound transaction.
    pub async fn commit(&self) -> Result<(), SessionDbError> {
        self.tx()?.commit().await
    }

    /// # Errors
    /// Returns [`SessionDbError::InvalidTransaction`] with no bound transaction.
    pub async fn rollback(&self) -> Result<(), SessionDbError> {
        self.tx()?.rollback().await
    }

    #[must_use]
    pub fn db_conn(&self) -> Option<Arc<dyn ConnPool>> {
        self.pool.db_conn()
    }

    fn tx(&self) -> Result<&Arc<dyn Tx>, SessionDbError> {
        self.tx.as_ref().ok_or(SessionDbError::InvalidTransaction)
    }

    fn preparer<'a>(&'a self, tx: &'a Arc<dyn Tx>) -> Result<&'a dyn Preparer, SessionDbError> {
        tx.as_preparer()
            .or_else(|| self.pool.raw().as_preparer())
            .ok_or_else(no_preparer)
    }
}

#[async_trait]
impl ConnPool for PreparedTx {
    async fn execute(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ExecResult, SessionDbError> {
        let tx = self.tx()?;
        ctx.check()?;
        let store = self.pool.store();
        let stmt = store
            .get_or_compile(ctx, sql, self.preparer(tx)?, true)
            .await?;
        let res = ctx
            .run(tx.execute_prepared(ctx, stmt.handle()?.as_ref(), params))
            .await;
        evict_on_bad_conn(store, &stmt, res)
    }

    async fn query(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SessionDbError> {
        let tx = self.tx()?;
        ctx.check()?;
        let store = self.pool.store();
        let stmt = store
            .get_or_compile(ctx, sql, self.preparer(tx)?, true)
            .await?;
        let res = ctx
            .run(tx.query_prepared(ctx, stmt.handle()?.as_ref(), params))
            .await;
        evict_on_bad_conn(store, &stmt, res)
    }

    async fn query_row(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<Option<CustomDbRow>, SessionDbError> {
        let tx = self.tx()?;
        ctx.check()?;
        let store = self.pool.store();
        let stmt = store
            .get_or_compile(ctx, sql, self.preparer(tx)?, true)
            .await?;
        let res = ctx
            .run(tx.query_row_prepared(ctx, stmt.handle()?.as_ref(), params))
            .await;
        evict_on_bad_conn(store, &stmt, res)
    }

    async fn ping(&self) -> Result<(), SessionDbError> {
        self.db_conn().ok_or(SessionDbError::InvalidDb)?.ping().await
    }

    fn as_db_connector(&self) -> Option<&dyn DbConnector> {
        Some(self)
    }
}

impl DbConnector for PreparedTx {
    fn db_conn(&self) -> Option<Arc<dyn ConnPool>> {
        PreparedTx::db_conn(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TxOptions;
    use crate::test_utils::MockPool;
    use std::time::Duration;

    fn prepared(mock: &MockPool) -> Arc<PreparedPool> {
        Arc::new(PreparedPool::new(
            Arc::new(mock.clone()),
            0,
            Duration::from_secs(60),
        ))
    }

    #[tokio::test]
    async fn unbound_wrapper_reports_invalid_transaction() {
        let tx = PreparedTx::unbound(prepared(&MockPool::new()));
        assert!(matches!(tx.commit().await, Err(SessionDbError::InvalidTransaction)));
        assert!(matches!(tx.rollback().await, Err(SessionDbError::InvalidTransaction)));
        let ctx = QueryContext::new();
        assert!(matches!(
            tx.execute(&ctx, "SELECT 1", &[]).await,
            Err(SessionDbError::InvalidTransaction)
        ));
    }

    #[tokio::test]
    async fn statements_run_on_the_transaction() {
        let mock = MockPool::new();
        let pool = prepared(&mock);
        let ctx = QueryContext::new();

        let tx = pool.begin(&ctx, TxOptions::default()).await.unwrap();
        tx.execute(&ctx, "INSERT INTO t VALUES (?)", &[1_i64.into()])
            .await
            .unwrap();
        tx.execute(&ctx, "INSERT INTO t VALUES (?)", &[2_i64.into()])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(!tx.is_bound());
        assert!(pool.store().contains("INSERT INTO t VALUES (?)", true));
        assert!(!pool.store().contains("INSERT INTO t VALUES (?)", false));
        let counts = mock.counts();
        assert_eq!(counts.prepares, 1);
        assert_eq!(counts.tx_executes, 2);
        assert_eq!(counts.commits, 1);
        assert!(matches!(tx.commit().await, Err(SessionDbError::InvalidTransaction)));
    }
}
