use std::sync::Arc;

use super::{ConnPool, QueryContext, Tx, TxOptions};
use crate::error::SessionDbError;
use crate::prepared::{PreparedPool, PreparedTx};
use crate::results::{CustomDbRow, ResultSet};
use crate::types::{ExecResult, RowValues};

/// The connection source currently bound to a handle.
///
/// Callers above the session core talk to this enum only; they never branch
/// on whether a plain pool, the prepared wrapper, or a live transaction is
/// active.
#[derive(Clone, Debug)]
pub enum ConnTarget {
    Pool(Arc<dyn ConnPool>),
    Prepared(Arc<PreparedPool>),
    Tx(Arc<dyn Tx>),
    PreparedTx(Arc<PreparedTx>),
}

impl ConnTarget {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ConnTarget::Pool(_) => "pool",
            ConnTarget::Prepared(_) => "prepared",
            ConnTarget::Tx(_) => "tx",
            ConnTarget::PreparedTx(_) => "prepared-tx",
        }
    }

    /// True while a transaction that has not yet finished is bound.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        match self {
            ConnTarget::Pool(_) | ConnTarget::Prepared(_) => false,
            ConnTarget::Tx(tx) => !tx.is_finished(),
            ConnTarget::PreparedTx(tx) => tx.is_bound(),
        }
    }

    /// The live driver transaction, if any.
    #[must_use]
    pub fn transaction(&self) -> Option<Arc<dyn Tx>> {
        match self {
            ConnTarget::Tx(tx) => Some(Arc::clone(tx)),
            ConnTarget::PreparedTx(tx) => tx.inner().cloned(),
            _ => None,
        }
    }

    #[must_use]
    pub fn prepared_pool(&self) -> Option<&Arc<PreparedPool>> {
        match self {
            ConnTarget::Prepared(pool) => Some(pool),
            ConnTarget::PreparedTx(tx) => Some(tx.pool()),
            _ => None,
        }
    }

    /// # Errors
    /// Returns cancellation/timeout errors from `ctx` or the driver's error.
    pub async fn execute(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ExecResult, SessionDbError> {
        match self {
            ConnTarget::Pool(pool) => ctx.run(pool.execute(ctx, sql, params)).await,
            ConnTarget::Tx(tx) => ctx.run(tx.execute(ctx, sql, params)).await,
            // the prepared wrappers bound only their dispatch by `ctx`
            ConnTarget::Prepared(pool) => pool.execute(ctx, sql, params).await,
            ConnTarget::PreparedTx(tx) => tx.execute(ctx, sql, params).await,
        }
    }

    /// # Errors
    /// Returns cancellation/timeout errors from `ctx` or the driver's error.
    pub async fn query(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SessionDbError> {
        match self {
            ConnTarget::Pool(pool) => ctx.run(pool.query(ctx, sql, params)).await,
            ConnTarget::Tx(tx) => ctx.run(tx.query(ctx, sql, params)).await,
            // the prepared wrappers bound only their dispatch by `ctx`
            ConnTarget::Prepared(pool) => pool.query(ctx, sql, params).await,
            ConnTarget::PreparedTx(tx) => tx.query(ctx, sql, params).await,
        }
    }

    /// # Errors
    /// Returns cancellation/timeout errors from `ctx` or the driver's error.
    pub async fn query_row(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<Option<CustomDbRow>, SessionDbError> {
        match self {
            ConnTarget::Pool(pool) => ctx.run(pool.query_row(ctx, sql, params)).await,
            ConnTarget::Tx(tx) => ctx.run(tx.query_row(ctx, sql, params)).await,
            // the prepared wrappers bound only their dispatch by `ctx`
            ConnTarget::Prepared(pool) => pool.query_row(ctx, sql, params).await,
            ConnTarget::PreparedTx(tx) => tx.query_row(ctx, sql, params).await,
        }
    }

    /// # Errors
    /// Returns the driver's ping failure.
    pub async fn ping(&self) -> Result<(), SessionDbError> {
        match self {
            ConnTarget::Pool(pool) => pool.ping().await,
            ConnTarget::Prepared(pool) => pool.ping().await,
            ConnTarget::Tx(tx) => tx.ping().await,
            ConnTarget::PreparedTx(tx) => tx.ping().await,
        }
    }

    /// Start a transaction and return the target bound to it.
    ///
    /// # Errors
    /// Returns [`SessionDbError::InvalidTransaction`] when a transaction is
    /// already bound or the pool cannot begin one.
    pub async fn begin(
        &self,
        ctx: &QueryContext,
        opts: TxOptions,
    ) -> Result<ConnTarget, SessionDbError> {
        match self {
            ConnTarget::Pool(pool) => {
                let beginner = pool
                    .as_tx_beginner()
                    .ok_or(SessionDbError::InvalidTransaction)?;
                let tx = ctx.run(beginner.begin(ctx, opts)).await?;
                Ok(ConnTarget::Tx(tx))
            }
            ConnTarget::Prepared(pool) => {
                let tx = ctx.run(pool.begin(ctx, opts)).await?;
                Ok(ConnTarget::PreparedTx(tx))
            }
            ConnTarget::Tx(_) | ConnTarget::PreparedTx(_) => {
                Err(SessionDbError::InvalidTransaction)
            }
        }
    }

    /// # Errors
    /// Returns [`SessionDbError::InvalidTransaction`] when no transaction is bound.
    pub async fn commit(&self) -> Result<(), SessionDbError> {
        match self {
            ConnTarget::Tx(tx) => tx.commit().await,
            ConnTarget::PreparedTx(tx) => tx.commit().await,
            _ => Err(SessionDbError::InvalidTransaction),
        }
    }

    /// # Errors
    /// Returns [`SessionDbError::InvalidTransaction`] when no transaction is bound.
    pub async fn rollback(&self) -> Result<(), SessionDbError> {
        match self {
            ConnTarget::Tx(tx) => tx.rollback().await,
            ConnTarget::PreparedTx(tx) => tx.rollback().await,
            _ => Err(SessionDbError::InvalidTransaction),
        }
    }

    /// The underlying raw pool, reached through the [`DbConnector`](super::DbConnector)
    /// capability when the target is not itself a pool.
    #[must_use]
    pub fn db_conn(&self) -> Option<Arc<dyn ConnPool>> {
        match self {
            ConnTarget::Pool(pool) => pool
                .as_db_connector()
                .and_then(|connector| connector.db_conn())
                .or_else(|| Some(Arc::clone(pool))),
            ConnTarget::Prepared(pool) => pool.db_conn(),
            ConnTarget::Tx(tx) => tx.as_db_connector().and_then(|connector| connector.db_conn()),
            ConnTarget::PreparedTx(tx) => tx.db_conn(),
        }
    }
}

impl From<Arc<dyn ConnPool>> for ConnTarget {
    fn from(pool: Arc<dyn ConnPool>) -> Self {
        ConnTarget::Pool(pool)
    }
}

impl From<Arc<PreparedPool>> for ConnTarget {
    fn from(pool: Arc<PreparedPool>) -> Self {
        ConnTarget::Prepared(pool)
    }
}

impl From<Arc<PreparedTx>> for ConnTarget {
    fn from(tx: Arc<PreparedTx>) -> Self {
        ConnTarget::PreparedTx(tx)
    }
}
