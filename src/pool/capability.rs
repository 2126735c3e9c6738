use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::{ConnPool, QueryContext};
use crate::error::SessionDbError;
use crate::results::{CustomDbRow, ResultSet};
use crate::types::{ExecResult, RowValues};

/// Compiles a template into a reusable driver-level handle.
#[async_trait]
pub trait Preparer: Send + Sync {
    async fn prepare(
        &self,
        ctx: &QueryContext,
        template: &str,
    ) -> Result<Arc<dyn PreparedHandle>, SessionDbError>;
}

/// Driver-level prepared statement.
///
/// `execute`/`query` run against the connection source the handle was
/// compiled from. Transactions dispatch a handle against their own
/// connection through [`Tx::execute_prepared`] instead.
#[async_trait]
pub trait PreparedHandle: Send + Sync + fmt::Debug {
    fn template(&self) -> &str;

    async fn execute(
        &self,
        ctx: &QueryContext,
        params: &[RowValues],
    ) -> Result<ExecResult, SessionDbError>;

    async fn query(
        &self,
        ctx: &QueryContext,
        params: &[RowValues],
    ) -> Result<ResultSet, SessionDbError>;

    async fn query_row(
        &self,
        ctx: &QueryContext,
        params: &[RowValues],
    ) -> Result<Option<CustomDbRow>, SessionDbError> {
        Ok(self.query(ctx, params).await?.into_first())
    }

    /// Release driver resources. Must be idempotent.
    fn close(&self) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub read_only: bool,
}

#[async_trait]
pub trait TxBeginner: Send + Sync {
    async fn begin(
        &self,
        ctx: &QueryContext,
        opts: TxOptions,
    ) -> Result<Arc<dyn Tx>, SessionDbError>;
}

/// A live transaction pinned to one connection.
#[async_trait]
pub trait Tx: ConnPool {
    /// # Errors
    /// Returns [`SessionDbError::InvalidTransaction`] once the transaction has finished.
    async fn commit(&self) -> Result<(), SessionDbError>;

    /// # Errors
    /// Returns [`SessionDbError::InvalidTransaction`] once the transaction has finished.
    async fn rollback(&self) -> Result<(), SessionDbError>;

    /// Run a handle compiled elsewhere on this transaction's connection.
    async fn execute_prepared(
        &self,
        ctx: &QueryContext,
        stmt: &dyn PreparedHandle,
        params: &[RowValues],
    ) -> Result<ExecResult, SessionDbError>;

    async fn query_prepared(
        &self,
        ctx: &QueryContext,
        stmt: &dyn PreparedHandle,
        params: &[RowValues],
    ) -> Result<ResultSet, SessionDbError>;

    async fn query_row_prepared(
        &self,
        ctx: &QueryContext,
        stmt: &dyn PreparedHandle,
        params: &[RowValues],
    ) -> Result<Option<CustomDbRow>, SessionDbError> {
        Ok(self.query_prepared(ctx, stmt, params).await?.into_first())
    }

    fn is_finished(&self) -> bool;
}

/// Exposes the pool a connection source was checked out from.
///
/// Transactions implement this so callers holding only the transaction can
/// still reach the owning pool.
pub trait DbConnector: Send + Sync {
    fn db_conn(&self) -> Option<Arc<dyn ConnPool>>;
}
