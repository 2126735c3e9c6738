//! Connection abstraction consumed by the session core.
//!
//! Backends implement [`ConnPool`] and opt into the optional capabilities
//! ([`Preparer`], [`TxBeginner`], [`DbConnector`]) by overriding the matching
//! `as_*` accessor. The core never inspects a backend beyond these traits.

pub mod capability;
pub mod context;
pub mod target;

use std::fmt;

use async_trait::async_trait;

use crate::error::SessionDbError;
use crate::results::{CustomDbRow, ResultSet};
use crate::types::{ExecResult, RowValues};

pub use capability::{DbConnector, PreparedHandle, Preparer, Tx, TxBeginner, TxOptions};
pub use context::QueryContext;
pub use target::ConnTarget;

/// Anything that can run positional-argument SQL.
#[async_trait]
pub trait ConnPool: Send + Sync + fmt::Debug {
    /// Run a statement that does not return rows.
    async fn execute(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ExecResult, SessionDbError>;

    /// Run a statement and materialise its rows.
    async fn query(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SessionDbError>;

    /// Run a statement and keep only the first row.
    async fn query_row(
        &self,
        ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<Option<CustomDbRow>, SessionDbError> {
        Ok(self.query(ctx, sql, params).await?.into_first())
    }

    async fn ping(&self) -> Result<(), SessionDbError> {
        Ok(())
    }

    fn as_preparer(&self) -> Option<&dyn Preparer> {
        None
    }

    fn as_tx_beginner(&self) -> Option<&dyn TxBeginner> {
        None
    }

    fn as_db_connector(&self) -> Option<&dyn DbConnector> {
        None
    }
}
