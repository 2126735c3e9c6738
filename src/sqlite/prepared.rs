use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::pool::{execute_on, query_on, SqlitePool};
use crate::error::SessionDbError;
use crate::pool::{PreparedHandle, QueryContext};
use crate::results::ResultSet;
use crate::types::{ExecResult, RowValues};

/// Handle to a validated `SQLite` template.
///
/// rusqlite caches compiled statements per connection, so the handle keeps
/// only the text and runs through `prepare_cached` on whichever pooled
/// connection it checks out. Once closed, the handle refuses further use.
pub struct SqlitePrepared {
    pool: SqlitePool,
    template: Arc<str>,
    closed: AtomicBool,
}

impl SqlitePrepared {
    pub(crate) fn new(pool: SqlitePool, template: &str) -> Self {
        Self {
            pool,
            template: Arc::from(template),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), SessionDbError> {
        if self.closed.load(Ordering::Acquire) {
            Err(SessionDbError::ExecutionError(format!(
                "prepared statement `{}` is closed",
                self.template
            )))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for SqlitePrepared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlitePrepared")
            .field("template", &self.template)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl PreparedHandle for SqlitePrepared {
    fn template(&self) -> &str {
        &self.template
    }

    async fn execute(
        &self,
        _ctx: &QueryContext,
        params: &[RowValues],
    ) -> Result<ExecResult, SessionDbError> {
        self.ensure_open()?;
        let conn = self.pool.checkout().await?;
        execute_on(Arc::clone(&*conn), &self.template, params).await
    }

    async fn query(
        &self,
        _ctx: &QueryContext,
        params: &[RowValues],
    ) -> Result<ResultSet, SessionDbError> {
        self.ensure_open()?;
        let conn = self.pool.checkout().await?;
        query_on(Arc::clone(&*conn), &self.template, params).await
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
