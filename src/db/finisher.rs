use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

use super::Db;
use crate::error::SessionDbError;
use crate::logging::trace_sql;
use crate::pool::{ConnTarget, QueryContext, Tx, TxOptions};
use crate::results::{CustomDbRow, ResultSet};
use crate::session::{lock, DeriveFlags, Generation, Statement};
use crate::types::RowValues;

/// Clause order used when a query is run from clauses alone.
pub const QUERY_CLAUSES: &[&str] = &["SELECT", "FROM", "WHERE", "GROUP BY", "ORDER BY", "LIMIT"];

static NEXT_SAVEPOINT: AtomicU64 = AtomicU64::new(1);

impl Db {
    /// Run a statement that returns no rows.
    ///
    /// Errors are recorded on the returned handle; check
    /// [`Db::result`] or [`Db::error`]. Nothing is dispatched if the handle
    /// already carries an error or is in dry-run mode.
    pub async fn exec(&self, sql: &str, params: &[RowValues]) -> Db {
        let mut tx = self.instance();
        let (target, ctx) = tx.stage(sql, params);
        if tx.error.is_some() || tx.config.dry_run {
            return tx;
        }

        let started = Instant::now();
        let res = target.execute(&ctx, sql, params).await;
        trace_sql(
            tx.config.sql_log,
            sql,
            params,
            started.elapsed(),
            res.as_ref().ok().map(|r| r.rows_affected),
            res.is_err(),
        );
        match res {
            Ok(result) => lock(&tx.statement).rows_affected = result.rows_affected,
            Err(err) => {
                tx.add_error(err);
            }
        }
        tx
    }

    /// Stage raw SQL for a later [`Db::rows`] or [`Db::row`].
    #[must_use]
    pub fn raw(&self, sql: &str, params: &[RowValues]) -> Db {
        let tx = self.instance();
        tx.stage(sql, params);
        tx
    }

    /// Render the named clauses onto this handle's SQL.
    #[must_use]
    pub fn build(&self, names: &[&str]) -> Db {
        let tx = self.instance();
        lock(&tx.statement).build(names);
        tx
    }

    /// Run the staged SQL and collect every row.
    ///
    /// # Errors
    /// Returns the accumulated error if one is already recorded, otherwise
    /// the dispatch failure (which is recorded too).
    pub async fn rows(&mut self) -> Result<ResultSet, Arc<SessionDbError>> {
        self.result()?;
        let (target, ctx, sql, vars) = match self.staged() {
            Ok(staged) => staged,
            Err(err) => return Err(self.add_error(err)),
        };
        if self.config.dry_run {
            return Ok(ResultSet::default());
        }

        let started = Instant::now();
        let res = target.query(&ctx, &sql, &vars).await;
        trace_sql(
            self.config.sql_log,
            &sql,
            &vars,
            started.elapsed(),
            res.as_ref().ok().map(|rs| rs.len() as u64),
            res.is_err(),
        );
        match res {
            Ok(rows) => {
                lock(&self.statement).rows_affected = rows.len() as u64;
                Ok(rows)
            }
            Err(err) => Err(self.add_error(err)),
        }
    }

    /// Run the staged SQL and keep the first row.
    ///
    /// # Errors
    /// See [`Db::rows`].
    pub async fn row(&mut self) -> Result<Option<CustomDbRow>, Arc<SessionDbError>> {
        self.result()?;
        let (target, ctx, sql, vars) = match self.staged() {
            Ok(staged) => staged,
            Err(err) => return Err(self.add_error(err)),
        };
        if self.config.dry_run {
            return Ok(None);
        }

        let started = Instant::now();
        let res = target.query_row(&ctx, &sql, &vars).await;
        trace_sql(
            self.config.sql_log,
            &sql,
            &vars,
            started.elapsed(),
            res.as_ref().ok().map(|row| u64::from(row.is_some())),
            res.is_err(),
        );
        match res {
            Ok(row) => {
                lock(&self.statement).rows_affected = u64::from(row.is_some());
                Ok(row)
            }
            Err(err) => Err(self.add_error(err)),
        }
    }

    pub async fn begin(&self) -> Db {
        self.begin_with(TxOptions::default()).await
    }

    /// Start a transaction on a handle of its own.
    ///
    /// `default_transaction_timeout` applies to each call made through the
    /// transaction when the current context has no timeout. A failure to
    /// begin is recorded on the returned handle.
    pub async fn begin_with(&self, opts: TxOptions) -> Db {
        let mut ctx = self.context();
        if ctx.timeout_duration().is_none() {
            if let Some(timeout) = self.config.default_transaction_timeout {
                ctx = ctx.timeout(timeout);
            }
        }

        let mut tx = self.session(DeriveFlags {
            context: Some(ctx.clone()),
            new_db: self.generation == Generation::Root,
            ..DeriveFlags::default()
        });
        let target = tx.target();
        match target.begin(&ctx, opts).await {
            Ok(bound) => lock(&tx.statement).target = bound,
            Err(err) => {
                tx.add_error(err);
            }
        }
        tx
    }

    /// # Errors
    /// Returns [`SessionDbError::InvalidTransaction`] if no transaction is
    /// bound, or the driver's commit failure. Either is recorded.
    pub async fn commit(&mut self) -> Result<(), Arc<SessionDbError>> {
        let target = self.target();
        match target.commit().await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.add_error(err)),
        }
    }

    /// # Errors
    /// See [`Db::commit`].
    pub async fn rollback(&mut self) -> Result<(), Arc<SessionDbError>> {
        let target = self.target();
        match target.rollback().await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.add_error(err)),
        }
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok` and rolls back otherwise. Called on a
    /// handle already in a transaction, `f` runs inside a savepoint instead,
    /// or directly when `disable_nested_transaction` is set.
    ///
    /// # Errors
    /// Returns `f`'s error, or the failure to begin or commit.
    pub async fn transaction<F, Fut, T>(&self, f: F) -> Result<T, Arc<SessionDbError>>
    where
        F: FnOnce(Db) -> Fut,
        Fut: Future<Output = Result<T, Arc<SessionDbError>>>,
    {
        if self.in_transaction() {
            if self.config.disable_nested_transaction {
                return f(self.session(DeriveFlags::default())).await;
            }
            return self.savepoint_transaction(f).await;
        }

        let mut tx = self.begin().await;
        tx.result()?;
        match f(tx.clone()).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed transaction closure failed");
                }
                Err(err)
            }
        }
    }

    async fn savepoint_transaction<F, Fut, T>(&self, f: F) -> Result<T, Arc<SessionDbError>>
    where
        F: FnOnce(Db) -> Fut,
        Fut: Future<Output = Result<T, Arc<SessionDbError>>>,
    {
        let tx = self.session(DeriveFlags::isolated());
        let raw = tx
            .target()
            .transaction()
            .ok_or(SessionDbError::InvalidTransaction)?;
        let ctx = tx.context();
        let dialector = Arc::clone(&self.lineage.dialector);
        let name = format!("sp{}", NEXT_SAVEPOINT.fetch_add(1, Ordering::Relaxed));

        run_on(&raw, &ctx, &dialector.savepoint(&name)).await?;
        match f(tx).await {
            Ok(value) => {
                run_on(&raw, &ctx, &dialector.release_savepoint(&name)).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = run_on(&raw, &ctx, &dialector.rollback_to(&name)).await {
                    warn!(savepoint = %name, error = %rollback_err, "rollback to savepoint failed");
                }
                Err(err)
            }
        }
    }

    /// Render the SQL that `f` would run, without dispatching anything.
    pub async fn to_sql<F, Fut>(&self, f: F) -> String
    where
        F: FnOnce(Db) -> Fut,
        Fut: Future<Output = Db>,
    {
        let dry = self
            .session(DeriveFlags {
                dry_run: true,
                skip_default_transaction: true,
                ..DeriveFlags::default()
            })
            .instance();
        let tx = f(dry).await;
        let mut stmt = lock(&tx.statement);
        build_if_empty(&mut stmt);
        self.lineage.dialector.explain(&stmt.sql, &stmt.vars)
    }

    fn stage(&self, sql: &str, params: &[RowValues]) -> (ConnTarget, QueryContext) {
        let mut stmt = lock(&self.statement);
        stmt.sql = sql.to_owned();
        stmt.vars = params.to_vec();
        (stmt.target.clone(), stmt.context.clone())
    }

    fn staged(&self) -> Result<(ConnTarget, QueryContext, String, Vec<RowValues>), SessionDbError> {
        let mut stmt = lock(&self.statement);
        build_if_empty(&mut stmt);
        if stmt.sql.is_empty() {
            return Err(SessionDbError::ExecutionError("no SQL staged on this handle".into()));
        }
        Ok((
            stmt.target.clone(),
            stmt.context.clone(),
            stmt.sql.clone(),
            stmt.vars.clone(),
        ))
    }
}

fn build_if_empty(stmt: &mut Statement) {
    if stmt.sql.is_empty() && !stmt.clauses.is_empty() {
        stmt.build(QUERY_CLAUSES);
    }
}

async fn run_on(tx: &Arc<dyn Tx>, ctx: &QueryContext, sql: &str) -> Result<(), SessionDbError> {
    ctx.run(tx.execute(ctx, sql, &[])).await.map(|_| ())
}
