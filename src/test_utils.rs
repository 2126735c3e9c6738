//! In-memory scripted driver for tests, benches and the simulator.
//!
//! [`MockPool`] never touches a database. It counts every prepare, dispatch
//! and transaction call, and can be told to fail the next N dispatches with
//! either a broken-connection error or an ordinary execution error.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Config;
use crate::db::Dialector;
use crate::error::SessionDbError;
use crate::pool::{
    ConnPool, DbConnector, PreparedHandle, Preparer, QueryContext, Tx, TxBeginner, TxOptions,
};
use crate::results::ResultSet;
use crate::types::{ExecResult, RowValues};

/// Templates containing this marker fail to compile.
pub const INVALID_MARKER: &str = "INVALID";

#[derive(Debug, Default)]
struct Counters {
    prepares: AtomicUsize,
    closes: AtomicUsize,
    executes: AtomicUsize,
    queries: AtomicUsize,
    tx_executes: AtomicUsize,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    pings: AtomicUsize,
}

/// Snapshot of [`MockPool`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCounts {
    pub prepares: usize,
    pub closes: usize,
    pub executes: usize,
    pub queries: usize,
    pub tx_executes: usize,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub pings: usize,
}

#[derive(Debug, Default)]
struct MockState {
    counters: Counters,
    broken: AtomicUsize,
    failing: AtomicUsize,
    prepare_delay: Mutex<Option<Duration>>,
    log: Mutex<Vec<String>>,
}

impl MockState {
    fn dispatch(&self, sql: &str, params: &[RowValues]) -> Result<(), SessionDbError> {
        if take_one(&self.broken) {
            return Err(SessionDbError::BadConnection("mock connection reset".into()));
        }
        if take_one(&self.failing) {
            return Err(SessionDbError::ExecutionError(format!("mock failure for `{sql}`")));
        }
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(render(sql, params));
        Ok(())
    }

    fn rows(sql: &str, params: &[RowValues]) -> ResultSet {
        let mut rs = ResultSet::with_capacity(1);
        rs.set_column_names(Arc::new(vec!["sql".into(), "params".into()]));
        rs.add_row_values(vec![
            RowValues::Text(sql.to_owned()),
            RowValues::Int(i64::try_from(params.len()).unwrap_or(i64::MAX)),
        ]);
        rs
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

fn render(sql: &str, params: &[RowValues]) -> String {
    if params.is_empty() {
        sql.to_owned()
    } else {
        let rendered: Vec<String> = params.iter().map(RowValues::to_sql_literal).collect();
        format!("{sql} [{}]", rendered.join(", "))
    }
}

/// Counting mock connection pool.
#[derive(Debug, Clone, Default)]
pub struct MockPool {
    state: Arc<MockState>,
}

impl MockPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep inside every compile, widening the window for racing callers.
    #[must_use]
    pub fn with_prepare_delay(self, delay: Duration) -> Self {
        *self
            .state
            .prepare_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
        self
    }

    /// Fail the next `n` dispatches with [`SessionDbError::BadConnection`].
    pub fn break_next(&self, n: usize) {
        self.state.broken.store(n, Ordering::Release);
    }

    /// Fail the next `n` dispatches with an ordinary execution error.
    pub fn fail_next(&self, n: usize) {
        self.state.failing.store(n, Ordering::Release);
    }

    #[must_use]
    pub fn counts(&self) -> MockCounts {
        let c = &self.state.counters;
        MockCounts {
            prepares: c.prepares.load(Ordering::Acquire),
            closes: c.closes.load(Ordering::Acquire),
            executes: c.executes.load(Ordering::Acquire),
            queries: c.queries.load(Ordering::Acquire),
            tx_executes: c.tx_executes.load(Ordering::Acquire),
            begins: c.begins.load(Ordering::Acquire),
            commits: c.commits.load(Ordering::Acquire),
            rollbacks: c.rollbacks.load(Ordering::Acquire),
            pings: c.pings.load(Ordering::Acquire),
        }
    }

    /// Every statement dispatched so far, with bound values inlined.
    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        self.state
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn compile(&self, template: &str) -> Result<Arc<dyn PreparedHandle>, SessionDbError> {
        self.state.counters.prepares.fetch_add(1, Ordering::AcqRel);
        let delay = *self
            .state
            .prepare_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if template.contains(INVALID_MARKER) {
            return Err(SessionDbError::ExecutionError(format!(
                "syntax error near {INVALID_MARKER}"
            )));
        }
        Ok(Arc::new(MockStatement {
            template: template.to_owned(),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl ConnPool for MockPool {
    async fn execute(
        &self,
        _ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ExecResult, SessionDbError> {
        self.state.counters.executes.fetch_add(1, Ordering::AcqRel);
        self.state.dispatch(sql, params)?;
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: None,
        })
    }

    async fn query(
        &self,
        _ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SessionDbError> {
        self.state.counters.queries.fetch_add(1, Ordering::AcqRel);
        self.state.dispatch(sql, params)?;
        Ok(MockState::rows(sql, params))
    }

    async fn ping(&self) -> Result<(), SessionDbError> {
        self.state.counters.pings.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn as_preparer(&self) -> Option<&dyn Preparer> {
        Some(self)
    }

    fn as_tx_beginner(&self) -> Option<&dyn TxBeginner> {
        Some(self)
    }
}

#[async_trait]
impl Preparer for MockPool {
    async fn prepare(
        &self,
        _ctx: &QueryContext,
        template: &str,
    ) -> Result<Arc<dyn PreparedHandle>, SessionDbError> {
        self.compile(template).await
    }
}

#[async_trait]
impl TxBeginner for MockPool {
    async fn begin(
        &self,
        _ctx: &QueryContext,
        _opts: TxOptions,
    ) -> Result<Arc<dyn Tx>, SessionDbError> {
        self.state.counters.begins.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(MockTx {
            pool: self.clone(),
            finished: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
struct MockStatement {
    template: String,
    state: Arc<MockState>,
    closed: AtomicBool,
}

#[async_trait]
impl PreparedHandle for MockStatement {
    fn template(&self) -> &str {
        &self.template
    }

    async fn execute(
        &self,
        _ctx: &QueryContext,
        params: &[RowValues],
    ) -> Result<ExecResult, SessionDbError> {
        self.state.counters.executes.fetch_add(1, Ordering::AcqRel);
        self.state.dispatch(&self.template, params)?;
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: None,
        })
    }

    async fn query(
        &self,
        _ctx: &QueryContext,
        params: &[RowValues],
    ) -> Result<ResultSet, SessionDbError> {
        self.state.counters.queries.fetch_add(1, Ordering::AcqRel);
        self.state.dispatch(&self.template, params)?;
        Ok(MockState::rows(&self.template, params))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.counters.closes.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Transaction handed out by [`MockPool`]; shares its counters.
#[derive(Debug)]
pub struct MockTx {
    pool: MockPool,
    finished: AtomicBool,
}

impl MockTx {
    fn live(&self) -> Result<&MockState, SessionDbError> {
        if self.finished.load(Ordering::Acquire) {
            Err(SessionDbError::InvalidTransaction)
        } else {
            Ok(&self.pool.state)
        }
    }

    fn finish(&self) -> Result<(), SessionDbError> {
        if self.finished.swap(true, Ordering::AcqRel) {
            Err(SessionDbError::InvalidTransaction)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ConnPool for MockTx {
    async fn execute(
        &self,
        _ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ExecResult, SessionDbError> {
        let state = self.live()?;
        state.counters.tx_executes.fetch_add(1, Ordering::AcqRel);
        state.dispatch(sql, params)?;
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: None,
        })
    }

    async fn query(
        &self,
        _ctx: &QueryContext,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SessionDbError> {
        let state = self.live()?;
        state.counters.queries.fetch_add(1, Ordering::AcqRel);
        state.dispatch(sql, params)?;
        Ok(MockState::rows(sql, params))
    }

    fn as_preparer(&self) -> Option<&dyn Preparer> {
        Some(self)
    }

    fn as_db_connector(&self) -> Option<&dyn DbConnector> {
        Some(self)
    }
}

#[async_trait]
impl Preparer for MockTx {
    async fn prepare(
        &self,
        _ctx: &QueryContext,
        template: &str,
    ) -> Result<Arc<dyn PreparedHandle>, SessionDbError> {
        self.live()?;
        self.pool.compile(template).await
    }
}

#[async_trait]
impl Tx for MockTx {
    async fn commit(&self) -> Result<(), SessionDbError> {
        self.finish()?;
        self.pool.state.counters.commits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), SessionDbError> {
        self.finish()?;
        self.pool
            .state
            .counters
            .rollbacks
            .fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn execute_prepared(
        &self,
        ctx: &QueryContext,
        stmt: &dyn PreparedHandle,
        params: &[RowValues],
    ) -> Result<ExecResult, SessionDbError> {
        self.execute(ctx, stmt.template(), params).await
    }

    async fn query_prepared(
        &self,
        ctx: &QueryContext,
        stmt: &dyn PreparedHandle,
        params: &[RowValues],
    ) -> Result<ResultSet, SessionDbError> {
        self.query(ctx, stmt.template(), params).await
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl DbConnector for MockTx {
    fn db_conn(&self) -> Option<Arc<dyn ConnPool>> {
        Some(Arc::new(self.pool.clone()))
    }
}

/// Dialector whose `connect` hands out a shared [`MockPool`].
#[derive(Debug, Clone, Default)]
pub struct MockDialector {
    pool: MockPool,
    refuse: bool,
}

impl MockDialector {
    #[must_use]
    pub fn new(pool: MockPool) -> Self {
        Self {
            pool,
            refuse: false,
        }
    }

    /// A dialector whose `connect` always fails.
    #[must_use]
    pub fn refusing() -> Self {
        Self {
            pool: MockPool::new(),
            refuse: true,
        }
    }
}

#[async_trait]
impl Dialector for MockDialector {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self, _config: &Config) -> Result<Arc<dyn ConnPool>, SessionDbError> {
        if self.refuse {
            return Err(SessionDbError::ConnectionError("mock refused connection".into()));
        }
        Ok(Arc::new(self.pool.clone()))
    }
}
