//! Concurrent cache of compiled statements keyed by query template.
//!
//! Lookups take the read half of one `RwLock`; inserts and evictions take the
//! write half. Compilation itself happens outside the lock: the writer
//! inserts a not-yet-compiled entry and every caller that finds it awaits the
//! same single-flight cell, so a template is compiled at most once per scope
//! no matter how many callers race for it.
//!
//! Entries compiled inside a transaction live in their own slot next to the
//! pool-level entry for the same template. Neither ever replaces the other.
//!
//! Hits only `peek` the LRU list and stamp the entry. When the store is full,
//! the writer walks from the cold end: an entry stamped since it was last
//! ordered is promoted, the first one that was not is evicted.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::SessionDbError;
use crate::pool::{PreparedHandle, Preparer, QueryContext};

/// Default time-to-live for cached statements.
pub const DEFAULT_STMT_TTL: Duration = Duration::from_secs(60 * 60);

type Compiled = Result<Arc<dyn PreparedHandle>, Arc<SessionDbError>>;

type Key = (Arc<str>, Scope);

type Entries = LruCache<Key, Arc<CompiledStatement>>;

/// Which slot of a template an entry occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Pool,
    Transaction,
}

impl Scope {
    #[must_use]
    pub fn from_in_transaction(in_transaction: bool) -> Self {
        if in_transaction {
            Scope::Transaction
        } else {
            Scope::Pool
        }
    }
}

/// A cached statement: the driver handle or the compile failure, tagged with
/// the scope it was compiled in.
pub struct CompiledStatement {
    id: u64,
    template: Arc<str>,
    in_transaction: bool,
    created_at: Instant,
    last_used: AtomicU64,
    // stamp of the last time the LRU list moved this entry; written under the write lock
    ordered_at: AtomicU64,
    prepared: OnceCell<Compiled>,
    closed: AtomicBool,
}

impl CompiledStatement {
    fn new(id: u64, template: Arc<str>, in_transaction: bool, tick: u64) -> Self {
        Self {
            id,
            template,
            in_transaction,
            created_at: Instant::now(),
            last_used: AtomicU64::new(tick),
            ordered_at: AtomicU64::new(tick),
            prepared: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Store-unique id; two lookups returning the same id got the same entry.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn template(&self) -> &str {
        &self.template
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The compiled driver handle.
    ///
    /// # Errors
    /// Returns the cached compile failure, or an execution error if the
    /// statement was released or is still compiling.
    pub fn handle(&self) -> Result<&Arc<dyn PreparedHandle>, SessionDbError> {
        if self.is_closed() {
            return Err(SessionDbError::ExecutionError(format!(
                "statement `{}` has been closed",
                self.template
            )));
        }
        match self.prepared.get() {
            Some(Ok(handle)) => Ok(handle),
            Some(Err(err)) => Err(SessionDbError::shared(err, &self.template)),
            None => Err(SessionDbError::ExecutionError(format!(
                "statement `{}` is still being prepared",
                self.template
            ))),
        }
    }

    fn key(&self) -> Key {
        (
            Arc::clone(&self.template),
            Scope::from_in_transaction(self.in_transaction),
        )
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }

    /// Used since the LRU list last moved it.
    fn has_pending_use(&self) -> bool {
        self.last_used.load(Ordering::Relaxed) > self.ordered_at.load(Ordering::Relaxed)
    }

    fn compile_failed_bad_conn(&self) -> bool {
        matches!(self.prepared.get(), Some(Err(err)) if err.is_bad_conn())
    }

    fn release(&self) {
        if !self.closed.swap(true, Ordering::AcqRel)
            && let Some(Ok(handle)) = self.prepared.get()
        {
            handle.close();
        }
    }
}

impl Drop for CompiledStatement {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for CompiledStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledStatement")
            .field("id", &self.id)
            .field("template", &self.template)
            .field("in_transaction", &self.in_transaction)
            .field("compiled", &self.prepared.initialized())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn oldest_expired(entries: &Entries, ttl: Duration) -> bool {
    entries
        .peek_lru()
        .is_some_and(|(_, stmt)| stmt.is_expired(ttl))
}

/// Counters exposed for observability and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub compiles: u64,
    pub evictions: u64,
    pub len: usize,
}

/// Bounded LRU + TTL cache from template to [`CompiledStatement`].
pub struct StatementStore {
    inner: RwLock<Entries>,
    max_size: usize,
    ttl: Duration,
    clock: AtomicU64,
    next_id: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    compiles: AtomicU64,
    evictions: AtomicU64,
}

impl StatementStore {
    /// `max_size == 0` means unbounded; a zero `ttl` falls back to [`DEFAULT_STMT_TTL`].
    #[must_use]
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(LruCache::unbounded()),
            max_size: if max_size == 0 { usize::MAX } else { max_size },
            ttl: if ttl.is_zero() { DEFAULT_STMT_TTL } else { ttl },
            clock: AtomicU64::new(1),
            next_id: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            compiles: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached statement for `template` in the caller's scope,
    /// compiling it against `conn` on a miss.
    ///
    /// A cached compile failure is returned as-is and never retried until the
    /// entry is evicted.
    ///
    /// # Errors
    /// Returns [`SessionDbError::Prepare`] when compilation failed (now or earlier).
    pub async fn get_or_compile(
        &self,
        ctx: &QueryContext,
        template: &str,
        conn: &dyn Preparer,
        in_transaction: bool,
    ) -> Result<Arc<CompiledStatement>, SessionDbError> {
        let scope = Scope::from_in_transaction(in_transaction);
        let key: Key = (Arc::from(template), scope);

        let hit = self.live(&self.read(), &key);
        if let Some(stmt) = hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(template, ?scope, id = stmt.id, "statement cache hit");
            return self.ready(stmt, ctx, conn).await;
        }

        let stmt = {
            let mut entries = self.write();
            if let Some(stmt) = self.live(&entries, &key) {
                // a concurrent writer inserted it between our two lock phases
                self.hits.fetch_add(1, Ordering::Relaxed);
                stmt
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.insert(&mut entries, key)
            }
        };

        self.ready(stmt, ctx, conn).await
    }

    /// Remove every entry for `template`, in both scopes. No-op if absent.
    pub fn evict(&self, template: &str) {
        let template: Arc<str> = Arc::from(template);
        let removed: Vec<_> = {
            let mut entries = self.write();
            [Scope::Pool, Scope::Transaction]
                .into_iter()
                .filter_map(|scope| entries.pop(&(Arc::clone(&template), scope)))
                .collect()
        };
        if !removed.is_empty() {
            debug!(template = %template, count = removed.len(), "evicting statement");
        }
        self.release_all(removed);
    }

    /// Drop `stmt` only if it is still the entry in its slot.
    pub(crate) fn evict_entry(&self, stmt: &Arc<CompiledStatement>) {
        let key = stmt.key();
        let removed = {
            let mut entries = self.write();
            let current = entries
                .peek(&key)
                .is_some_and(|cur| Arc::ptr_eq(cur, stmt));
            if current { entries.pop(&key) } else { None }
        };
        if removed.is_none() {
            debug!(template = %stmt.template, id = stmt.id, "entry already replaced");
        }
        self.release_all(removed);
    }

    /// Release every entry. The store stays usable; later calls recompile.
    pub fn close_all(&self) {
        let removed: Vec<_> = {
            let mut entries = self.write();
            std::iter::from_fn(|| entries.pop_lru().map(|(_, stmt)| stmt)).collect()
        };
        debug!(count = removed.len(), "closing all cached statements");
        self.release_all(removed);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached templates, most recently ordered first, each listed once.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let entries = self.read();
        let mut seen = HashSet::new();
        entries
            .iter()
            .filter(|((template, _), _)| seen.insert(Arc::clone(template)))
            .map(|((template, _), _)| template.to_string())
            .collect()
    }

    #[must_use]
    pub fn contains(&self, template: &str, in_transaction: bool) -> bool {
        let key: Key = (
            Arc::from(template),
            Scope::from_in_transaction(in_transaction),
        );
        self.read()
            .peek(&key)
            .is_some_and(|stmt| !stmt.is_expired(self.ttl))
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compiles: self.compiles.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len: self.len(),
        }
    }

    fn live(&self, entries: &Entries, key: &Key) -> Option<Arc<CompiledStatement>> {
        let stmt = entries.peek(key)?;
        if stmt.is_expired(self.ttl) {
            return None;
        }
        stmt.last_used.store(self.tick(), Ordering::Relaxed);
        Some(Arc::clone(stmt))
    }

    fn insert(&self, entries: &mut Entries, key: Key) -> Arc<CompiledStatement> {
        let mut removed = Vec::new();
        // an expired entry in this slot is replaced, not counted against capacity
        removed.extend(entries.pop(&key));
        while oldest_expired(entries, self.ttl) {
            removed.extend(entries.pop_lru().map(|(_, stmt)| stmt));
        }
        while entries.len() >= self.max_size {
            let Some((cold, stmt)) = entries.peek_lru() else {
                break;
            };
            if stmt.has_pending_use() {
                stmt.ordered_at
                    .store(stmt.last_used.load(Ordering::Relaxed), Ordering::Relaxed);
                let cold = cold.clone();
                entries.promote(&cold);
            } else {
                removed.extend(entries.pop_lru().map(|(_, stmt)| stmt));
            }
        }

        let stmt = Arc::new(CompiledStatement::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            Arc::clone(&key.0),
            key.1 == Scope::Transaction,
            self.tick(),
        ));
        removed.extend(entries.put(key, Arc::clone(&stmt)));

        if !removed.is_empty() {
            self.release_all(removed);
        }
        stmt
    }

    async fn ready(
        &self,
        stmt: Arc<CompiledStatement>,
        ctx: &QueryContext,
        conn: &dyn Preparer,
    ) -> Result<Arc<CompiledStatement>, SessionDbError> {
        let compiled = stmt
            .prepared
            .get_or_init(|| async {
                self.compiles.fetch_add(1, Ordering::Relaxed);
                debug!(template = %stmt.template, id = stmt.id, "compiling statement");
                conn.prepare(ctx, &stmt.template)
                    .await
                    .map_err(|err| Arc::new(SessionDbError::prepare(&stmt.template, err)))
            })
            .await;

        match compiled {
            Ok(handle) => {
                // evicted while compiling
                if stmt.is_closed() {
                    handle.close();
                }
                Ok(stmt)
            }
            Err(err) => {
                if stmt.compile_failed_bad_conn() {
                    warn!(template = %stmt.template, "connection broke while preparing; dropping entry");
                    self.evict_entry(&stmt);
                }
                Err(SessionDbError::shared(err, &stmt.template))
            }
        }
    }

    fn release_all(&self, removed: impl IntoIterator<Item = Arc<CompiledStatement>>) {
        for stmt in removed {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            stmt.release();
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for StatementStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementStore")
            .field("max_size", &self.max_size)
            .field("ttl", &self.ttl)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::ResultSet;
    use crate::types::{ExecResult, RowValues};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct Handle {
        sql: String,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PreparedHandle for Handle {
        fn template(&self) -> &str {
            &self.sql
        }

        async fn execute(
            &self,
            _ctx: &QueryContext,
            _params: &[RowValues],
        ) -> Result<ExecResult, SessionDbError> {
            Ok(ExecResult::default())
        }

        async fn query(
            &self,
            _ctx: &QueryContext,
            _params: &[RowValues],
        ) -> Result<ResultSet, SessionDbError> {
            Ok(ResultSet::default())
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Counting {
        compiles: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Preparer for Counting {
        async fn prepare(
            &self,
            _ctx: &QueryContext,
            template: &str,
        ) -> Result<Arc<dyn PreparedHandle>, SessionDbError> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            if template.contains("broken") {
                return Err(SessionDbError::ExecutionError("syntax error".into()));
            }
            if template.contains("dead") {
                return Err(SessionDbError::BadConnection("socket closed".into()));
            }
            Ok(Arc::new(Handle {
                sql: template.to_owned(),
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    #[tokio::test]
    async fn repeated_lookups_share_one_compile() {
        let store = StatementStore::new(10, DEFAULT_STMT_TTL);
        let conn = Counting::default();
        let ctx = QueryContext::new();

        let a = store.get_or_compile(&ctx, "SELECT 1", &conn, false).await.unwrap();
        let b = store.get_or_compile(&ctx, "SELECT 1", &conn, false).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(conn.compiles.load(Ordering::SeqCst), 1);
        let stats = store.stats();
        assert_eq!((stats.hits, stats.misses, stats.compiles), (1, 1, 1));
    }

    #[tokio::test]
    async fn compile_failure_is_cached() {
        let store = StatementStore::new(10, DEFAULT_STMT_TTL);
        let conn = Counting::default();
        let ctx = QueryContext::new();

        for _ in 0..3 {
            let err = store
                .get_or_compile(&ctx, "SELEC broken", &conn, false)
                .await
                .unwrap_err();
            assert!(matches!(err, SessionDbError::Prepare { .. }));
        }
        assert_eq!(conn.compiles.load(Ordering::SeqCst), 1);
        assert!(store.contains("SELEC broken", false));
    }

    #[tokio::test]
    async fn bad_conn_during_compile_is_not_cached() {
        let store = StatementStore::new(10, DEFAULT_STMT_TTL);
        let conn = Counting::default();
        let ctx = QueryContext::new();

        assert!(store.get_or_compile(&ctx, "dead", &conn, false).await.is_err());
        assert!(store.get_or_compile(&ctx, "dead", &conn, false).await.is_err());
        assert_eq!(conn.compiles.load(Ordering::SeqCst), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn scopes_are_tracked_separately() {
        let store = StatementStore::new(10, DEFAULT_STMT_TTL);
        let conn = Counting::default();
        let ctx = QueryContext::new();

        let outside = store.get_or_compile(&ctx, "SELECT 1", &conn, false).await.unwrap();
        let inside = store.get_or_compile(&ctx, "SELECT 1", &conn, true).await.unwrap();
        let again = store.get_or_compile(&ctx, "SELECT 1", &conn, false).await.unwrap();

        assert_ne!(outside.id(), inside.id());
        assert!(inside.in_transaction());
        assert_eq!(outside.id(), again.id());
        assert_eq!(store.len(), 2);
        assert_eq!(conn.compiles.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lru_entry_goes_first() {
        let store = StatementStore::new(2, DEFAULT_STMT_TTL);
        let conn = Counting::default();
        let ctx = QueryContext::new();

        store.get_or_compile(&ctx, "a", &conn, false).await.unwrap();
        store.get_or_compile(&ctx, "b", &conn, false).await.unwrap();
        // touch `a` so `b` becomes least recently used
        store.get_or_compile(&ctx, "a", &conn, false).await.unwrap();
        store.get_or_compile(&ctx, "c", &conn, false).await.unwrap();

        assert!(store.contains("a", false));
        assert!(!store.contains("b", false));
        assert!(store.contains("c", false));
        assert_eq!(conn.closed.load(Ordering::SeqCst), 1);
        assert_eq!(store.stats().evictions, 1);
    }

    #[tokio::test]
    async fn expired_entries_recompile() {
        let store = StatementStore::new(10, Duration::from_millis(20));
        let conn = Counting::default();
        let ctx = QueryContext::new();

        let first = store.get_or_compile(&ctx, "a", &conn, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = store.get_or_compile(&ctx, "a", &conn, false).await.unwrap();

        assert_ne!(first.id(), second.id());
        assert!(first.is_closed());
        assert_eq!(conn.compiles.load(Ordering::SeqCst), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn unused_entry_is_evicted_before_hit_ones() {
        let store = StatementStore::new(3, DEFAULT_STMT_TTL);
        let conn = Counting::default();
        let ctx = QueryContext::new();

        for template in ["a", "b", "c"] {
            store.get_or_compile(&ctx, template, &conn, false).await.unwrap();
        }
        store.get_or_compile(&ctx, "b", &conn, false).await.unwrap();
        store.get_or_compile(&ctx, "a", &conn, false).await.unwrap();
        store.get_or_compile(&ctx, "d", &conn, false).await.unwrap();

        assert!(!store.contains("c", false));
        for template in ["a", "b", "d"] {
            assert!(store.contains(template, false), "{template} should stay");
        }
        assert_eq!(store.stats().evictions, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_trimmed_on_insert() {
        let store = StatementStore::new(0, Duration::from_millis(20));
        let conn = Counting::default();
        let ctx = QueryContext::new();

        let a = store.get_or_compile(&ctx, "a", &conn, false).await.unwrap();
        let b = store.get_or_compile(&ctx, "b", &conn, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        store.get_or_compile(&ctx, "c", &conn, false).await.unwrap();

        assert!(a.is_closed() && b.is_closed());
        assert_eq!(store.len(), 1);
        assert_eq!(store.keys(), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn stale_entry_eviction_spares_its_replacement() {
        let store = StatementStore::new(10, DEFAULT_STMT_TTL);
        let conn = Counting::default();
        let ctx = QueryContext::new();

        let old = store.get_or_compile(&ctx, "a", &conn, false).await.unwrap();
        store.evict("a");
        let fresh = store.get_or_compile(&ctx, "a", &conn, false).await.unwrap();

        store.evict_entry(&old);
        assert!(!fresh.is_closed());
        assert!(store.contains("a", false));

        store.evict_entry(&fresh);
        assert!(fresh.is_closed());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn evict_and_close_all() {
        let store = StatementStore::new(10, DEFAULT_STMT_TTL);
        let conn = Counting::default();
        let ctx = QueryContext::new();

        let a = store.get_or_compile(&ctx, "a", &conn, false).await.unwrap();
        store.get_or_compile(&ctx, "a", &conn, true).await.unwrap();
        store.get_or_compile(&ctx, "b", &conn, false).await.unwrap();

        store.evict("a");
        store.evict("a");
        assert!(a.is_closed());
        assert!(a.handle().is_err());
        assert_eq!(store.len(), 1);

        store.close_all();
        assert!(store.is_empty());
        store.get_or_compile(&ctx, "b", &conn, false).await.unwrap();
        assert_eq!(conn.compiles.load(Ordering::SeqCst), 4);
    }
}
