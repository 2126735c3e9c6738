//! The user-facing handle.
//!
//! A [`Db`] bundles the lineage's shared resources (raw pool, plugins, the
//! lazily created prepared pool), a by-value [`Config`], the request object
//! it currently works on, and the errors recorded on it so far. Cloning a
//! `Db` is cheap and shares the request object; use [`Db::session`] to get a
//! handle whose request state is isolated.

mod dialector;
mod finisher;
mod lineage;
mod plugin;

pub use dialector::{explain_positional, Dialector, ErrorTranslator};
pub use finisher::QUERY_CLAUSES;
pub use plugin::Plugin;

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::NaiveDateTime;
use tracing::{debug, error, warn};

use crate::clause::ClauseInterface;
use crate::config::Config;
use crate::error::SessionDbError;
use crate::logging::SqlLogLevel;
use crate::pool::{ConnPool, ConnTarget, QueryContext};
use crate::prepared::PreparedTx;
use crate::session::{
    lock, plan_derivation, DeriveFlags, Generation, SharedStatement, Statement, StatementPlan,
};
use crate::stmt_store::StatementStore;
use lineage::Lineage;

#[derive(Clone)]
pub struct Db {
    config: Arc<Config>,
    lineage: Arc<Lineage>,
    statement: SharedStatement,
    error: Option<Arc<SessionDbError>>,
    generation: Generation,
}

impl Db {
    /// Connect through `dialector` and build the root handle.
    ///
    /// With `prepare_stmt` the root dispatches through the lineage's
    /// prepared pool. The pool is pinged unless `disable_automatic_ping`;
    /// plugins from the config are installed last.
    ///
    /// # Errors
    /// Returns the dialector's connect error, the ping failure, or a plugin
    /// registration error.
    pub async fn open<D>(dialector: D, mut config: Config) -> Result<Db, SessionDbError>
    where
        D: Dialector + 'static,
    {
        let dialector: Arc<dyn Dialector> = Arc::new(dialector);
        let pool = dialector.connect(&config).await.inspect_err(|err| {
            error!(dialector = dialector.name(), error = %err, "failed to initialize database");
        })?;

        if config.translate_error && dialector.as_error_translator().is_none() {
            warn!(
                dialector = dialector.name(),
                "translate_error is enabled but the dialector does not translate errors"
            );
        }

        let plugins = std::mem::take(&mut config.plugins);
        let lineage = Arc::new(Lineage::new(dialector, pool, Arc::new(config)));
        let db = Db::root(&lineage);

        if !db.config.disable_automatic_ping {
            db.target().ping().await.inspect_err(|err| {
                error!(error = %err, "failed to ping database");
            })?;
        }

        for plugin in plugins {
            db.use_plugin(plugin).await?;
        }

        debug!(
            dialector = db.lineage.dialector.name(),
            prepare_stmt = db.config.prepare_stmt,
            "database opened"
        );
        Ok(db)
    }

    /// A root handle over `lineage`: the config it was opened with, its
    /// pool, and a request object of its own.
    fn root(lineage: &Arc<Lineage>) -> Db {
        let config = Arc::clone(&lineage.config);
        let target = if config.prepare_stmt {
            ConnTarget::Prepared(Arc::clone(lineage.prepared_pool(&config)))
        } else {
            ConnTarget::Pool(Arc::clone(&lineage.pool))
        };
        Db {
            config,
            lineage: Arc::clone(lineage),
            statement: Arc::new(Mutex::new(Statement::new(target, QueryContext::new()))),
            error: None,
            generation: Generation::Root,
        }
    }

    /// Derive a handle with session overrides.
    #[must_use]
    pub fn session(&self, flags: DeriveFlags) -> Db {
        let mut config = (*self.config).clone();
        apply_overrides(&mut config, &flags);

        let (generation, plan) = plan_derivation(self.generation, &flags);
        let derived = {
            let parent = lock(&self.statement);
            match plan {
                StatementPlan::Share => None,
                StatementPlan::Fresh => Some(parent.fresh(config.propagate_unscoped)),
                StatementPlan::Copy => Some(parent.copy()),
            }
        };

        let statement = match derived {
            None => Arc::clone(&self.statement),
            Some(mut stmt) => {
                if let Some(context) = &flags.context {
                    stmt.context = context.clone();
                }
                if flags.prepare_stmt {
                    stmt.target = self.prepared_target(&stmt.target, &config);
                    config.prepare_stmt = true;
                }
                if flags.skip_hooks {
                    stmt.skip_hooks = true;
                }
                Arc::new(Mutex::new(stmt))
            }
        };

        let tx = Db {
            config: Arc::new(config),
            lineage: Arc::clone(&self.lineage),
            statement,
            error: self.error.clone(),
            generation,
        };
        if flags.initialized { tx.instance() } else { tx }
    }

    /// Handle for one operation: a fresh request object when called on a
    /// root, otherwise this handle's own.
    #[must_use]
    pub fn instance(&self) -> Db {
        match self.generation {
            Generation::Root => self.session(DeriveFlags::default()),
            Generation::SharedClone | Generation::IsolatedClone => self.clone(),
        }
    }

    #[must_use]
    pub fn with_context(&self, context: QueryContext) -> Db {
        self.session(DeriveFlags::with_context(context))
    }

    /// Derived handle that logs its SQL at `Info`.
    #[must_use]
    pub fn debug(&self) -> Db {
        self.instance().session(DeriveFlags {
            sql_log: Some(SqlLogLevel::Info),
            ..DeriveFlags::default()
        })
    }

    /// Store a per-operation value.
    #[must_use]
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) -> Db {
        let tx = self.instance();
        lock(&tx.statement).set(key, Arc::new(value));
        tx
    }

    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let setting = lock(&self.statement).get(key).cloned()?;
        setting.downcast::<T>().ok()
    }

    /// Store a value visible only to this request object, not to copies of it.
    #[must_use]
    pub fn instance_set<T: Any + Send + Sync>(&self, key: &str, value: T) -> Db {
        let tx = self.instance();
        {
            let mut stmt = lock(&tx.statement);
            let key = stmt.instance_key(key);
            stmt.set(key, Arc::new(value));
        }
        tx
    }

    #[must_use]
    pub fn instance_get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let setting = {
            let stmt = lock(&self.statement);
            stmt.get(&stmt.instance_key(key)).cloned()?
        };
        setting.downcast::<T>().ok()
    }

    /// Merge a clause into a request object of this handle's operation.
    #[must_use]
    pub fn add_clause<C: ClauseInterface>(&self, clause: C) -> Db {
        let tx = self.instance();
        lock(&tx.statement).add_clause(clause);
        tx
    }

    /// Record `err`, chaining it after any earlier failure, and return the
    /// accumulated error.
    pub fn add_error(&mut self, err: SessionDbError) -> Arc<SessionDbError> {
        let err = match self.lineage.dialector.as_error_translator() {
            Some(translator) if self.config.translate_error => translator.translate(err),
            _ => err,
        };
        let next = match self.error.take() {
            None => err,
            Some(previous) => SessionDbError::Accumulated {
                previous: previous.to_string(),
                source: Box::new(err),
            },
        };
        let next = Arc::new(next);
        self.error = Some(Arc::clone(&next));
        next
    }

    #[must_use]
    pub fn error(&self) -> Option<&SessionDbError> {
        self.error.as_deref()
    }

    /// # Errors
    /// Returns the accumulated error, if any was recorded.
    pub fn result(&self) -> Result<(), Arc<SessionDbError>> {
        match &self.error {
            Some(err) => Err(Arc::clone(err)),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn rows_affected(&self) -> u64 {
        lock(&self.statement).rows_affected
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// The request object this handle works on.
    #[must_use]
    pub fn statement(&self) -> &SharedStatement {
        &self.statement
    }

    /// True if both handles work on the same request object.
    #[must_use]
    pub fn shares_statement_with(&self, other: &Db) -> bool {
        Arc::ptr_eq(&self.statement, &other.statement)
    }

    #[must_use]
    pub fn target(&self) -> ConnTarget {
        lock(&self.statement).target.clone()
    }

    #[must_use]
    pub fn context(&self) -> QueryContext {
        lock(&self.statement).context.clone()
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        lock(&self.statement).target.in_transaction()
    }

    #[must_use]
    pub fn dialector(&self) -> &dyn Dialector {
        self.lineage.dialector.as_ref()
    }

    #[must_use]
    pub fn now(&self) -> NaiveDateTime {
        self.config.now()
    }

    /// The underlying raw pool, whatever target is currently bound.
    ///
    /// # Errors
    /// Returns [`SessionDbError::InvalidDb`] if no pool is reachable.
    pub fn db(&self) -> Result<Arc<dyn ConnPool>, SessionDbError> {
        self.target().db_conn().ok_or(SessionDbError::InvalidDb)
    }

    /// # Errors
    /// Returns the driver's ping failure.
    pub async fn ping(&self) -> Result<(), SessionDbError> {
        self.db()?.ping().await
    }

    /// The lineage's statement cache, once prepare mode has been used.
    #[must_use]
    pub fn statement_cache(&self) -> Option<Arc<StatementStore>> {
        self.lineage
            .existing_prepared_pool()
            .map(|pool| Arc::clone(pool.store()))
    }

    /// Register and initialise `plugin` for the whole lineage. Initialisation
    /// runs on a root handle, whatever handle this is called on.
    ///
    /// # Errors
    /// Returns [`SessionDbError::PluginRegistered`] for a name already taken,
    /// or [`SessionDbError::PluginInit`] if initialisation fails. Neither
    /// changes the registry.
    pub async fn use_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), SessionDbError> {
        let root = Db::root(&self.lineage);
        self.lineage.plugins.register(plugin, &root).await
    }

    #[must_use]
    pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.lineage.plugins.get(name)
    }

    #[must_use]
    pub fn plugin_names(&self) -> Vec<String> {
        self.lineage.plugins.names()
    }

    /// Release every statement cached for this lineage. Connections go back
    /// to the driver once the last handle is dropped.
    pub fn close(&self) {
        if let Some(pool) = self.lineage.existing_prepared_pool() {
            pool.close();
        }
        debug!(dialector = self.lineage.dialector.name(), "database closed");
    }

    fn prepared_target(&self, current: &ConnTarget, config: &Config) -> ConnTarget {
        let prepared = self.lineage.prepared_pool(config);
        match current {
            ConnTarget::Pool(_) => ConnTarget::Prepared(Arc::clone(prepared)),
            ConnTarget::Tx(tx) => ConnTarget::PreparedTx(Arc::new(PreparedTx::new(
                Arc::clone(prepared),
                Arc::clone(tx),
            ))),
            ConnTarget::Prepared(_) | ConnTarget::PreparedTx(_) => current.clone(),
        }
    }
}

fn apply_overrides(config: &mut Config, flags: &DeriveFlags) {
    if flags.create_batch_size > 0 {
        config.create_batch_size = flags.create_batch_size;
    }
    if flags.skip_default_transaction {
        config.skip_default_transaction = true;
    }
    if flags.allow_global_update {
        config.allow_global_update = true;
    }
    if flags.full_save_associations {
        config.full_save_associations = true;
    }
    if flags.propagate_unscoped {
        config.propagate_unscoped = true;
    }
    if flags.disable_nested_transaction {
        config.disable_nested_transaction = true;
    }
    if flags.dry_run {
        config.dry_run = true;
    }
    if flags.query_fields {
        config.query_fields = true;
    }
    if let Some(level) = flags.sql_log {
        config.sql_log = level;
    }
    if let Some(now_fn) = &flags.now_fn {
        config.now_fn = Arc::clone(now_fn);
    }
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("generation", &self.generation)
            .field("statement", &*lock(&self.statement))
            .field("error", &self.error)
            .field("lineage", &self.lineage)
            .finish_non_exhaustive()
    }
}
