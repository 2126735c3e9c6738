use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::db::Plugin;
use crate::error::SessionDbError;
use crate::logging::SqlLogLevel;
use crate::stmt_store::DEFAULT_STMT_TTL;

/// Clock used when a handle needs "now".
pub type NowFn = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

fn local_now() -> NowFn {
    Arc::new(|| Local::now().naive_local())
}

/// Options shared by every handle of one lineage.
///
/// Session overrides clone this by value, so scalar changes on a derived
/// handle never leak back to its parent.
#[derive(Clone)]
pub struct Config {
    pub skip_default_transaction: bool,
    /// Applied to transactions begun from a context without its own timeout.
    pub default_transaction_timeout: Option<Duration>,
    pub full_save_associations: bool,
    /// Build SQL without dispatching it.
    pub dry_run: bool,
    /// Route every call through the statement cache.
    pub prepare_stmt: bool,
    pub prepare_stmt_max_size: usize,
    pub prepare_stmt_ttl: Duration,
    pub disable_automatic_ping: bool,
    pub disable_nested_transaction: bool,
    pub allow_global_update: bool,
    pub query_fields: bool,
    pub create_batch_size: usize,
    pub translate_error: bool,
    pub propagate_unscoped: bool,
    pub sql_log: SqlLogLevel,
    pub now_fn: NowFn,
    pub(crate) plugins: Vec<Arc<dyn Plugin>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            skip_default_transaction: false,
            default_transaction_timeout: None,
            full_save_associations: false,
            dry_run: false,
            prepare_stmt: false,
            prepare_stmt_max_size: usize::MAX,
            prepare_stmt_ttl: DEFAULT_STMT_TTL,
            disable_automatic_ping: false,
            disable_nested_transaction: false,
            allow_global_update: false,
            query_fields: false,
            create_batch_size: 0,
            translate_error: false,
            propagate_unscoped: false,
            sql_log: SqlLogLevel::Silent,
            now_fn: local_now(),
            plugins: Vec::new(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load the serialisable option subset from JSON. Durations are milliseconds.
    ///
    /// # Errors
    /// Returns [`SessionDbError::ConfigError`] on malformed input.
    pub fn from_json(json: &str) -> Result<Self, SessionDbError> {
        let file: ConfigFile = serde_json::from_str(json)
            .map_err(|e| SessionDbError::ConfigError(format!("invalid config json: {e}")))?;
        Ok(file.into())
    }

    #[must_use]
    pub fn now(&self) -> NaiveDateTime {
        (self.now_fn)()
    }

    /// Names of plugins installed when the lineage is opened.
    #[must_use]
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_owned()).collect()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("skip_default_transaction", &self.skip_default_transaction)
            .field("default_transaction_timeout", &self.default_transaction_timeout)
            .field("dry_run", &self.dry_run)
            .field("prepare_stmt", &self.prepare_stmt)
            .field("prepare_stmt_max_size", &self.prepare_stmt_max_size)
            .field("prepare_stmt_ttl", &self.prepare_stmt_ttl)
            .field("disable_automatic_ping", &self.disable_automatic_ping)
            .field("disable_nested_transaction", &self.disable_nested_transaction)
            .field("translate_error", &self.translate_error)
            .field("propagate_unscoped", &self.propagate_unscoped)
            .field("sql_log", &self.sql_log)
            .field("plugins", &self.plugin_names())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    skip_default_transaction: bool,
    default_transaction_timeout_ms: Option<u64>,
    full_save_associations: bool,
    dry_run: bool,
    prepare_stmt: bool,
    prepare_stmt_max_size: Option<usize>,
    prepare_stmt_ttl_ms: Option<u64>,
    disable_automatic_ping: bool,
    disable_nested_transaction: bool,
    allow_global_update: bool,
    query_fields: bool,
    create_batch_size: usize,
    translate_error: bool,
    propagate_unscoped: bool,
    sql_log: SqlLogLevel,
}

impl From<ConfigFile> for Config {
    fn from(file: ConfigFile) -> Self {
        let defaults = Config::default();
        Config {
            skip_default_transaction: file.skip_default_transaction,
            default_transaction_timeout: file.default_transaction_timeout_ms.map(Duration::from_millis),
            full_save_associations: file.full_save_associations,
            dry_run: file.dry_run,
            prepare_stmt: file.prepare_stmt,
            prepare_stmt_max_size: file
                .prepare_stmt_max_size
                .filter(|n| *n > 0)
                .unwrap_or(defaults.prepare_stmt_max_size),
            prepare_stmt_ttl: file
                .prepare_stmt_ttl_ms
                .map_or(defaults.prepare_stmt_ttl, Duration::from_millis),
            disable_automatic_ping: file.disable_automatic_ping,
            disable_nested_transaction: file.disable_nested_transaction,
            allow_global_update: file.allow_global_update,
            query_fields: file.query_fields,
            create_batch_size: file.create_batch_size,
            translate_error: file.translate_error,
            propagate_unscoped: file.propagate_unscoped,
            sql_log: file.sql_log,
            ..defaults
        }
    }
}

/// Fluent builder for [`Config`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    #[must_use]
    pub fn prepare_stmt(mut self, enabled: bool) -> Self {
        self.config.prepare_stmt = enabled;
        self
    }

    /// Zero keeps the cache unbounded.
    #[must_use]
    pub fn prepare_stmt_max_size(mut self, max_size: usize) -> Self {
        self.config.prepare_stmt_max_size = if max_size == 0 { usize::MAX } else { max_size };
        self
    }

    #[must_use]
    pub fn prepare_stmt_ttl(mut self, ttl: Duration) -> Self {
        self.config.prepare_stmt_ttl = ttl;
        self
    }

    #[must_use]
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.config.dry_run = enabled;
        self
    }

    #[must_use]
    pub fn skip_default_transaction(mut self, enabled: bool) -> Self {
        self.config.skip_default_transaction = enabled;
        self
    }

    #[must_use]
    pub fn default_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_transaction_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn disable_automatic_ping(mut self, disabled: bool) -> Self {
        self.config.disable_automatic_ping = disabled;
        self
    }

    #[must_use]
    pub fn disable_nested_transaction(mut self, disabled: bool) -> Self {
        self.config.disable_nested_transaction = disabled;
        self
    }

    #[must_use]
    pub fn allow_global_update(mut self, enabled: bool) -> Self {
        self.config.allow_global_update = enabled;
        self
    }

    #[must_use]
    pub fn full_save_associations(mut self, enabled: bool) -> Self {
        self.config.full_save_associations = enabled;
        self
    }

    #[must_use]
    pub fn query_fields(mut self, enabled: bool) -> Self {
        self.config.query_fields = enabled;
        self
    }

    #[must_use]
    pub fn create_batch_size(mut self, size: usize) -> Self {
        self.config.create_batch_size = size;
        self
    }

    #[must_use]
    pub fn translate_error(mut self, enabled: bool) -> Self {
        self.config.translate_error = enabled;
        self
    }

    #[must_use]
    pub fn propagate_unscoped(mut self, enabled: bool) -> Self {
        self.config.propagate_unscoped = enabled;
        self
    }

    #[must_use]
    pub fn sql_log(mut self, level: SqlLogLevel) -> Self {
        self.config.sql_log = level;
        self
    }

    #[must_use]
    pub fn now_fn(mut self, now_fn: NowFn) -> Self {
        self.config.now_fn = now_fn;
        self
    }

    /// Install `plugin` when the handle is opened.
    #[must_use]
    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.config.plugins.push(plugin);
        self
    }

    #[must_use]
    pub fn finish(self) -> Config {
        self.config
    }
}
