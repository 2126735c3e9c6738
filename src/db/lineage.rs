use std::fmt;
use std::sync::{Arc, OnceLock};

use super::dialector::Dialector;
use super::plugin::PluginRegistry;
use crate::config::Config;
use crate::pool::ConnPool;
use crate::prepared::PreparedPool;

/// Long-lived resources shared by every handle opened from one root.
pub(crate) struct Lineage {
    pub(crate) dialector: Arc<dyn Dialector>,
    pub(crate) pool: Arc<dyn ConnPool>,
    pub(crate) plugins: PluginRegistry,
    /// Config the root was opened with.
    pub(crate) config: Arc<Config>,
    prepared: OnceLock<Arc<PreparedPool>>,
}

impl Lineage {
    pub(crate) fn new(
        dialector: Arc<dyn Dialector>,
        pool: Arc<dyn ConnPool>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            dialector,
            pool,
            plugins: PluginRegistry::default(),
            config,
            prepared: OnceLock::new(),
        }
    }

    /// The lineage's prepared pool, created on first use with `config`'s
    /// cache limits and reused by every later derivation.
    pub(crate) fn prepared_pool(&self, config: &Config) -> &Arc<PreparedPool> {
        self.prepared.get_or_init(|| {
            Arc::new(PreparedPool::new(
                Arc::clone(&self.pool),
                config.prepare_stmt_max_size,
                config.prepare_stmt_ttl,
            ))
        })
    }

    pub(crate) fn existing_prepared_pool(&self) -> Option<&Arc<PreparedPool>> {
        self.prepared.get()
    }
}

impl fmt::Debug for Lineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lineage")
            .field("dialector", &self.dialector.name())
            .field("plugins", &self.plugins.names())
            .field("prepared", &self.prepared.get().map(|p| p.store().len()))
            .finish_non_exhaustive()
    }
}
