use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::debug;

use super::Db;
use crate::error::SessionDbError;

/// Extension installed once per lineage.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Called once, with a root handle of the lineage it is registered on.
    async fn initialize(&self, db: &Db) -> Result<(), SessionDbError>;
}

/// Registered plugins by name. `None` marks a name whose initialisation is
/// still running, so a concurrent registration of it fails too.
#[derive(Default)]
pub(crate) struct PluginRegistry {
    plugins: RwLock<HashMap<String, Option<Arc<dyn Plugin>>>>,
}

impl PluginRegistry {
    pub(crate) async fn register(
        &self,
        plugin: Arc<dyn Plugin>,
        db: &Db,
    ) -> Result<(), SessionDbError> {
        let name = plugin.name().to_owned();
        {
            let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
            if plugins.contains_key(&name) {
                return Err(SessionDbError::PluginRegistered(name));
            }
            plugins.insert(name.clone(), None);
        }

        if let Err(err) = plugin.initialize(db).await {
            self.plugins
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&name);
            return Err(SessionDbError::PluginInit {
                name,
                source: Box::new(err),
            });
        }

        debug!(plugin = %name, "plugin registered");
        self.plugins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Some(plugin));
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .and_then(Clone::clone)
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let plugins = self.plugins.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = plugins
            .iter()
            .filter(|(_, plugin)| plugin.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
