//! Plugin registry mapping a plugin id to its factory.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{TransferError, TransferResult};
use crate::local::LocalPlugin;
use crate::plugin::{Connection, Plugin};
use crate::settings::ConnectionConfig;

/// Explicitly constructed set of known plugins.
///
/// Each registry is independent, so tests and embedders can hold several with
/// different plugin sets in one process.
#[derive(Debug, Default, Clone)]
pub struct PluginRegistry {
    plugins: BTreeMap<&'static str, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in plugins (`local`).
    pub fn with_builtin_plugins() -> Self {
        let mut registry = Self::new();
        registry.plugins.insert(LocalPlugin::new().id(), Arc::new(LocalPlugin::new()));
        registry
    }

    /// Register a plugin. Fails if the id is taken.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> TransferResult<()> {
        let id = plugin.id();
        if self.plugins.contains_key(id) {
            return Err(TransferError::DuplicatePlugin { id: id.to_string() });
        }
        debug!(plugin = id, "Registered plugin");
        self.plugins.insert(id, plugin);
        Ok(())
    }

    /// Resolve a plugin by id.
    pub fn get(&self, id: &str) -> TransferResult<Arc<dyn Plugin>> {
        self.plugins
            .get(id)
            .cloned()
            .ok_or_else(|| TransferError::PluginNotFound { id: id.to_string() })
    }

    /// Ids of all registered plugins, sorted.
    pub fn plugin_ids(&self) -> Vec<&'static str> {
        self.plugins.keys().copied().collect()
    }

    /// Resolve the plugin named in `config`, create a connection and init it.
    ///
    /// An unknown plugin id fails before any connection is constructed.
    pub fn connect(&self, config: &ConnectionConfig) -> TransferResult<Box<dyn Connection>> {
        let plugin = self.get(&config.plugin)?;
        let mut connection = plugin.create_connection();
        connection.init(&config.settings)?;
        debug!(plugin = plugin.id(), "Connection initialized");
        Ok(connection)
    }
}
