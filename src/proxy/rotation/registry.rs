//! Name -> strategy factory registry

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{create_selector, ProxySelector, RotationStrategy};
use crate::config::StrategyConfig;
use crate::error::{Result, RotaError};

/// Builds a selector from strategy tunables
pub type SelectorFactory =
    Arc<dyn Fn(&StrategyConfig) -> Result<Arc<dyn ProxySelector>> + Send + Sync>;

/// Thread-safe map from strategy name to factory
///
/// The orchestrator owns its own instance; [`StrategyRegistry::global`] is a
/// process-wide default pre-populated with the built-in strategies.
pub struct StrategyRegistry {
    factories: RwLock<BTreeMap<String, SelectorFactory>>,
}

impl StrategyRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(BTreeMap::new()),
        }
    }

    /// A registry holding every built-in strategy
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_builtins();
        registry
    }

    pub fn global() -> &'static StrategyRegistry {
        static GLOBAL: OnceLock<StrategyRegistry> = OnceLock::new();
        GLOBAL.get_or_init(StrategyRegistry::with_builtins)
    }

    fn register_builtins(&self) {
        let mut factories = self.factories.write();
        for strategy in RotationStrategy::ALL {
            let factory: SelectorFactory =
                Arc::new(move |config: &StrategyConfig| create_selector(strategy, config));
            factories.insert(strategy.as_str().to_string(), factory);
        }
    }

    /// Register a validated factory under `name`
    pub fn register<F>(&self, name: &str, factory: F) -> Result<()>
    where
        F: Fn(&StrategyConfig) -> Result<Arc<dyn ProxySelector>> + Send + Sync + 'static,
    {
        self.register_with(name, Arc::new(factory), true)
    }

    /// Register a factory, optionally skipping validation
    ///
    /// Validation builds one selector from the default tunables and checks it
    /// reports a strategy name. An existing registration is overwritten.
    pub fn register_with(&self, name: &str, factory: SelectorFactory, validate: bool) -> Result<()> {
        let name = normalize(name)?;

        if validate {
            let probe = factory(&StrategyConfig::default()).map_err(|e| {
                RotaError::InvalidArgument(format!(
                    "strategy '{}' failed to build with default config: {}",
                    name, e
                ))
            })?;
            if probe.strategy_name().is_empty() {
                return Err(RotaError::InvalidArgument(format!(
                    "strategy '{}' does not report a strategy name",
                    name
                )));
            }
        }

        if self.factories.write().insert(name.clone(), factory).is_some() {
            warn!(strategy = %name, "Overwriting registered rotation strategy");
        } else {
            debug!(strategy = %name, "Registered rotation strategy");
        }
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.factories.write().remove(&canonical(name)).is_some()
    }

    pub fn get(&self, name: &str) -> Option<SelectorFactory> {
        self.factories.read().get(&canonical(name)).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(&canonical(name))
    }

    /// Build a selector registered under `name`
    pub fn create(&self, name: &str, config: &StrategyConfig) -> Result<Arc<dyn ProxySelector>> {
        let factory = self
            .get(name)
            .ok_or_else(|| RotaError::UnknownStrategy(name.to_string()))?;
        factory(config)
    }

    /// Registered names in sorted order
    pub fn list(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }

    /// Drop custom registrations and restore the built-ins
    pub fn reset(&self) {
        self.factories.write().clear();
        self.register_builtins();
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Built-in aliases resolve to their canonical name
fn canonical(name: &str) -> String {
    match RotationStrategy::from_str(name) {
        Some(strategy) => strategy.as_str().to_string(),
        None => name.trim().to_lowercase(),
    }
}

fn normalize(name: &str) -> Result<String> {
    let name = canonical(name);
    if name.is_empty() {
        return Err(RotaError::InvalidArgument("strategy name must not be empty".to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(RotaError::InvalidArgument(format!(
            "invalid strategy name '{}'",
            name
        )));
    }
    Ok(name)
}
