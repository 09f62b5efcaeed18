//! Inverse-response-time weighted selection strategy

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;

use super::{eligible_or_empty, ProxySelector};
use crate::config::StrategyConfig;
use crate::error::{Result, RotaError};
use crate::models::{ProxyBackend, SelectionContext};

/// Picks proportionally to `1 / ema_response_time`
///
/// A static weight configured for a backend identity overrides the
/// response-time weight. Backends with no response-time data get weight
/// zero; when every weight is zero the pick is uniform.
pub struct WeightedSelector {
    static_weights: RwLock<HashMap<String, f64>>,
}

impl WeightedSelector {
    pub fn new() -> Self {
        Self::with_weights(HashMap::new())
    }

    pub fn with_weights(weights: HashMap<String, f64>) -> Self {
        Self {
            static_weights: RwLock::new(weights),
        }
    }

    pub fn set_weight(&self, backend_id: impl Into<String>, weight: f64) {
        self.static_weights.write().insert(backend_id.into(), weight);
    }

    fn weight_of(&self, backend: &ProxyBackend) -> f64 {
        if let Some(weight) = self.static_weights.read().get(&backend.id) {
            return weight.max(0.0);
        }
        match backend.ema_response_time() {
            Some(ms) if ms.is_finite() => 1.0 / ms.max(1.0),
            _ => 0.0,
        }
    }
}

impl Default for WeightedSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxySelector for WeightedSelector {
    fn choose(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        let usable = eligible_or_empty(candidates, context)?;
        let weights: Vec<f64> = usable.iter().map(|b| self.weight_of(b)).collect();

        let mut rng = rand::thread_rng();
        match WeightedIndex::new(&weights) {
            Ok(dist) => Ok(usable[dist.sample(&mut rng)].clone()),
            // All weights zero: nothing to prefer
            Err(_) => usable
                .choose(&mut rng)
                .cloned()
                .ok_or(RotaError::NoProxiesAvailable),
        }
    }

    fn configure(&self, config: &StrategyConfig) {
        *self.static_weights.write() = config.weights.clone();
    }

    fn strategy_name(&self) -> &'static str {
        "weighted"
    }
}
