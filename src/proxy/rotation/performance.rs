//! EMA response-time based selection with bounded cold-start exploration

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use tracing::trace;

use super::{eligible_or_empty, ProxySelector};
use crate::config::StrategyConfig;
use crate::error::{Result, RotaError};
use crate::models::{ProxyBackend, SelectionContext};

pub const DEFAULT_EXPLORATION_COUNT: u32 = 5;

/// Biases selection toward backends with a lower EMA response time
///
/// A backend without EMA data is "cold". Cold backends are picked first
/// (least started first) until each has had `exploration_count` trials,
/// after which they compete with the smallest known weight rather than
/// being starved.
pub struct PerformanceBasedSelector {
    exploration_count: AtomicU32,
    trials: DashMap<String, u32>,
    pick: Mutex<()>,
}

impl PerformanceBasedSelector {
    pub fn new(exploration_count: u32) -> Self {
        Self {
            exploration_count: AtomicU32::new(exploration_count),
            trials: DashMap::new(),
            pick: Mutex::new(()),
        }
    }

    pub fn exploration_count(&self) -> u32 {
        self.exploration_count.load(Ordering::Relaxed)
    }

    /// Number of results recorded for a backend
    pub fn trials(&self, backend_id: &str) -> u32 {
        self.trials.get(backend_id).map(|t| *t).unwrap_or(0)
    }

    fn is_cold(&self, backend: &ProxyBackend) -> bool {
        backend.ema_response_time().is_none() && self.trials(&backend.id) < self.exploration_count()
    }

    fn pick(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        let usable = eligible_or_empty(candidates, context)?;

        let cold = usable
            .iter()
            .filter(|b| self.is_cold(b))
            .min_by(|a, b| {
                a.requests_started()
                    .cmp(&b.requests_started())
                    .then_with(|| a.id.cmp(&b.id))
            });
        if let Some(backend) = cold {
            trace!(backend = %backend.id, "Exploring cold backend");
            return Ok(backend.clone());
        }

        let known: Vec<Option<f64>> = usable
            .iter()
            .map(|b| b.ema_response_time().map(|ms| 1.0 / ms.max(1.0)))
            .collect();
        let floor = known
            .iter()
            .flatten()
            .copied()
            .fold(None, |min: Option<f64>, w| Some(min.map_or(w, |m| m.min(w))))
            .unwrap_or(1.0);
        let weights: Vec<f64> = known.into_iter().map(|w| w.unwrap_or(floor)).collect();

        let dist = WeightedIndex::new(&weights)
            .map_err(|e| RotaError::Internal(format!("invalid performance weights: {}", e)))?;
        Ok(usable[dist.sample(&mut rand::thread_rng())].clone())
    }
}

impl Default for PerformanceBasedSelector {
    fn default() -> Self {
        Self::new(DEFAULT_EXPLORATION_COUNT)
    }
}

impl ProxySelector for PerformanceBasedSelector {
    fn choose(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        let _pick = self.pick.lock();
        self.pick(candidates, context)
    }

    fn select(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        let _pick = self.pick.lock();
        let backend = self.pick(candidates, context)?;
        backend.record_selection();
        Ok(backend)
    }

    fn record_result(&self, backend: &ProxyBackend, _success: bool, _response_time: Option<Duration>) {
        *self.trials.entry(backend.id.clone()).or_insert(0) += 1;
    }

    fn configure(&self, config: &StrategyConfig) {
        self.exploration_count
            .store(config.exploration_count, Ordering::Relaxed);
    }

    fn forget_backend(&self, backend_id: &str) {
        self.trials.remove(backend_id);
    }

    fn strategy_name(&self) -> &'static str {
        "performance_based"
    }
}
