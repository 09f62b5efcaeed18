//! Random proxy selection strategy

use std::sync::Arc;

use rand::seq::SliceRandom;

use super::{eligible_or_empty, ProxySelector};
use crate::error::{Result, RotaError};
use crate::models::{ProxyBackend, SelectionContext};

/// Selects a uniformly random proxy from the eligible candidates
pub struct RandomSelector;

impl RandomSelector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RandomSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxySelector for RandomSelector {
    fn choose(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        let usable = eligible_or_empty(candidates, context)?;

        let mut rng = rand::thread_rng();
        usable
            .choose(&mut rng)
            .cloned()
            .ok_or(RotaError::NoProxiesAvailable)
    }

    fn strategy_name(&self) -> &'static str {
        "random"
    }
}
