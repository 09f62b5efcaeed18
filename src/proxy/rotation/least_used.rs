//! Least-used proxy selection strategy

use std::sync::Arc;

use parking_lot::Mutex;

use super::{eligible_or_empty, ProxySelector};
use crate::error::{Result, RotaError};
use crate::models::{ProxyBackend, SelectionContext};

/// Selects the proxy with the fewest started requests, ties broken by identity
pub struct LeastUsedSelector {
    // Serializes pick-and-account so concurrent callers see each other's increments
    pick: Mutex<()>,
}

impl LeastUsedSelector {
    pub fn new() -> Self {
        Self {
            pick: Mutex::new(()),
        }
    }

    fn least_used(
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        eligible_or_empty(candidates, context)?
            .into_iter()
            .min_by(|a, b| {
                a.requests_started()
                    .cmp(&b.requests_started())
                    .then_with(|| a.id.cmp(&b.id))
            })
            .ok_or(RotaError::NoProxiesAvailable)
    }
}

impl Default for LeastUsedSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxySelector for LeastUsedSelector {
    fn choose(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        let _pick = self.pick.lock();
        Self::least_used(candidates, context)
    }

    fn select(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        let _pick = self.pick.lock();
        let backend = Self::least_used(candidates, context)?;
        backend.record_selection();
        Ok(backend)
    }

    fn strategy_name(&self) -> &'static str {
        "least_used"
    }
}
