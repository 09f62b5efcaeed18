//! Country/region targeted selection strategy

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{eligible, ProxySelector};
use crate::config::StrategyConfig;
use crate::error::{Result, RotaError};
use crate::models::{ProxyBackend, SelectionContext};

/// Narrows candidates to the context's country/region target
///
/// The final pick among matches is delegated to a secondary strategy. With
/// fallback enabled an unmatched target falls back to every candidate.
pub struct GeoTargetedSelector {
    secondary: Arc<dyn ProxySelector>,
    fallback_enabled: AtomicBool,
}

impl GeoTargetedSelector {
    pub fn new(secondary: Arc<dyn ProxySelector>, fallback_enabled: bool) -> Self {
        Self {
            secondary,
            fallback_enabled: AtomicBool::new(fallback_enabled),
        }
    }

    pub fn fallback_enabled(&self) -> bool {
        self.fallback_enabled.load(Ordering::Relaxed)
    }

    fn targeted(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Vec<Arc<ProxyBackend>>> {
        let usable = eligible(candidates, context);
        if !context.has_location_target() {
            return Ok(usable);
        }

        let country = context.target_country.as_deref();
        let region = context.target_region.as_deref();
        let matched: Vec<_> = usable
            .iter()
            .filter(|b| b.matches_location(country, region))
            .cloned()
            .collect();

        if !matched.is_empty() {
            return Ok(matched);
        }
        if self.fallback_enabled() {
            debug!(
                country = country.unwrap_or("-"),
                region = region.unwrap_or("-"),
                "No backend matches location target, falling back"
            );
            return Ok(usable);
        }
        Err(RotaError::NoProxiesAvailable)
    }
}

impl ProxySelector for GeoTargetedSelector {
    fn choose(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        let targeted = self.targeted(candidates, context)?;
        self.secondary.choose(&targeted, context)
    }

    fn select(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        let targeted = self.targeted(candidates, context)?;
        self.secondary.select(&targeted, context)
    }

    fn record_result(&self, backend: &ProxyBackend, success: bool, response_time: Option<Duration>) {
        self.secondary.record_result(backend, success, response_time);
    }

    fn configure(&self, config: &StrategyConfig) {
        self.fallback_enabled
            .store(config.geo_fallback, Ordering::Relaxed);
        self.secondary.configure(config);
    }

    fn forget_backend(&self, backend_id: &str) {
        self.secondary.forget_backend(backend_id);
    }

    fn close_session(&self, session_id: &str) -> bool {
        self.secondary.close_session(session_id)
    }

    fn retains(
        &self,
        reference: &ProxyBackend,
        candidate: &ProxyBackend,
        context: &SelectionContext,
    ) -> bool {
        if context.has_location_target() {
            candidate.matches_location(
                context.target_country.as_deref(),
                context.target_region.as_deref(),
            )
        } else {
            reference.same_profile(candidate)
        }
    }

    fn strategy_name(&self) -> &'static str {
        "geo_targeted"
    }
}
