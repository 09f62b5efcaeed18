//! Filter chain followed by a final selector

use std::sync::Arc;
use std::time::Duration;

use super::{eligible_or_empty, ProxySelector};
use crate::config::StrategyConfig;
use crate::error::{Result, RotaError};
use crate::models::{ProxyBackend, SelectionContext};

/// Runs an ordered list of filter strategies, then a selector
///
/// Each filter makes one reference pick from the remaining candidates and
/// keeps only those it `retains` against that reference. The selector makes
/// the final pick; without one the last filter's reference pick wins.
pub struct CompositeSelector {
    filters: Vec<Arc<dyn ProxySelector>>,
    selector: Option<Arc<dyn ProxySelector>>,
}

impl CompositeSelector {
    pub fn new(
        filters: Vec<Arc<dyn ProxySelector>>,
        selector: Option<Arc<dyn ProxySelector>>,
    ) -> Result<Self> {
        if filters.is_empty() && selector.is_none() {
            return Err(RotaError::InvalidArgument(
                "composite strategy needs at least one filter or a selector".to_string(),
            ));
        }
        Ok(Self { filters, selector })
    }

    fn narrow(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<(Vec<Arc<ProxyBackend>>, Option<Arc<ProxyBackend>>)> {
        let mut remaining = eligible_or_empty(candidates, context)?;
        let mut reference = None;

        for filter in &self.filters {
            let pick = filter.choose(&remaining, context)?;
            remaining.retain(|b| b.id == pick.id || filter.retains(&pick, b, context));
            reference = Some(pick);
        }
        Ok((remaining, reference))
    }

    fn members(&self) -> impl Iterator<Item = &Arc<dyn ProxySelector>> {
        self.filters.iter().chain(self.selector.iter())
    }
}

impl ProxySelector for CompositeSelector {
    fn choose(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        let (remaining, reference) = self.narrow(candidates, context)?;
        match &self.selector {
            Some(selector) => selector.choose(&remaining, context),
            None => reference.ok_or(RotaError::NoProxiesAvailable),
        }
    }

    fn select(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        let (remaining, reference) = self.narrow(candidates, context)?;
        match &self.selector {
            Some(selector) => selector.select(&remaining, context),
            None => {
                let backend = reference.ok_or(RotaError::NoProxiesAvailable)?;
                backend.record_selection();
                Ok(backend)
            }
        }
    }

    fn record_result(&self, backend: &ProxyBackend, success: bool, response_time: Option<Duration>) {
        for member in self.members() {
            member.record_result(backend, success, response_time);
        }
    }

    fn configure(&self, config: &StrategyConfig) {
        for member in self.members() {
            member.configure(config);
        }
    }

    fn forget_backend(&self, backend_id: &str) {
        for member in self.members() {
            member.forget_backend(backend_id);
        }
    }

    fn close_session(&self, session_id: &str) -> bool {
        self.members()
            .fold(false, |closed, member| member.close_session(session_id) || closed)
    }

    fn strategy_name(&self) -> &'static str {
        "composite"
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{GeoTargetedSelector, LeastUsedSelector, RandomSelector};
    use super::*;

    fn tagged() -> Vec<Arc<ProxyBackend>> {
        let tag = |n: u16, country: &str| {
            Arc::new(Arc::try_unwrap(backend(n)).unwrap().with_country(country))
        };
        vec![tag(1, "US"), tag(2, "DE"), tag(3, "US"), tag(4, "DE")]
    }

    #[test]
    fn test_composite_requires_parts() {
        assert!(CompositeSelector::new(vec![], None).is_err());
        assert!(CompositeSelector::new(vec![], Some(Arc::new(RandomSelector::new()))).is_ok());
    }

    #[test]
    fn test_geo_filter_then_least_used() {
        let geo: Arc<dyn ProxySelector> =
            Arc::new(GeoTargetedSelector::new(Arc::new(RandomSelector::new()), false));
        let composite =
            CompositeSelector::new(vec![geo], Some(Arc::new(LeastUsedSelector::new()))).unwrap();
        let candidates = tagged();
        let ctx = SelectionContext::new().with_country("DE");

        let picks: Vec<_> = (0..4)
            .map(|_| composite.select(&candidates, &ctx).unwrap().id.clone())
            .collect();
        assert_eq!(
            picks,
            vec![
                candidates[1].id.clone(),
                candidates[3].id.clone(),
                candidates[1].id.clone(),
                candidates[3].id.clone(),
            ]
        );
    }

    #[test]
    fn test_filter_without_target_keeps_reference_profile() {
        let random: Arc<dyn ProxySelector> = Arc::new(RandomSelector::new());
        let composite =
            CompositeSelector::new(vec![random], Some(Arc::new(LeastUsedSelector::new()))).unwrap();
        let candidates = tagged();
        let ctx = SelectionContext::new();

        for _ in 0..20 {
            // Whatever country the reference pick has, the result shares it
            let picked = composite.choose(&candidates, &ctx).unwrap();
            assert!(picked.country.is_some());
        }
    }

    #[test]
    fn test_filters_only_returns_reference() {
        let least: Arc<dyn ProxySelector> = Arc::new(LeastUsedSelector::new());
        let composite = CompositeSelector::new(vec![least], None).unwrap();
        let candidates = tagged();

        let picked = composite.select(&candidates, &SelectionContext::new()).unwrap();
        assert_eq!(picked.id, candidates[0].id);
        assert_eq!(picked.requests_started(), 1);
    }
}
