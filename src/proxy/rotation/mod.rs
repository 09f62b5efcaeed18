//! Proxy rotation strategies
//!
//! This module provides various strategies for selecting proxies from the pool.
//! Strategies are pure selection logic over a snapshot of candidates; the
//! orchestrator applies circuit-breaker filtering before calling them.

mod composite;
mod geo;
mod least_used;
mod performance;
mod random;
mod registry;
mod round_robin;
mod session;
mod weighted;

pub use composite::CompositeSelector;
pub use geo::GeoTargetedSelector;
pub use least_used::LeastUsedSelector;
pub use performance::{PerformanceBasedSelector, DEFAULT_EXPLORATION_COUNT};
pub use random::RandomSelector;
pub use registry::{SelectorFactory, StrategyRegistry};
pub use round_robin::RoundRobinSelector;
pub use session::SessionPersistenceSelector;
pub use weighted::WeightedSelector;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::StrategyConfig;
use crate::error::{Result, RotaError};
use crate::models::{ProxyBackend, SelectionContext};

/// Strategy types for proxy rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    Random,
    Weighted,
    LeastUsed,
    PerformanceBased,
    SessionPersistence,
    GeoTargeted,
    Composite,
}

impl RotationStrategy {
    pub const ALL: [RotationStrategy; 8] = [
        RotationStrategy::RoundRobin,
        RotationStrategy::Random,
        RotationStrategy::Weighted,
        RotationStrategy::LeastUsed,
        RotationStrategy::PerformanceBased,
        RotationStrategy::SessionPersistence,
        RotationStrategy::GeoTargeted,
        RotationStrategy::Composite,
    ];

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "round_robin" | "roundrobin" | "round-robin" => Some(Self::RoundRobin),
            "random" => Some(Self::Random),
            "weighted" => Some(Self::Weighted),
            "least_used" | "leastused" | "least-used" => Some(Self::LeastUsed),
            "performance_based" | "performance" | "performance-based" | "ema" => {
                Some(Self::PerformanceBased)
            }
            "session_persistence" | "session" | "sticky" | "session-persistence" => {
                Some(Self::SessionPersistence)
            }
            "geo_targeted" | "geo" | "geo-targeted" => Some(Self::GeoTargeted),
            "composite" => Some(Self::Composite),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::Weighted => "weighted",
            Self::LeastUsed => "least_used",
            Self::PerformanceBased => "performance_based",
            Self::SessionPersistence => "session_persistence",
            Self::GeoTargeted => "geo_targeted",
            Self::Composite => "composite",
        }
    }
}

/// Trait for proxy selection strategies
///
/// `choose` is the decision alone; `select` is a decision that also counts
/// as a started request on the chosen backend. Strategies whose decision
/// depends on that count override `select` to make both one atomic step.
pub trait ProxySelector: Send + Sync {
    /// Pick a backend from `candidates` without accounting for it
    ///
    /// Ineligible candidates (unhealthy, expired, excluded by the context)
    /// are never returned. Fails with `NoProxiesAvailable` when none remain.
    fn choose(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>>;

    /// Pick a backend and account the pick as a started request
    fn select(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        let backend = self.choose(candidates, context)?;
        backend.record_selection();
        Ok(backend)
    }

    /// Feed back the outcome of a request; never fails
    fn record_result(&self, _backend: &ProxyBackend, _success: bool, _response_time: Option<Duration>) {}

    /// Apply tunables at runtime
    fn configure(&self, _config: &StrategyConfig) {}

    /// Forget any state held for a backend that left the pool
    fn forget_backend(&self, _backend_id: &str) {}

    /// End sticky affinity for a session; returns whether one existed
    fn close_session(&self, _session_id: &str) -> bool {
        false
    }

    /// Whether `candidate` stays in a composite's candidate set given this
    /// strategy's reference pick
    fn retains(
        &self,
        reference: &ProxyBackend,
        candidate: &ProxyBackend,
        _context: &SelectionContext,
    ) -> bool {
        reference.same_profile(candidate)
    }

    /// Get the strategy name
    fn strategy_name(&self) -> &'static str;
}

/// Candidates a strategy may hand out
pub(crate) fn eligible(
    candidates: &[Arc<ProxyBackend>],
    context: &SelectionContext,
) -> Vec<Arc<ProxyBackend>> {
    let now = Utc::now();
    candidates
        .iter()
        .filter(|b| b.is_selectable() && !b.is_expired_at(now) && !context.is_excluded(&b.id))
        .cloned()
        .collect()
}

pub(crate) fn eligible_or_empty(
    candidates: &[Arc<ProxyBackend>],
    context: &SelectionContext,
) -> Result<Vec<Arc<ProxyBackend>>> {
    let usable = eligible(candidates, context);
    if usable.is_empty() {
        Err(RotaError::NoProxiesAvailable)
    } else {
        Ok(usable)
    }
}

/// Create a proxy selector based on the strategy type
pub fn create_selector(
    strategy: RotationStrategy,
    config: &StrategyConfig,
) -> Result<Arc<dyn ProxySelector>> {
    let selector: Arc<dyn ProxySelector> = match strategy {
        RotationStrategy::RoundRobin => Arc::new(RoundRobinSelector::new()),
        RotationStrategy::Random => Arc::new(RandomSelector::new()),
        RotationStrategy::Weighted => Arc::new(WeightedSelector::with_weights(config.weights.clone())),
        RotationStrategy::LeastUsed => Arc::new(LeastUsedSelector::new()),
        RotationStrategy::PerformanceBased => {
            Arc::new(PerformanceBasedSelector::new(config.exploration_count))
        }
        RotationStrategy::SessionPersistence => Arc::new(SessionPersistenceSelector::new(
            config.max_sessions,
            config.session_timeout,
        )),
        RotationStrategy::GeoTargeted => {
            let secondary = create_nested(&config.geo_secondary_strategy, config)?;
            Arc::new(GeoTargetedSelector::new(secondary, config.geo_fallback))
        }
        RotationStrategy::Composite => {
            let filters = config
                .composite_filters
                .iter()
                .map(|name| create_nested(name, config))
                .collect::<Result<Vec<_>>>()?;
            let selector = config
                .composite_selector
                .as_deref()
                .map(|name| create_nested(name, config))
                .transpose()?;
            Arc::new(CompositeSelector::new(filters, selector)?)
        }
    };
    Ok(selector)
}

/// Build a strategy used inside another one; composites cannot nest
fn create_nested(name: &str, config: &StrategyConfig) -> Result<Arc<dyn ProxySelector>> {
    match RotationStrategy::from_str(name) {
        Some(RotationStrategy::Composite) => Err(RotaError::InvalidConfig(
            "composite strategies cannot be nested".to_string(),
        )),
        Some(strategy) => create_selector(strategy, config),
        None => Err(RotaError::UnknownStrategy(name.to_string())),
    }
}
