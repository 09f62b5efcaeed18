//! Bounded, thread-safe pool of upstream proxy backends

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{Result, RotaError};
use crate::models::{HealthStatus, ProxyBackend};

/// Default upper bound on pool membership
pub const DEFAULT_MAX_POOL_SIZE: usize = 1000;

/// Named, insertion-ordered collection of backends keyed by identity
///
/// Inserting a new identity into a full pool is rejected with
/// [`RotaError::CapacityExceeded`]; nothing is evicted implicitly.
pub struct ProxyPool {
    name: String,
    max_pool_size: usize,
    backends: RwLock<Vec<Arc<ProxyBackend>>>,
}

impl ProxyPool {
    pub fn new(name: impl Into<String>, max_pool_size: usize) -> Self {
        Self {
            name: name.into(),
            max_pool_size: max_pool_size.max(1),
            backends: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.max_pool_size
    }

    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }

    /// Insert or replace a backend
    ///
    /// A record with an existing identity replaces the old one in place and
    /// inherits its runtime statistics.
    pub fn add(&self, backend: ProxyBackend) -> Result<Arc<ProxyBackend>> {
        let backend = Arc::new(backend);
        let mut backends = self.backends.write();

        if let Some(slot) = backends.iter_mut().find(|b| b.id == backend.id) {
            backend.adopt_stats(slot);
            *slot = backend.clone();
            debug!(pool = %self.name, backend = %backend.id, "Replaced proxy backend");
            return Ok(backend);
        }

        if backends.len() >= self.max_pool_size {
            return Err(RotaError::CapacityExceeded {
                capacity: self.max_pool_size,
            });
        }

        backends.push(backend.clone());
        debug!(pool = %self.name, backend = %backend.id, "Added proxy backend");
        Ok(backend)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ProxyBackend>> {
        let mut backends = self.backends.write();
        let index = backends.iter().position(|b| b.id == id)?;
        let removed = backends.remove(index);
        debug!(pool = %self.name, backend = %id, "Removed proxy backend");
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProxyBackend>> {
        self.backends.read().iter().find(|b| b.id == id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.backends.read().iter().any(|b| b.id == id)
    }

    /// Point-in-time snapshot of every backend
    pub fn get_all(&self) -> Vec<Arc<ProxyBackend>> {
        self.backends.read().clone()
    }

    /// Snapshot of backends that are healthy or degraded and not past their TTL
    pub fn get_healthy(&self) -> Vec<Arc<ProxyBackend>> {
        self.get_healthy_where(|_| true)
    }

    /// [`get_healthy`](Self::get_healthy) narrowed by an extra predicate
    pub fn get_healthy_where<F>(&self, mut keep: F) -> Vec<Arc<ProxyBackend>>
    where
        F: FnMut(&ProxyBackend) -> bool,
    {
        let now = Utc::now();
        self.backends
            .read()
            .iter()
            .filter(|b| b.is_selectable() && !b.is_expired_at(now) && keep(b))
            .cloned()
            .collect()
    }

    pub fn update_status(&self, id: &str, status: HealthStatus) -> Result<HealthStatus> {
        let backend = self
            .get(id)
            .ok_or_else(|| RotaError::ProxyNotFound { id: id.to_string() })?;
        Ok(backend.set_health_status(status))
    }

    /// Remove every backend past its TTL, returning the removed records
    pub fn drain_expired(&self) -> Vec<Arc<ProxyBackend>> {
        let now = Utc::now();
        let mut backends = self.backends.write();
        let (expired, live): (Vec<_>, Vec<_>) = backends
            .drain(..)
            .partition(|b| b.is_expired_at(now));
        *backends = live;

        if !expired.is_empty() {
            info!(pool = %self.name, count = expired.len(), "Removed expired proxy backends");
        }
        expired
    }

    /// Remove every backend past its TTL, returning how many were removed
    pub fn clear_expired(&self) -> usize {
        self.drain_expired().len()
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new("default", DEFAULT_MAX_POOL_SIZE)
    }
}
