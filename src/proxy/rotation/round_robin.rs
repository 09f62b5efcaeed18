//! Round-robin proxy selection strategy

use std::sync::Arc;

use parking_lot::Mutex;

use super::{eligible_or_empty, ProxySelector};
use crate::error::{Result, RotaError};
use crate::models::{ProxyBackend, SelectionContext};

/// Selects proxies in round-robin order over the candidates sorted by identity
///
/// The cursor remembers the last identity handed out rather than an index,
/// so membership changes between calls neither skip nor repeat backends:
/// the next pick is the first eligible identity after the cursor.
pub struct RoundRobinSelector {
    cursor: Mutex<Option<String>>,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            cursor: Mutex::new(None),
        }
    }

    fn advance(
        cursor: &mut Option<String>,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        let mut usable = eligible_or_empty(candidates, context)?;
        usable.sort_by(|a, b| a.id.cmp(&b.id));

        let next = match cursor.as_deref() {
            Some(last) => usable
                .iter()
                .find(|b| b.id.as_str() > last)
                .or_else(|| usable.first()),
            None => usable.first(),
        }
        .cloned()
        .ok_or(RotaError::NoProxiesAvailable)?;

        *cursor = Some(next.id.clone());
        Ok(next)
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxySelector for RoundRobinSelector {
    fn choose(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        let mut cursor = self.cursor.lock();
        Self::advance(&mut cursor, candidates, context)
    }

    fn select(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        let mut cursor = self.cursor.lock();
        let backend = Self::advance(&mut cursor, candidates, context)?;
        backend.record_selection();
        Ok(backend)
    }

    fn strategy_name(&self) -> &'static str {
        "round_robin"
    }
}
