//! Sticky-session selection strategy

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::round_robin::RoundRobinSelector;
use super::{eligible, ProxySelector};
use crate::error::{Result, RotaError};
use crate::models::{ProxyBackend, SelectionContext};
use crate::proxy::session::SessionManager;

/// Keeps every call under one session id on the same backend
///
/// New sessions, and sessions whose backend stopped being eligible, are
/// bound by round-robin over the remaining candidates.
pub struct SessionPersistenceSelector {
    sessions: Arc<SessionManager>,
    fallback: RoundRobinSelector,
    // Lookup and rebind must not interleave for the same session
    bind: Mutex<()>,
}

impl SessionPersistenceSelector {
    pub fn new(max_sessions: usize, session_timeout: Duration) -> Self {
        Self::with_manager(Arc::new(SessionManager::new(max_sessions, session_timeout)))
    }

    pub fn with_manager(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            fallback: RoundRobinSelector::new(),
            bind: Mutex::new(()),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    fn resolve(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
        account: bool,
    ) -> Result<Arc<ProxyBackend>> {
        let session_id = context.session_id.as_deref().ok_or_else(|| {
            RotaError::InvalidArgument("session persistence requires a session id".to_string())
        })?;

        let _bind = self.bind.lock();
        let usable = eligible(candidates, context);

        if let Some(bound) = self.sessions.get_backend(session_id) {
            if let Some(backend) = usable.iter().find(|b| b.id == bound) {
                if account {
                    backend.record_selection();
                }
                return Ok(backend.clone());
            }
            debug!(session = %session_id, backend = %bound, "Bound backend unavailable, rebinding session");
        }

        let backend = if account {
            self.fallback.select(&usable, context)?
        } else {
            self.fallback.choose(&usable, context)?
        };
        self.sessions.bind(session_id, &backend.id);
        Ok(backend)
    }
}

impl ProxySelector for SessionPersistenceSelector {
    fn choose(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        self.resolve(candidates, context, false)
    }

    fn select(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        self.resolve(candidates, context, true)
    }

    fn forget_backend(&self, backend_id: &str) {
        let dropped = self.sessions.remove_backend(backend_id);
        if dropped > 0 {
            debug!(backend = %backend_id, sessions = dropped, "Dropped sessions for removed backend");
        }
    }

    fn close_session(&self, session_id: &str) -> bool {
        self.sessions.close(session_id)
    }

    fn strategy_name(&self) -> &'static str {
        "session_persistence"
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::models::HealthStatus;
    use std::thread;

    fn selector() -> SessionPersistenceSelector {
        SessionPersistenceSelector::new(100, Duration::from_secs(60))
    }

    #[test]
    fn test_requires_session_id() {
        let result = selector().select(&pool(2), &SelectionContext::new());
        assert!(matches!(result, Err(RotaError::InvalidArgument(_))));
    }

    #[test]
    fn test_same_session_sticks() {
        let selector = selector();
        let candidates = pool(5);
        let ctx = SelectionContext::new().with_session("s-1");

        let first = selector.select(&candidates, &ctx).unwrap();
        for _ in 0..1000 {
            assert_eq!(selector.select(&candidates, &ctx).unwrap().id, first.id);
        }
    }

    #[test]
    fn test_distinct_sessions_spread() {
        let selector = selector();
        let candidates = pool(3);

        let a = selector
            .select(&candidates, &SelectionContext::new().with_session("a"))
            .unwrap();
        let b = selector
            .select(&candidates, &SelectionContext::new().with_session("b"))
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_rebinds_when_backend_unhealthy() {
        let selector = selector();
        let candidates = pool(3);
        let ctx = SelectionContext::new().with_session("s-1");

        let first = selector.select(&candidates, &ctx).unwrap();
        first.set_health_status(HealthStatus::Unhealthy);

        let second = selector.select(&candidates, &ctx).unwrap();
        assert_ne!(second.id, first.id);
        assert!(second.is_selectable());

        // Recovery of the old backend does not pull the session back
        first.set_health_status(HealthStatus::Healthy);
        for _ in 0..10 {
            assert_eq!(selector.select(&candidates, &ctx).unwrap().id, second.id);
        }
    }

    #[test]
    fn test_close_session_and_forget_backend() {
        let selector = selector();
        let candidates = pool(2);
        let ctx = SelectionContext::new().with_session("s-1");

        let first = selector.select(&candidates, &ctx).unwrap();
        assert!(selector.close_session("s-1"));
        assert!(!selector.close_session("s-1"));

        selector.select(&candidates, &ctx).unwrap();
        selector.forget_backend(&first.id);
        selector.forget_backend(&candidates[1].id);
        assert!(selector.sessions().is_empty());
    }

    #[test]
    fn test_concurrent_sessions_are_consistent() {
        let selector = Arc::new(selector());
        let candidates = Arc::new(pool(4));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let selector = selector.clone();
                let candidates = candidates.clone();
                thread::spawn(move || {
                    let ctx = SelectionContext::new().with_session(format!("s-{}", t % 3));
                    (0..200)
                        .map(|_| selector.select(&candidates, &ctx).unwrap().id.clone())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut by_session: std::collections::HashMap<usize, String> = Default::default();
        for (t, handle) in handles.into_iter().enumerate() {
            let picks = handle.join().unwrap();
            let expected = by_session.entry(t % 3).or_insert_with(|| picks[0].clone());
            assert!(picks.iter().all(|p| p == expected));
        }
    }
}
