//! Sticky-session affinity table

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

/// Default idle lifetime of a session binding
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(3600);
/// Default bound on live session bindings
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

/// One session -> backend binding
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub backend_id: String,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub expires_at: Instant,
}

impl Session {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Bounded, TTL-aware map of session ids to backend ids
///
/// Expiry slides: every lookup that hits pushes `expires_at` out by the
/// session timeout. At capacity the least recently used binding is evicted.
/// Recency order is also expiry order, so expired bindings always sit at
/// the least recently used end.
pub struct SessionManager {
    sessions: Mutex<LruCache<String, Session>>,
    max_sessions: usize,
    session_timeout: Duration,
}

impl SessionManager {
    pub fn new(max_sessions: usize, session_timeout: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_sessions).unwrap_or(NonZeroUsize::MIN);
        Self {
            sessions: Mutex::new(LruCache::new(capacity)),
            max_sessions: capacity.get(),
            session_timeout,
        }
    }

    /// Backend bound to a live session, refreshing its expiry
    pub fn get_backend(&self, session_id: &str) -> Option<String> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();

        let expired = match sessions.get_mut(session_id) {
            Some(session) if !session.is_expired(now) => {
                session.last_used_at = now;
                session.expires_at = now + self.session_timeout;
                return Some(session.backend_id.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            sessions.pop(session_id);
            debug!(session = %session_id, "Session expired");
        }
        None
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        let now = Instant::now();
        self.sessions
            .lock()
            .peek(session_id)
            .filter(|s| !s.is_expired(now))
            .cloned()
    }

    /// Bind (or rebind) a session to a backend
    pub fn bind(&self, session_id: &str, backend_id: &str) {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();

        if let Some(session) = sessions.get_mut(session_id) {
            session.backend_id = backend_id.to_string();
            session.last_used_at = now;
            session.expires_at = now + self.session_timeout;
            return;
        }

        if sessions.len() >= self.max_sessions {
            Self::purge_expired(&mut sessions, now);
        }

        let evicted = sessions.push(
            session_id.to_string(),
            Session {
                session_id: session_id.to_string(),
                backend_id: backend_id.to_string(),
                created_at: now,
                last_used_at: now,
                expires_at: now + self.session_timeout,
            },
        );
        if let Some((lru, _)) = evicted {
            debug!(session = %lru, "Evicted least recently used session");
        }
    }

    pub fn close(&self, session_id: &str) -> bool {
        self.sessions.lock().pop(session_id).is_some()
    }

    /// Drop every session bound to a backend
    pub fn remove_backend(&self, backend_id: &str) -> usize {
        let mut sessions = self.sessions.lock();
        let bound: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.backend_id == backend_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &bound {
            sessions.pop(id);
        }
        bound.len()
    }

    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        Self::purge_expired(&mut self.sessions.lock(), now)
    }

    fn purge_expired(sessions: &mut LruCache<String, Session>, now: Instant) -> usize {
        let mut removed = 0;
        while sessions
            .peek_lru()
            .map(|(_, s)| s.is_expired(now))
            .unwrap_or(false)
        {
            sessions.pop_lru();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_TIMEOUT)
    }
}
