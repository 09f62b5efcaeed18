//! Per-backend circuit breakers
//!
//! Each backend gets a breaker with three states:
//! - **Closed**: normal operation, the backend is selectable
//! - **Open**: too many failures inside the sliding window, the backend is skipped
//! - **HalfOpen**: the open timeout elapsed, a single trial request is let through
//!
//! The HalfOpen trial is a token: one caller acquires it, and the breaker
//! commits to Closed or Open on that caller's result. A token whose result
//! never arrives is released again after `timeout_duration`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, RotaError};
use crate::models::CircuitSummary;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration for circuit breakers
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that open the circuit
    pub failure_threshold: u32,
    /// Length of the sliding failure window
    pub window_duration: Duration,
    /// Time spent Open before a trial is allowed
    pub timeout_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_duration: Duration::from_secs(60),
            timeout_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_window: VecDeque<Instant>,
    next_test_time: Option<Instant>,
    last_state_change: Instant,
    trial_started: Option<Instant>,
}

/// Snapshot of a breaker for reporting
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub backend_id: String,
    pub state: CircuitState,
    pub failures_in_window: usize,
    pub failure_threshold: u32,
    pub next_test_in: Option<Duration>,
    pub since_last_change: Duration,
}

/// Failure guard for a single backend
#[derive(Debug)]
pub struct CircuitBreaker {
    backend_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(backend_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            backend_id: backend_id.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_window: VecDeque::new(),
                next_test_time: None,
                last_state_change: Instant::now(),
                trial_started: None,
            }),
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// Current state, applying a due Open -> HalfOpen transition
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Whether a selection may consider this backend right now
    pub fn is_available(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !self.trial_pending(&inner, now),
            CircuitState::Open => false,
        }
    }

    /// Claim permission to send a request; in HalfOpen this takes the single trial token
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if self.trial_pending(&inner, now) {
                    false
                } else {
                    inner.trial_started = Some(now);
                    debug!(backend = %self.backend_id, "Circuit half-open trial acquired");
                    true
                }
            }
            CircuitState::Open => false,
        }
    }

    pub fn record_success(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        match inner.state {
            CircuitState::HalfOpen => {
                inner.failure_window.clear();
                self.transition(&mut inner, CircuitState::Closed, now);
            }
            CircuitState::Closed => {
                self.purge(&mut inner, now);
            }
            // A request that began before the circuit opened; the open timeout still applies.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        match inner.state {
            CircuitState::Closed => {
                inner.failure_window.push_back(now);
                self.purge(&mut inner, now);
                if inner.failure_window.len() >= self.config.failure_threshold as usize {
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_window.push_back(now);
                self.transition(&mut inner, CircuitState::Open, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Hand back a HalfOpen trial token whose request said nothing about the backend
    pub fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_started.take().is_some() {
            debug!(backend = %self.backend_id, "Circuit half-open trial released");
        }
    }

    /// Force the breaker Closed and forget recorded failures
    pub fn reset(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.failure_window.clear();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed, now);
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        self.purge(&mut inner, now);
        CircuitBreakerSnapshot {
            backend_id: self.backend_id.clone(),
            state: inner.state,
            failures_in_window: inner.failure_window.len(),
            failure_threshold: self.config.failure_threshold,
            next_test_in: inner
                .next_test_time
                .map(|at| at.saturating_duration_since(now)),
            since_last_change: now.saturating_duration_since(inner.last_state_change),
        }
    }

    fn refresh(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state == CircuitState::Open {
            if let Some(at) = inner.next_test_time {
                if now >= at {
                    self.transition(inner, CircuitState::HalfOpen, now);
                }
            }
        }
    }

    fn purge(&self, inner: &mut BreakerInner, now: Instant) {
        while let Some(&oldest) = inner.failure_window.front() {
            if now.saturating_duration_since(oldest) > self.config.window_duration {
                inner.failure_window.pop_front();
            } else {
                break;
            }
        }
    }

    fn trial_pending(&self, inner: &BreakerInner, now: Instant) -> bool {
        inner
            .trial_started
            .map(|started| now.saturating_duration_since(started) < self.config.timeout_duration)
            .unwrap_or(false)
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.last_state_change = now;
        inner.trial_started = None;
        inner.next_test_time = match to {
            CircuitState::Open => Some(now + self.config.timeout_duration),
            _ => None,
        };

        match to {
            CircuitState::Open => warn!(
                backend = %self.backend_id,
                from = %from,
                failures = inner.failure_window.len(),
                "Circuit opened"
            ),
            _ => info!(backend = %self.backend_id, from = %from, to = %to, "Circuit state changed"),
        }
    }
}

/// Breakers for every backend in a pool, keyed by backend id
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Create the breaker for a backend, keeping an existing one
    pub fn attach(&self, backend_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(backend_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(backend_id, self.config.clone())))
            .clone()
    }

    pub fn detach(&self, backend_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(backend_id).map(|(_, breaker)| breaker)
    }

    pub fn get(&self, backend_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(backend_id).map(|b| b.value().clone())
    }

    /// Backends without a breaker are treated as Closed
    pub fn is_available(&self, backend_id: &str) -> bool {
        self.get(backend_id).map(|b| b.is_available()).unwrap_or(true)
    }

    pub fn try_acquire(&self, backend_id: &str) -> bool {
        self.get(backend_id).map(|b| b.try_acquire()).unwrap_or(true)
    }

    pub fn state(&self, backend_id: &str) -> CircuitState {
        self.get(backend_id)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn reset(&self, backend_id: &str) -> Result<()> {
        let breaker = self.get(backend_id).ok_or_else(|| RotaError::ProxyNotFound {
            id: backend_id.to_string(),
        })?;
        breaker.reset();
        Ok(())
    }

    pub fn states(&self) -> BTreeMap<String, CircuitState> {
        // Collect first so no shard lock is held while breakers lock themselves.
        let breakers: Vec<_> = self.breakers.iter().map(|b| b.value().clone()).collect();
        breakers
            .into_iter()
            .map(|b| (b.backend_id().to_string(), b.state()))
            .collect()
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let breakers: Vec<_> = self.breakers.iter().map(|b| b.value().clone()).collect();
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        snapshots
    }

    pub fn summary(&self) -> CircuitSummary {
        let mut summary = CircuitSummary::default();
        for state in self.states().into_values() {
            summary.record(state);
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
