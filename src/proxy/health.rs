//! Health checking for upstream proxies
//!
//! The checker keeps per-backend probe counters and drives the
//! healthy -> unhealthy -> recovering -> healthy/permanently failed cycle.
//! Probing on a schedule is done by one [`HealthWorker`] per source.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::Request;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, RotaError};
use crate::models::{
    BackendHealth, HealthCheckResult, HealthCounts, HealthEvent, HealthState, HealthStatus,
    PoolHealthStatus, ProxyBackend,
};
use crate::proxy::circuit_breaker::CircuitBreakers;
use crate::proxy::client::{Upstream, UpstreamClient};
use crate::proxy::connection_pool::PooledConnection;
use crate::proxy::pool::ProxyPool;
use crate::proxy::transport::ProxyTransport;
use crate::services::{HealthWorker, HealthWorkerHandle};

/// Longest recovery cooldown regardless of attempt number
pub const MAX_RECOVERY_COOLDOWN: Duration = Duration::from_secs(3600);

/// Health checker configuration
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Default interval between probe rounds
    pub check_interval: Duration,
    /// Per-source overrides of `check_interval`
    pub source_intervals: HashMap<String, Duration>,
    /// Consecutive failures that mark a backend unhealthy
    pub failure_threshold: u32,
    /// Consecutive successes that mark a backend healthy again
    pub success_threshold: u32,
    /// First recovery cooldown; doubles per attempt
    pub recovery_cooldown_base: Duration,
    pub max_recovery_attempts: u32,
    /// URL to use for health checks
    pub probe_url: String,
    pub acceptable_status_codes: Vec<u16>,
    /// Timeout for each health check
    pub probe_timeout: Duration,
    /// Probes in flight per worker
    pub probe_concurrency: usize,
    /// Healthy percentage below which `pool_degraded` fires
    pub degradation_threshold: f64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            source_intervals: HashMap::new(),
            failure_threshold: 3,
            success_threshold: 2,
            recovery_cooldown_base: Duration::from_secs(60),
            max_recovery_attempts: 5,
            probe_url: "http://www.google.com".to_string(),
            acceptable_status_codes: vec![200, 204],
            probe_timeout: Duration::from_secs(10),
            probe_concurrency: 10,
            degradation_threshold: 50.0,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval_for(&self, source: &str) -> Duration {
        self.source_intervals
            .get(source)
            .copied()
            .unwrap_or(self.check_interval)
    }

    /// `base * 2^attempt`, capped at one hour
    pub fn recovery_cooldown(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(32) as i32);
        let secs = self.recovery_cooldown_base.as_secs_f64() * factor;
        if secs >= MAX_RECOVERY_COOLDOWN.as_secs_f64() {
            MAX_RECOVERY_COOLDOWN
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    pub fn is_acceptable(&self, status_code: u16) -> bool {
        self.acceptable_status_codes.contains(&status_code)
    }
}

/// Performs one probe request through a backend
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// HTTP status returned for `target_url` fetched through `backend`
    async fn probe(&self, backend: &Arc<ProxyBackend>, target_url: &str) -> Result<u16>;
}

/// Default probe: a GET through the backend for `http` targets, a CONNECT
/// tunnel for `https` targets (an established tunnel counts as 200)
#[derive(Debug, Clone)]
pub struct HttpProbe {
    pub timeout: Duration,
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, backend: &Arc<ProxyBackend>, target_url: &str) -> Result<u16> {
        let url = url::Url::parse(target_url)?;

        if url.scheme() == "https" {
            let host = url
                .host_str()
                .ok_or_else(|| RotaError::InvalidRequest("Missing host in probe URL".to_string()))?;
            let port = url.port_or_known_default().unwrap_or(443);
            ProxyTransport::connect(backend, host, port).await?;
            return Ok(200);
        }

        let client = UpstreamClient::new(backend.clone(), self.timeout, self.timeout);
        let request = Request::get(target_url)
            .body(Full::new(Bytes::new()))
            .map_err(|e| RotaError::InvalidRequest(format!("Invalid probe request: {}", e)))?;
        let result = client.send(request).await;
        client.close();
        Ok(result?.status().as_u16())
    }
}

/// External cache of discovered backends
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, backend_key: &str) -> anyhow::Result<()>;
}

/// Receives health transition events
pub type EventCallback = Arc<dyn Fn(&HealthEvent) -> anyhow::Result<()> + Send + Sync>;

/// What a due backend needs next
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthAction {
    /// Regular probe
    Check,
    /// Recovery probe after a cooldown
    Recover,
}

#[derive(Debug)]
struct MonitoredBackend {
    backend: Arc<ProxyBackend>,
    source: String,
    status: HealthState,
    checking: bool,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_checks: u64,
    total_failures: u64,
    recovery_attempt: u32,
    next_check: Option<Instant>,
    last_error: Option<String>,
}

impl MonitoredBackend {
    fn new(backend: Arc<ProxyBackend>, source: String) -> Self {
        Self {
            backend,
            source,
            status: HealthState::Unknown,
            checking: false,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_checks: 0,
            total_failures: 0,
            recovery_attempt: 0,
            next_check: None,
            last_error: None,
        }
    }

    fn effective_status(&self) -> HealthState {
        if self.checking {
            HealthState::Checking
        } else {
            self.status
        }
    }

    fn snapshot(&self, now: Instant) -> BackendHealth {
        BackendHealth {
            backend: self.backend.id.clone(),
            source: self.source.clone(),
            status: self.effective_status(),
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            total_checks: self.total_checks,
            total_failures: self.total_failures,
            recovery_attempt: self.recovery_attempt,
            next_check_in: self.next_check.map(|at| at.saturating_duration_since(now)),
            last_error: self.last_error.clone(),
        }
    }
}

/// Side effects of a state change, applied once the registry lock is released
enum Effect {
    Invalidate(String),
    SetStatus(String, HealthStatus),
    ResetCircuit(String),
    Emit(HealthEvent),
}

/// Health checker for upstream proxies
pub struct HealthChecker {
    config: HealthCheckConfig,
    backends: RwLock<HashMap<String, MonitoredBackend>>,
    probe: Arc<dyn HealthProbe>,
    cache: Option<Arc<dyn CacheInvalidator>>,
    events: Option<EventCallback>,
    pool: Option<Arc<ProxyPool>>,
    circuit_breakers: Option<Arc<CircuitBreakers>>,
    degraded: AtomicBool,
    running: AtomicBool,
    runtime: Mutex<Option<Handle>>,
    workers: Mutex<HashMap<String, HealthWorkerHandle>>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig) -> Self {
        let probe = HttpProbe {
            timeout: config.probe_timeout,
        };
        Self {
            config,
            backends: RwLock::new(HashMap::new()),
            probe: Arc::new(probe),
            cache: None,
            events: None,
            pool: None,
            circuit_breakers: None,
            degraded: AtomicBool::new(false),
            running: AtomicBool::new(false),
            runtime: Mutex::new(None),
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheInvalidator>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_event_callback(mut self, callback: EventCallback) -> Self {
        self.events = Some(callback);
        self
    }

    /// Mirror health transitions onto the selection pool
    pub fn with_pool(mut self, pool: Arc<ProxyPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Close a backend's circuit when it recovers
    pub fn with_circuit_breakers(mut self, breakers: Arc<CircuitBreakers>) -> Self {
        self.circuit_breakers = Some(breakers);
        self
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Register a backend URL for monitoring, returning its identity
    ///
    /// Re-adding a known backend updates its record and source in place
    /// and keeps its counters.
    pub fn add_backend(&self, url: &str, source: &str) -> Result<String> {
        let backend = ProxyBackend::parse(url)?.with_source(source);
        self.add_parsed(Arc::new(backend))
    }

    /// Register an already-parsed backend for monitoring
    pub fn add_parsed(&self, backend: Arc<ProxyBackend>) -> Result<String> {
        let id = backend.id.clone();
        let source = backend.source.clone();

        let mut backends = self.backends.write();
        match backends.get_mut(&id) {
            Some(existing) => {
                existing.backend = backend;
                existing.source = source;
                debug!(backend = %id, "Updated monitored backend");
            }
            None => {
                backends.insert(id.clone(), MonitoredBackend::new(backend, source));
                debug!(backend = %id, "Monitoring backend");
            }
        }
        Ok(id)
    }

    pub fn remove_backend(&self, url: &str) -> bool {
        let id = normalize(url);
        self.backends.write().remove(&id).is_some()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.backends.read().contains_key(&normalize(url))
    }

    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }

    /// Distinct source labels of monitored backends
    pub fn sources(&self) -> BTreeSet<String> {
        self.backends
            .read()
            .values()
            .map(|m| m.source.clone())
            .collect()
    }

    /// Backends of `source` that need a probe at `now`
    ///
    /// Permanently failed backends and ones with a probe in flight are never
    /// due; recovering backends are due once their cooldown has passed.
    pub fn due_backends(&self, source: &str, now: Instant) -> Vec<(String, HealthAction)> {
        let mut due: Vec<_> = self
            .backends
            .read()
            .values()
            .filter(|m| m.source == source && !m.checking)
            .filter_map(|m| match m.status {
                HealthState::PermanentlyFailed => None,
                HealthState::Recovering => match m.next_check {
                    Some(at) if at > now => None,
                    _ => Some((m.backend.id.clone(), HealthAction::Recover)),
                },
                _ => match m.next_check {
                    Some(at) if at > now => None,
                    _ => Some((m.backend.id.clone(), HealthAction::Check)),
                },
            })
            .collect();
        due.sort();
        due
    }

    /// Probe one backend without touching any shared state
    #[instrument(skip(self), fields(probe_url = %self.config.probe_url))]
    pub async fn check_backend(&self, url: &str) -> Result<HealthCheckResult> {
        let id = normalize(url);
        let monitored = self.backends.read().get(&id).map(|m| m.backend.clone());
        let backend = match monitored {
            Some(backend) => backend,
            None => Arc::new(ProxyBackend::parse(url)?),
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.probe_timeout,
            self.probe.probe(&backend, &self.config.probe_url),
        )
        .await;
        let elapsed = started.elapsed();

        let (status, status_code, error) = match outcome {
            Ok(Ok(code)) if self.config.is_acceptable(code) => (HealthState::Healthy, Some(code), None),
            Ok(Ok(code)) => (
                HealthState::Unhealthy,
                Some(code),
                Some(format!("unexpected status code {}", code)),
            ),
            Ok(Err(e)) => (HealthState::Unhealthy, None, Some(e.to_string())),
            Err(_) => (
                HealthState::Unhealthy,
                None,
                Some(format!("probe timed out after {:?}", self.config.probe_timeout)),
            ),
        };

        if let Some(err) = &error {
            debug!(backend = %backend.id, error = %err, "Health probe failed");
        }

        Ok(HealthCheckResult {
            backend_url: backend.id.clone(),
            checked_at: Utc::now(),
            status,
            response_time: status_code.map(|_| elapsed),
            status_code,
            error,
            target_url: self.config.probe_url.clone(),
        })
    }

    /// Fold a probe result into the backend's counters and state
    pub fn update_health_status(&self, result: &HealthCheckResult) -> Result<HealthState> {
        let now = Instant::now();
        let mut effects = Vec::new();

        let state = {
            let mut backends = self.backends.write();
            let m = backends
                .get_mut(&result.backend_url)
                .ok_or_else(|| RotaError::ProxyNotFound {
                    id: result.backend_url.clone(),
                })?;

            m.total_checks += 1;
            if m.status == HealthState::PermanentlyFailed {
                return Ok(m.status);
            }

            if result.is_healthy() {
                m.consecutive_failures = 0;
                m.consecutive_successes += 1;
                m.last_error = None;

                let was = m.status;
                if was != HealthState::Healthy
                    && (was == HealthState::Unknown
                        || m.consecutive_successes >= self.config.success_threshold)
                {
                    self.mark_healthy(m, was, &mut effects);
                }
            } else {
                m.consecutive_successes = 0;
                m.consecutive_failures += 1;
                m.total_failures += 1;
                m.last_error = result.error.clone();

                let already_down = matches!(
                    m.status,
                    HealthState::Unhealthy | HealthState::Recovering
                );
                if !already_down && m.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        backend = %m.backend.id,
                        source = %m.source,
                        failures = m.consecutive_failures,
                        "Backend marked unhealthy"
                    );
                    m.status = HealthState::Unhealthy;
                    effects.push(Effect::Invalidate(m.backend.id.clone()));
                    effects.push(Effect::SetStatus(m.backend.id.clone(), HealthStatus::Unhealthy));
                    effects.push(Effect::Emit(HealthEvent::ProxyDown {
                        backend: m.backend.id.clone(),
                        source: m.source.clone(),
                        consecutive_failures: m.consecutive_failures,
                    }));
                    self.schedule_recovery(m, now);
                }
            }
            m.status
        };

        self.apply(effects);
        Ok(state)
    }

    /// Re-probe a recovering backend and advance its backoff schedule
    #[instrument(skip(self))]
    pub async fn attempt_recovery(&self, url: &str) -> Result<HealthCheckResult> {
        let id = normalize(url);
        let _guard = self.begin_check(&id)?;
        let result = self.check_backend(&id).await?;
        self.apply_recovery(&result)?;
        Ok(result)
    }

    fn apply_recovery(&self, result: &HealthCheckResult) -> Result<HealthState> {
        let now = Instant::now();
        let mut effects = Vec::new();

        let state = {
            let mut backends = self.backends.write();
            let m = backends
                .get_mut(&result.backend_url)
                .ok_or_else(|| RotaError::ProxyNotFound {
                    id: result.backend_url.clone(),
                })?;

            m.total_checks += 1;
            if m.status == HealthState::PermanentlyFailed {
                return Ok(m.status);
            }

            if result.is_healthy() {
                m.consecutive_failures = 0;
                m.consecutive_successes += 1;
                m.last_error = None;
                let was = m.status;
                self.mark_healthy(m, was, &mut effects);
            } else {
                m.consecutive_successes = 0;
                m.consecutive_failures += 1;
                m.total_failures += 1;
                m.last_error = result.error.clone();

                if m.recovery_attempt >= self.config.max_recovery_attempts {
                    error!(
                        backend = %m.backend.id,
                        source = %m.source,
                        attempts = m.recovery_attempt,
                        "Backend permanently failed"
                    );
                    m.status = HealthState::PermanentlyFailed;
                    m.next_check = None;
                    effects.push(Effect::SetStatus(m.backend.id.clone(), HealthStatus::Dead));
                    effects.push(Effect::Emit(HealthEvent::PermanentlyFailed {
                        backend: m.backend.id.clone(),
                        source: m.source.clone(),
                        recovery_attempts: m.recovery_attempt,
                    }));
                } else {
                    self.schedule_recovery(m, now);
                }
            }
            m.status
        };

        self.apply(effects);
        Ok(state)
    }

    /// Probe a backend and fold the result into its state
    pub async fn check_and_update(&self, url: &str) -> Result<HealthCheckResult> {
        let id = normalize(url);
        let _guard = self.begin_check(&id)?;
        let result = self.check_backend(&id).await?;
        self.update_health_status(&result)?;
        Ok(result)
    }

    fn mark_healthy(&self, m: &mut MonitoredBackend, was: HealthState, effects: &mut Vec<Effect>) {
        let recovered = matches!(was, HealthState::Unhealthy | HealthState::Recovering);
        let attempts = m.recovery_attempt;

        m.status = HealthState::Healthy;
        m.recovery_attempt = 0;
        m.next_check = None;
        effects.push(Effect::SetStatus(m.backend.id.clone(), HealthStatus::Healthy));

        if recovered {
            info!(backend = %m.backend.id, source = %m.source, attempts, "Backend recovered");
            effects.push(Effect::ResetCircuit(m.backend.id.clone()));
            effects.push(Effect::Emit(HealthEvent::ProxyRecovered {
                backend: m.backend.id.clone(),
                source: m.source.clone(),
                recovery_attempts: attempts,
            }));
        } else {
            debug!(backend = %m.backend.id, "Backend healthy");
        }
    }

    fn schedule_recovery(&self, m: &mut MonitoredBackend, now: Instant) {
        let cooldown = self.config.recovery_cooldown(m.recovery_attempt);
        m.status = HealthState::Recovering;
        m.next_check = Some(now + cooldown);
        m.recovery_attempt += 1;
        debug!(
            backend = %m.backend.id,
            attempt = m.recovery_attempt,
            cooldown_secs = cooldown.as_secs_f64(),
            "Recovery scheduled"
        );
    }

    fn begin_check(&self, id: &str) -> Result<CheckingGuard<'_>> {
        let mut backends = self.backends.write();
        let m = backends.get_mut(id).ok_or_else(|| RotaError::ProxyNotFound {
            id: id.to_string(),
        })?;
        m.checking = true;
        Ok(CheckingGuard {
            checker: self,
            id: id.to_string(),
        })
    }

    fn apply(&self, effects: Vec<Effect>) {
        if effects.is_empty() {
            return;
        }

        let mut transitioned = false;
        for effect in effects {
            match effect {
                Effect::Invalidate(key) => {
                    if let Some(cache) = &self.cache {
                        if let Err(e) = cache.invalidate(&key) {
                            warn!(backend = %key, "Cache invalidation failed: {:#}", e);
                        }
                    }
                }
                Effect::SetStatus(id, status) => {
                    transitioned = true;
                    if let Some(pool) = &self.pool {
                        if let Err(e) = pool.update_status(&id, status) {
                            debug!(backend = %id, "Pool status not updated: {}", e);
                        }
                    }
                }
                Effect::ResetCircuit(id) => {
                    if let Some(breakers) = &self.circuit_breakers {
                        if let Err(e) = breakers.reset(&id) {
                            debug!(backend = %id, "Circuit not reset: {}", e);
                        }
                    }
                }
                Effect::Emit(event) => self.emit(&event),
            }
        }

        if transitioned {
            self.check_degradation();
        }
    }

    fn emit(&self, event: &HealthEvent) {
        let Some(callback) = &self.events else {
            return;
        };
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(event)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(event = event.name(), "Health event callback failed: {:#}", e),
            Err(_) => error!(event = event.name(), "Health event callback panicked"),
        }
    }

    /// Edge-triggered `pool_degraded` over backends that have been checked
    fn check_degradation(&self) {
        let overall = self.get_pool_status().overall;
        let known = overall.total - overall.unknown - overall.checking;
        let healthy_percent = if known == 0 {
            100.0
        } else {
            overall.healthy as f64 / known as f64 * 100.0
        };

        let threshold = self.config.degradation_threshold;
        if healthy_percent < threshold {
            if !self.degraded.swap(true, Ordering::SeqCst) {
                warn!(healthy_percent, threshold, "Proxy pool degraded");
                self.emit(&HealthEvent::PoolDegraded {
                    healthy_percent,
                    threshold_percent: threshold,
                });
            }
        } else if self.degraded.swap(false, Ordering::SeqCst) {
            info!(healthy_percent, "Proxy pool no longer degraded");
        }
    }

    pub fn get_backend_status(&self, url: &str) -> Option<BackendHealth> {
        let now = Instant::now();
        self.backends
            .read()
            .get(&normalize(url))
            .map(|m| m.snapshot(now))
    }

    pub fn get_all_status(&self) -> Vec<BackendHealth> {
        let now = Instant::now();
        let mut all: Vec<_> = self.backends.read().values().map(|m| m.snapshot(now)).collect();
        all.sort_by(|a, b| a.backend.cmp(&b.backend));
        all
    }

    /// Counts per state, overall and per source
    pub fn get_pool_status(&self) -> PoolHealthStatus {
        let mut status = PoolHealthStatus::default();
        for m in self.backends.read().values() {
            let state = m.effective_status();
            status.overall.record(state);
            status
                .by_source
                .entry(m.source.clone())
                .or_insert_with(HealthCounts::default)
                .record(state);
        }
        status
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Spawn a worker for every source that lacks one
    ///
    /// Safe to call again while running; sources registered since the last
    /// call get their worker, existing ones are left alone. Workers run on
    /// the runtime that was current at the first call.
    pub fn start(self: &Arc<Self>) {
        let runtime = {
            let mut runtime = self.runtime.lock();
            if runtime.is_none() {
                *runtime = Handle::try_current().ok();
            }
            runtime.clone()
        };
        let Some(runtime) = runtime else {
            warn!("Health checks need a Tokio runtime, none is running");
            return;
        };
        let _entered = runtime.enter();

        self.running.store(true, Ordering::SeqCst);
        let sources = self.sources();
        let mut workers = self.workers.lock();
        for source in sources {
            if workers.contains_key(&source) {
                continue;
            }
            let worker = HealthWorker::new(
                self.clone(),
                source.clone(),
                self.config.interval_for(&source),
                self.config.probe_concurrency,
            );
            debug!(source = %source, "Health worker started");
            workers.insert(source, worker.spawn());
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop every worker, waiting up to `timeout` for each
    ///
    /// Returns whether all workers exited in time.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.running.store(false, Ordering::SeqCst);
        let handles: Vec<_> = self.workers.lock().drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return true;
        }

        let results = futures::future::join_all(handles.into_iter().map(|h| h.stop(timeout))).await;
        let clean = results.iter().all(|&ok| ok);
        info!(workers = results.len(), clean, "Health workers stopped");
        clean
    }
}

/// Clears the in-flight flag when a probe finishes or is cancelled
struct CheckingGuard<'a> {
    checker: &'a HealthChecker,
    id: String,
}

impl Drop for CheckingGuard<'_> {
    fn drop(&mut self) {
        if let Some(m) = self.checker.backends.write().get_mut(&self.id) {
            m.checking = false;
        }
    }
}

/// Backend identity for a URL, or the input itself when it does not parse
fn normalize(url: &str) -> String {
    ProxyBackend::parse(url)
        .map(|b| b.id)
        .unwrap_or_else(|_| url.to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Probe that replays scripted status codes, then repeats `fallback`
    pub struct ScriptedProbe {
        script: Mutex<VecDeque<std::result::Result<u16, String>>>,
        fallback: std::result::Result<u16, String>,
        pub calls: AtomicUsize,
    }

    impl ScriptedProbe {
        pub fn always(code: u16) -> Self {
            Self::new(vec![], Ok(code))
        }

        pub fn failing() -> Self {
            Self::new(vec![], Err("connection refused".to_string()))
        }

        pub fn new(
            script: Vec<std::result::Result<u16, String>>,
            fallback: std::result::Result<u16, String>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn push(&self, outcome: std::result::Result<u16, String>) {
            self.script.lock().push_back(outcome);
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, _backend: &Arc<ProxyBackend>, _target_url: &str) -> Result<u16> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
                .map_err(RotaError::ProxyConnectionFailed)
        }
    }

    #[derive(Default)]
    pub struct RecordingCache {
        pub keys: Mutex<Vec<String>>,
    }

    impl CacheInvalidator for RecordingCache {
        fn invalidate(&self, backend_key: &str) -> anyhow::Result<()> {
            self.keys.lock().push(backend_key.to_string());
            Ok(())
        }
    }
}
