//! Request orchestration with failover
//!
//! Ties the pool, the active rotation strategy, circuit breakers and cached
//! upstream connections together for one logical request: select, execute,
//! classify, feed the outcome back, and retry on another backend when the
//! failure is retryable.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request, Response, Uri};
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, RequestConfig, StrategyConfig};
use crate::error::{ErrorKind, Result, RotaError};
use crate::models::{
    BackendSnapshot, BackendTags, CircuitSummary, HealthStatus, PoolStats, ProxyBackend,
    SelectionContext,
};
use crate::proxy::circuit_breaker::{CircuitBreakers, CircuitState};
use crate::proxy::client::{DefaultUpstreamFactory, Upstream, UpstreamFactory};
use crate::proxy::connection_pool::ConnectionPool;
use crate::proxy::health::HealthChecker;
use crate::proxy::pool::ProxyPool;
use crate::proxy::rotation::{ProxySelector, StrategyRegistry};

/// Decides whether a failed attempt is followed by another one
pub trait RetryPolicy: Send + Sync {
    /// `attempts` is the number of attempts made so far, all failed
    fn should_retry(&self, attempts: u32, error: &RotaError) -> bool;

    /// Pause before the next attempt
    fn backoff(&self, _attempts: u32) -> Duration {
        Duration::ZERO
    }
}

/// Retry retryable errors up to `max_retries` times with a fixed delay
#[derive(Debug, Clone)]
pub struct FixedRetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl FixedRetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl RetryPolicy for FixedRetryPolicy {
    fn should_retry(&self, attempts: u32, error: &RotaError) -> bool {
        error.is_retryable() && attempts <= self.max_retries
    }

    fn backoff(&self, _attempts: u32) -> Duration {
        self.delay
    }
}

/// The active strategy and the name it was created under
struct SelectorSlot {
    name: String,
    selector: Arc<dyn ProxySelector>,
}

/// Result of one attempt as the feedback paths see it
#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure(ErrorKind),
}

/// The engine's request path
pub struct Orchestrator {
    pool: Arc<ProxyPool>,
    registry: Arc<StrategyRegistry>,
    strategy_config: RwLock<StrategyConfig>,
    selector: ArcSwap<SelectorSlot>,
    breakers: Arc<CircuitBreakers>,
    connections: ConnectionPool<dyn Upstream>,
    upstreams: Arc<dyn UpstreamFactory>,
    retry_policy: Arc<dyn RetryPolicy>,
    health: Option<Arc<HealthChecker>>,
    ema_alpha: f64,
}

impl Orchestrator {
    /// Build an engine with the built-in strategies
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_registry(config, Arc::new(StrategyRegistry::with_builtins()))
    }

    /// Build an engine resolving strategies through `registry`
    pub fn with_registry(config: &Config, registry: Arc<StrategyRegistry>) -> Result<Self> {
        let selector = registry.create(&config.strategy.strategy, &config.strategy)?;
        let RequestConfig {
            max_retries,
            connect_timeout,
            request_timeout,
        } = config.request.clone();

        info!(
            pool = %config.pool.name,
            strategy = %config.strategy.strategy,
            max_pool_size = config.pool.max_pool_size,
            "Creating proxy orchestrator"
        );

        Ok(Self {
            pool: Arc::new(ProxyPool::new(
                config.pool.name.clone(),
                config.pool.max_pool_size,
            )),
            registry,
            strategy_config: RwLock::new(config.strategy.clone()),
            selector: ArcSwap::from_pointee(SelectorSlot {
                name: config.strategy.strategy.trim().to_lowercase(),
                selector,
            }),
            breakers: Arc::new(CircuitBreakers::new(config.circuit_breaker.clone())),
            connections: ConnectionPool::new(config.pool.connection_pool_size),
            upstreams: Arc::new(DefaultUpstreamFactory {
                connect_timeout,
                request_timeout,
            }),
            retry_policy: Arc::new(FixedRetryPolicy::new(max_retries)),
            health: None,
            ema_alpha: config.pool.ema_alpha,
        })
    }

    pub fn with_upstream_factory(mut self, factory: Arc<dyn UpstreamFactory>) -> Self {
        self.connections.clear();
        self.upstreams = factory;
        self
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Attach a health checker that monitors every registered backend
    ///
    /// The checker is wired to this engine's pool and breakers so its
    /// verdicts gate selection directly.
    pub fn with_health_checker(mut self, checker: HealthChecker) -> Self {
        let checker = Arc::new(
            checker
                .with_pool(self.pool.clone())
                .with_circuit_breakers(self.breakers.clone()),
        );
        for backend in self.pool.get_all() {
            if let Err(e) = checker.add_parsed(backend.clone()) {
                warn!(backend = %backend.id, "Failed to monitor backend: {}", e);
            }
        }
        self.health = Some(checker);
        self
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.registry
    }

    pub fn health_checker(&self) -> Option<&Arc<HealthChecker>> {
        self.health.as_ref()
    }

    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Register a backend, or update the record of a known one
    ///
    /// New backends are admitted as healthy; a re-registered backend keeps
    /// its statistics and health.
    #[instrument(skip(self, tags))]
    pub fn add_backend(&self, url: &str, source: &str, tags: BackendTags) -> Result<Arc<ProxyBackend>> {
        let parsed = ProxyBackend::parse(url)?
            .with_source(source)
            .with_ema_alpha(self.ema_alpha);
        let mut backend = tags.apply(parsed);
        if !self.pool.contains(&backend.id) {
            backend = backend.with_status(HealthStatus::Healthy);
        }

        let backend = self.pool.add(backend)?;
        self.breakers.attach(&backend.id);
        // A cached connection may carry the previous record's credentials
        self.connections.remove(&backend.id);
        if let Some(health) = &self.health {
            health.add_parsed(backend.clone())?;
            // A source first seen after start needs its own worker
            if health.is_running() {
                health.start();
            }
        }

        info!(backend = %backend.id, "Registered proxy backend");
        Ok(backend)
    }

    /// Remove a backend by identity or URL
    ///
    /// Requests already in flight against it complete normally; it is
    /// simply never selected again.
    #[instrument(skip(self))]
    pub fn remove_backend(&self, id: &str) -> Result<Arc<ProxyBackend>> {
        let id = ProxyBackend::parse(id)
            .map(|b| b.id)
            .unwrap_or_else(|_| id.to_string());
        let backend = self
            .pool
            .remove(&id)
            .ok_or_else(|| RotaError::ProxyNotFound { id: id.clone() })?;
        self.forget(&id);
        info!(backend = %id, "Removed proxy backend");
        Ok(backend)
    }

    /// Drop every backend past its TTL, returning how many were removed
    pub fn clear_expired(&self) -> usize {
        let expired = self.pool.drain_expired();
        for backend in &expired {
            self.forget(&backend.id);
        }
        expired.len()
    }

    fn forget(&self, id: &str) {
        self.breakers.detach(id);
        self.connections.remove(id);
        self.selector.load().selector.forget_backend(id);
        if let Some(health) = &self.health {
            health.remove_backend(id);
        }
    }

    /// Pick a backend for one request
    ///
    /// Only healthy, unexpired backends whose breaker admits traffic are
    /// candidates. A half-open breaker admits a single trial; when a
    /// concurrent caller wins that trial the pick is retried without it.
    #[instrument(skip(self, context), fields(strategy = %self.strategy_name()))]
    pub fn select(&self, context: &SelectionContext) -> Result<Arc<ProxyBackend>> {
        let slot = self.selector.load_full();
        let mut narrowed: Option<SelectionContext> = None;

        loop {
            let ctx = narrowed.as_ref().unwrap_or(context);
            let candidates = self
                .pool
                .get_healthy_where(|b| self.breakers.is_available(&b.id));
            let backend = slot.selector.select(&candidates, ctx)?;

            if self.breakers.try_acquire(&backend.id) {
                debug!(backend = %backend.id, "Selected proxy backend");
                return Ok(backend);
            }

            backend.cancel_selection();
            debug!(backend = %backend.id, "Half-open trial already taken, reselecting");
            narrowed
                .get_or_insert_with(|| context.clone())
                .exclude(backend.id.clone());
        }
    }

    /// Send a bodiless request through the pool
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        context: &SelectionContext,
    ) -> Result<Response<Full<Bytes>>> {
        let uri: Uri = url
            .parse()
            .map_err(|e| RotaError::InvalidRequest(format!("{}: {}", url, e)))?;
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Bytes::new())
            .map_err(|e| RotaError::InvalidRequest(e.to_string()))?;
        self.execute_request(request, context).await
    }

    /// Send a request through the pool, failing over between backends
    ///
    /// 401/407 answers surface as `AuthenticationRequired` without a retry.
    /// Transport failures and timeouts are retried on another backend while
    /// the retry policy allows; once it refuses, or no backend is left, the
    /// caller gets `AllProxiesExhausted` naming the last backend tried.
    #[instrument(skip(self, request, context), fields(method = %request.method(), uri = %request.uri()))]
    pub async fn execute_request(
        &self,
        request: Request<Bytes>,
        context: &SelectionContext,
    ) -> Result<Response<Full<Bytes>>> {
        let (parts, body) = request.into_parts();
        let mut context = context.clone();
        let mut attempts = 0u32;
        let mut last_failure: Option<(String, ErrorKind)> = None;

        loop {
            let backend = match self.select(&context) {
                Ok(backend) => backend,
                Err(RotaError::NoProxiesAvailable) => {
                    return Err(match last_failure {
                        Some((last_backend, kind)) => RotaError::AllProxiesExhausted {
                            attempts,
                            last_backend,
                            kind,
                        },
                        None => RotaError::NoProxiesAvailable,
                    });
                }
                Err(e) => return Err(e),
            };
            attempts += 1;

            debug!(
                "Attempting request through proxy {} (attempt {})",
                backend.id, attempts
            );

            let mut attempt = Request::new(Full::new(body.clone()));
            *attempt.method_mut() = parts.method.clone();
            *attempt.uri_mut() = parts.uri.clone();
            *attempt.headers_mut() = parts.headers.clone();

            let started = Instant::now();
            let result = self.send_via(&backend, attempt).await;
            let elapsed = started.elapsed();

            let error = match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if status == 401 || status == 407 {
                        self.record_outcome(
                            &backend,
                            Outcome::Failure(ErrorKind::Authentication),
                            Some(elapsed),
                        );
                        warn!(backend = %backend.id, status, "Upstream requires authentication");
                        return Err(RotaError::AuthenticationRequired {
                            backend: backend.id.clone(),
                            status,
                        });
                    }

                    self.record_outcome(&backend, Outcome::Success, Some(elapsed));
                    debug!(
                        backend = %backend.id,
                        status,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Request completed"
                    );
                    return Ok(response);
                }
                Err(e) => e,
            };

            let kind = error.kind();
            if kind == ErrorKind::Other {
                // Not the backend's fault (e.g. a target this transport cannot carry)
                backend.cancel_selection();
                if let Some(breaker) = self.breakers.get(&backend.id) {
                    breaker.release_trial();
                }
                return Err(error);
            }

            self.record_outcome(&backend, Outcome::Failure(kind), Some(elapsed));
            if kind == ErrorKind::Authentication {
                return Err(error);
            }

            warn!(
                backend = %backend.id,
                kind = %kind,
                "Request through proxy failed: {} (attempt {})",
                error,
                attempts
            );
            self.connections.remove(&backend.id);

            if !self.retry_policy.should_retry(attempts, &error) {
                return Err(RotaError::AllProxiesExhausted {
                    attempts,
                    last_backend: backend.id.clone(),
                    kind,
                });
            }

            let delay = self.retry_policy.backoff(attempts);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            context.exclude(backend.id.clone());
            last_failure = Some((backend.id.clone(), kind));
        }
    }

    async fn send_via(
        &self,
        backend: &Arc<ProxyBackend>,
        request: Request<Full<Bytes>>,
    ) -> Result<Response<Full<Bytes>>> {
        let upstream = self
            .connections
            .get_or_create(&backend.id, || Ok(self.upstreams.create(backend)))?;
        upstream.send(request).await
    }

    /// Feed back the result of a request made with a backend from [`select`](Self::select)
    ///
    /// A failure without an error kind counts as a transport failure.
    pub fn report_result(
        &self,
        backend_id: &str,
        success: bool,
        response_time: Option<Duration>,
        error_kind: Option<ErrorKind>,
    ) -> Result<()> {
        let backend = self
            .pool
            .get(backend_id)
            .ok_or_else(|| RotaError::ProxyNotFound {
                id: backend_id.to_string(),
            })?;
        let outcome = if success {
            Outcome::Success
        } else {
            Outcome::Failure(error_kind.unwrap_or(ErrorKind::Transport))
        };
        self.record_outcome(&backend, outcome, response_time);
        Ok(())
    }

    fn record_outcome(&self, backend: &ProxyBackend, outcome: Outcome, response_time: Option<Duration>) {
        let success = matches!(outcome, Outcome::Success);
        backend.complete_request(success, response_time);
        self.selector
            .load()
            .selector
            .record_result(backend, success, response_time);

        // A backend removed mid-request has no breaker left to update
        let Some(breaker) = self.breakers.get(&backend.id) else {
            return;
        };
        match outcome {
            Outcome::Success => breaker.record_success(),
            Outcome::Failure(kind) if kind.trips_circuit() => breaker.record_failure(),
            Outcome::Failure(_) => breaker.release_trial(),
        }
    }

    /// End sticky affinity for a session
    pub fn close_session(&self, session_id: &str) -> bool {
        self.selector.load().selector.close_session(session_id)
    }

    pub fn strategy_name(&self) -> String {
        self.selector.load().name.clone()
    }

    /// Swap the active strategy without disturbing in-flight selections
    #[instrument(skip(self))]
    pub fn set_strategy(&self, name: &str) -> Result<()> {
        let config = self.strategy_config.read().clone();
        let selector = self.registry.create(name, &config)?;
        let name = name.trim().to_lowercase();
        self.selector.store(Arc::new(SelectorSlot {
            name: name.clone(),
            selector,
        }));
        self.strategy_config.write().strategy = name.clone();
        info!(strategy = %name, "Rotation strategy changed");
        Ok(())
    }

    /// Apply new strategy tunables to the active strategy
    pub fn configure_strategy(&self, config: StrategyConfig) {
        self.selector.load().selector.configure(&config);
        let mut current = self.strategy_config.write();
        let strategy = std::mem::take(&mut current.strategy);
        *current = StrategyConfig { strategy, ..config };
    }

    pub fn get_circuit_breaker_states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers.states()
    }

    pub fn reset_circuit_breaker(&self, backend_id: &str) -> Result<()> {
        self.breakers.reset(backend_id)?;
        info!(backend = %backend_id, "Circuit breaker reset");
        Ok(())
    }

    /// Metrics summary over the whole pool
    pub fn get_pool_stats(&self) -> PoolStats {
        let backends = self.pool.get_all();
        let mut circuit_breakers = CircuitSummary::default();
        let mut snapshots = Vec::with_capacity(backends.len());
        let mut eligible_backends = 0;

        for backend in &backends {
            let state = self.breakers.state(&backend.id);
            circuit_breakers.record(state);
            if backend.is_eligible() && state != CircuitState::Open {
                eligible_backends += 1;
            }
            snapshots.push(BackendSnapshot::new(backend, state));
        }

        let total_requests: u64 = snapshots.iter().map(|s| s.total_requests).sum();
        let total_failures: u64 = snapshots.iter().map(|s| s.total_failures).sum();
        let total_successes = total_requests.saturating_sub(total_failures);
        let success_rate = if total_requests == 0 {
            0.0
        } else {
            total_successes as f64 / total_requests as f64 * 100.0
        };

        PoolStats {
            pool: self.pool.name().to_string(),
            strategy: self.strategy_name(),
            total_backends: backends.len(),
            eligible_backends,
            max_pool_size: self.pool.capacity(),
            total_requests,
            total_successes,
            total_failures,
            success_rate,
            open_connections: self.connections.len(),
            circuit_breakers,
            backends: snapshots,
        }
    }

    /// Start background health checking; false when no checker is attached
    pub fn start_health_checks(&self) -> bool {
        match &self.health {
            Some(health) => {
                health.start();
                true
            }
            None => false,
        }
    }

    /// Stop background health checking, waiting up to `timeout`
    pub async fn stop_health_checks(&self, timeout: Duration) -> bool {
        match &self.health {
            Some(health) => health.stop(timeout).await,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::connection_pool::PooledConnection;
    use async_trait::async_trait;
    use hyper::StatusCode;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Upstream answering from a per-backend script
    struct FakeUpstream {
        backend: String,
        behaviour: Behaviour,
        calls: Arc<AtomicUsize>,
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Status(u16),
        Refuse,
        Reject,
    }

    impl PooledConnection for FakeUpstream {
        fn close(&self) {}
    }

    #[async_trait]
    impl Upstream for FakeUpstream {
        async fn send(&self, _request: Request<Full<Bytes>>) -> Result<Response<Full<Bytes>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Status(code) => {
                    let mut response = Response::new(Full::new(Bytes::from(self.backend.clone())));
                    *response.status_mut() = StatusCode::from_u16(code).unwrap();
                    Ok(response)
                }
                Behaviour::Refuse => Err(RotaError::ProxyConnectionFailed(format!(
                    "{} refused",
                    self.backend
                ))),
                Behaviour::Reject => Err(RotaError::InvalidRequest("unsupported".to_string())),
            }
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        behaviours: HashMap<String, Behaviour>,
        calls: Arc<AtomicUsize>,
    }

    impl FakeFactory {
        fn with(mut self, url: &str, behaviour: Behaviour) -> Self {
            let id = ProxyBackend::parse(url).unwrap().id;
            self.behaviours.insert(id, behaviour);
            self
        }
    }

    impl UpstreamFactory for FakeFactory {
        fn create(&self, backend: &Arc<ProxyBackend>) -> Arc<dyn Upstream> {
            Arc::new(FakeUpstream {
                backend: backend.id.clone(),
                behaviour: self
                    .behaviours
                    .get(&backend.id)
                    .copied()
                    .unwrap_or(Behaviour::Status(200)),
                calls: self.calls.clone(),
            })
        }
    }

    fn orchestrator(factory: FakeFactory) -> Orchestrator {
        Orchestrator::new(&Config::default())
            .unwrap()
            .with_upstream_factory(Arc::new(factory))
    }

    fn add(orch: &Orchestrator, n: u8) -> Arc<ProxyBackend> {
        orch.add_backend(&format!("http://10.0.0.{}:8080", n), "test", BackendTags::default())
            .unwrap()
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let mut config = Config::default();
        config.strategy.strategy = "fastest".to_string();
        assert!(matches!(
            Orchestrator::new(&config),
            Err(RotaError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn test_add_and_remove_backend() {
        let orch = orchestrator(FakeFactory::default());
        let backend = add(&orch, 1);

        assert_eq!(backend.health_status(), HealthStatus::Healthy);
        assert_eq!(
            orch.get_circuit_breaker_states().get(&backend.id),
            Some(&CircuitState::Closed)
        );

        assert!(orch.remove_backend("http://10.0.0.1:8080").is_ok());
        assert!(orch.get_circuit_breaker_states().is_empty());
        assert!(matches!(
            orch.remove_backend(&backend.id),
            Err(RotaError::ProxyNotFound { .. })
        ));
        assert!(matches!(
            orch.select(&SelectionContext::new()),
            Err(RotaError::NoProxiesAvailable)
        ));
    }

    #[test]
    fn test_add_backend_rejects_malformed_url() {
        let orch = orchestrator(FakeFactory::default());
        assert!(orch
            .add_backend("http://", "test", BackendTags::default())
            .is_err());
        assert!(orch
            .add_backend("ftp://1.2.3.4:21", "test", BackendTags::default())
            .is_err());
    }

    #[test]
    fn test_readd_keeps_health_and_stats() {
        let orch = orchestrator(FakeFactory::default());
        let backend = add(&orch, 1);
        backend.set_health_status(HealthStatus::Unhealthy);
        orch.report_result(&backend.id, true, Some(Duration::from_millis(10)), None)
            .unwrap();

        let readded = orch
            .add_backend(
                "http://10.0.0.1:8080",
                "test",
                BackendTags::default().with_country("de"),
            )
            .unwrap();
        assert_eq!(readded.health_status(), HealthStatus::Unhealthy);
        assert_eq!(readded.stats().total_requests, 1);
        assert_eq!(readded.country.as_deref(), Some("DE"));
        assert_eq!(orch.pool().len(), 1);
    }

    #[test]
    fn test_open_circuit_excludes_backend() {
        let orch = orchestrator(FakeFactory::default());
        let a = add(&orch, 1);
        let b = add(&orch, 2);

        for _ in 0..5 {
            orch.report_result(&a.id, false, None, None).unwrap();
        }
        assert_eq!(orch.get_circuit_breaker_states()[&a.id], CircuitState::Open);

        for _ in 0..10 {
            assert_eq!(orch.select(&SelectionContext::new()).unwrap().id, b.id);
        }

        orch.reset_circuit_breaker(&a.id).unwrap();
        assert_eq!(orch.get_circuit_breaker_states()[&a.id], CircuitState::Closed);
        assert!(matches!(
            orch.reset_circuit_breaker("http://9.9.9.9:80"),
            Err(RotaError::ProxyNotFound { .. })
        ));
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let mut config = Config::default();
        config.circuit_breaker.failure_threshold = 1;
        config.circuit_breaker.timeout_duration = Duration::from_millis(20);
        let orch = Orchestrator::new(&config).unwrap();
        let a = add(&orch, 1);

        orch.report_result(&a.id, false, None, None).unwrap();
        assert!(matches!(
            orch.select(&SelectionContext::new()),
            Err(RotaError::NoProxiesAvailable)
        ));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(orch.select(&SelectionContext::new()).unwrap().id, a.id);
        // The trial is taken until its result arrives
        assert!(matches!(
            orch.select(&SelectionContext::new()),
            Err(RotaError::NoProxiesAvailable)
        ));

        orch.report_result(&a.id, true, Some(Duration::from_millis(5)), None)
            .unwrap();
        assert_eq!(orch.get_circuit_breaker_states()[&a.id], CircuitState::Closed);
    }

    #[test]
    fn test_authentication_failures_do_not_trip_circuit() {
        let orch = orchestrator(FakeFactory::default());
        let a = add(&orch, 1);
        for _ in 0..10 {
            orch.report_result(&a.id, false, None, Some(ErrorKind::Authentication))
                .unwrap();
        }
        assert_eq!(orch.get_circuit_breaker_states()[&a.id], CircuitState::Closed);
        assert!(matches!(
            orch.report_result("http://9.9.9.9:80", true, None, None),
            Err(RotaError::ProxyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_execute_success_records_result() {
        let orch = orchestrator(FakeFactory::default());
        let a = add(&orch, 1);

        let response = orch
            .execute(Method::GET, "http://example.com/", &SelectionContext::new())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stats = a.stats();
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.in_flight(), 0);
        assert!(stats.ema_response_time_ms.is_some());
        assert_eq!(orch.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_execute_fails_over_to_next_backend() {
        let factory = FakeFactory::default().with("http://10.0.0.1:8080", Behaviour::Refuse);
        let calls = factory.calls.clone();
        let orch = orchestrator(factory);
        let a = add(&orch, 1);
        let b = add(&orch, 2);

        // Round-robin hands out backend 1 first
        let response = orch
            .execute(Method::GET, "http://example.com/", &SelectionContext::new())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(a.stats().total_failures, 1);
        assert_eq!(b.stats().total_successes, 1);
        // The failed connection is not kept
        assert_eq!(orch.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_execute_exhaustion_names_last_backend() {
        let factory = FakeFactory::default()
            .with("http://10.0.0.1:8080", Behaviour::Refuse)
            .with("http://10.0.0.2:8080", Behaviour::Refuse);
        let orch = orchestrator(factory);
        add(&orch, 1);
        let b = add(&orch, 2);

        let err = orch
            .execute(Method::GET, "http://example.com/", &SelectionContext::new())
            .await
            .unwrap_err();
        match err {
            RotaError::AllProxiesExhausted {
                attempts,
                last_backend,
                kind,
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_backend, b.id);
                assert_eq!(kind, ErrorKind::Transport);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_respects_retry_policy() {
        let factory = FakeFactory::default()
            .with("http://10.0.0.1:8080", Behaviour::Refuse)
            .with("http://10.0.0.2:8080", Behaviour::Refuse);
        let calls = factory.calls.clone();
        let orch = orchestrator(factory).with_retry_policy(Arc::new(FixedRetryPolicy::new(0)));
        add(&orch, 1);
        add(&orch, 2);

        let err = orch
            .execute(Method::GET, "http://example.com/", &SelectionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RotaError::AllProxiesExhausted { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_surfaces_authentication_without_retry() {
        let factory = FakeFactory::default().with("http://10.0.0.1:8080", Behaviour::Status(407));
        let calls = factory.calls.clone();
        let orch = orchestrator(factory);
        let a = add(&orch, 1);
        add(&orch, 2);

        let err = orch
            .execute(Method::GET, "http://example.com/", &SelectionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RotaError::AuthenticationRequired { status: 407, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(orch.get_circuit_breaker_states()[&a.id], CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_trial_returned_when_outcome_is_not_the_backends() {
        for behaviour in [Behaviour::Status(401), Behaviour::Reject] {
            let mut config = Config::default();
            config.circuit_breaker.failure_threshold = 1;
            config.circuit_breaker.timeout_duration = Duration::from_millis(100);
            let factory = FakeFactory::default().with("http://10.0.0.1:8080", behaviour);
            let orch = Orchestrator::new(&config)
                .unwrap()
                .with_upstream_factory(Arc::new(factory));
            let a = add(&orch, 1);

            orch.report_result(&a.id, false, None, None).unwrap();
            tokio::time::sleep(Duration::from_millis(130)).await;
            assert_eq!(orch.get_circuit_breaker_states()[&a.id], CircuitState::HalfOpen);

            assert!(orch
                .execute(Method::GET, "http://example.com/", &SelectionContext::new())
                .await
                .is_err());

            // Still half-open, and the trial is free for the next caller right away
            assert_eq!(orch.get_circuit_breaker_states()[&a.id], CircuitState::HalfOpen);
            assert_eq!(orch.select(&SelectionContext::new()).unwrap().id, a.id);
        }
    }

    #[tokio::test]
    async fn test_execute_on_empty_pool_fails_fast() {
        let orch = orchestrator(FakeFactory::default());
        let err = orch
            .execute(Method::GET, "http://example.com/", &SelectionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RotaError::NoProxiesAvailable));
    }

    #[tokio::test]
    async fn test_execute_request_errors_are_not_blamed_on_backend() {
        let factory = FakeFactory::default().with("http://10.0.0.1:8080", Behaviour::Reject);
        let orch = orchestrator(factory);
        let a = add(&orch, 1);

        let err = orch
            .execute(Method::GET, "http://example.com/", &SelectionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RotaError::InvalidRequest(_)));
        assert_eq!(a.stats().total_failures, 0);
        assert_eq!(a.stats().in_flight(), 0);
    }

    #[test]
    fn test_set_strategy_swaps_and_validates() {
        let orch = orchestrator(FakeFactory::default());
        assert_eq!(orch.strategy_name(), "round_robin");

        orch.set_strategy("least_used").unwrap();
        assert_eq!(orch.strategy_name(), "least_used");

        assert!(matches!(
            orch.set_strategy("nope"),
            Err(RotaError::UnknownStrategy(_))
        ));
        assert_eq!(orch.strategy_name(), "least_used");
    }

    #[test]
    fn test_session_strategy_through_orchestrator() {
        let mut config = Config::default();
        config.strategy.strategy = "session_persistence".to_string();
        let orch = Orchestrator::new(&config).unwrap();
        for n in 1..=3 {
            add(&orch, n);
        }

        let ctx = SelectionContext::new().with_session("user-1");
        let first = orch.select(&ctx).unwrap();
        for _ in 0..50 {
            assert_eq!(orch.select(&ctx).unwrap().id, first.id);
        }

        orch.remove_backend(&first.id).unwrap();
        let second = orch.select(&ctx).unwrap();
        assert_ne!(second.id, first.id);
        assert!(orch.close_session("user-1"));
        assert!(!orch.close_session("user-1"));
    }

    #[test]
    fn test_clear_expired_detaches_backends() {
        let orch = orchestrator(FakeFactory::default());
        add(&orch, 1);
        orch.add_backend(
            "http://10.0.0.2:8080",
            "test",
            BackendTags::default().with_ttl(Duration::ZERO),
        )
        .unwrap();

        assert_eq!(orch.clear_expired(), 1);
        assert_eq!(orch.pool().len(), 1);
        assert_eq!(orch.get_circuit_breaker_states().len(), 1);
    }

    #[test]
    fn test_pool_stats_summary() {
        let orch = orchestrator(FakeFactory::default());
        let a = add(&orch, 1);
        let b = add(&orch, 2);
        b.set_health_status(HealthStatus::Unhealthy);

        orch.report_result(&a.id, true, Some(Duration::from_millis(20)), None)
            .unwrap();
        orch.report_result(&a.id, false, None, Some(ErrorKind::Timeout))
            .unwrap();

        let stats = orch.get_pool_stats();
        assert_eq!(stats.total_backends, 2);
        assert_eq!(stats.eligible_backends, 1);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.total_failures, 1);
        assert!((stats.success_rate - 50.0).abs() < f64::EPSILON);
        assert_eq!(stats.circuit_breakers.closed, 2);
        assert_eq!(stats.strategy, "round_robin");
    }
}
