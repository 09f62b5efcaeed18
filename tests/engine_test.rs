use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request, Response};

use rota_engine::models::{HealthEvent, HealthState};
use rota_engine::proxy::health::HealthAction;
use rota_engine::proxy::{
    CacheInvalidator, CircuitState, HealthCheckConfig, HealthChecker, HealthProbe,
    PooledConnection, Upstream, UpstreamFactory,
};
use rota_engine::{
    BackendTags, Config, HealthStatus, Orchestrator, ProxyBackend, Result, RotaError,
    SelectionContext,
};

struct AlwaysOk;

impl PooledConnection for AlwaysOk {
    fn close(&self) {}
}

#[async_trait]
impl Upstream for AlwaysOk {
    async fn send(&self, _request: Request<Full<Bytes>>) -> Result<Response<Full<Bytes>>> {
        Ok(Response::new(Full::new(Bytes::from_static(b"ok"))))
    }
}

struct AlwaysOkFactory;

impl UpstreamFactory for AlwaysOkFactory {
    fn create(&self, _backend: &Arc<ProxyBackend>) -> Arc<dyn Upstream> {
        Arc::new(AlwaysOk)
    }
}

struct FailingProbe {
    calls: AtomicUsize,
}

#[async_trait]
impl HealthProbe for FailingProbe {
    async fn probe(&self, _backend: &Arc<ProxyBackend>, _target_url: &str) -> Result<u16> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RotaError::ProxyConnectionFailed("connection refused".to_string()))
    }
}

#[derive(Default)]
struct RecordingCache {
    keys: Mutex<Vec<String>>,
}

impl CacheInvalidator for RecordingCache {
    fn invalidate(&self, backend_key: &str) -> anyhow::Result<()> {
        self.keys.lock().unwrap().push(backend_key.to_string());
        Ok(())
    }
}

fn engine(strategy: &str) -> Orchestrator {
    let mut config = Config::default();
    config.strategy.strategy = strategy.to_string();
    Orchestrator::new(&config)
        .unwrap()
        .with_upstream_factory(Arc::new(AlwaysOkFactory))
}

fn register(engine: &Orchestrator, n: usize) -> Vec<Arc<ProxyBackend>> {
    (1..=n)
        .map(|i| {
            engine
                .add_backend(
                    &format!("http://10.1.0.{}:3128", i),
                    "loader",
                    BackendTags::default(),
                )
                .unwrap()
        })
        .collect()
}

#[tokio::test]
async fn round_robin_spreads_evenly_and_honours_removal() {
    let engine = engine("round_robin");
    let backends = register(&engine, 5);
    let ctx = SelectionContext::new();

    let mut histogram: HashMap<String, usize> = HashMap::new();
    for _ in 0..100 {
        let backend = engine.select(&ctx).unwrap();
        engine
            .report_result(&backend.id, true, Some(Duration::from_millis(15)), None)
            .unwrap();
        *histogram.entry(backend.id.clone()).or_default() += 1;
    }
    assert_eq!(histogram.len(), 5);
    assert!(histogram.values().all(|&count| (19..=21).contains(&count)));

    let removed = backends[2].id.clone();
    engine.remove_backend(&removed).unwrap();
    for _ in 0..40 {
        let backend = engine.select(&ctx).unwrap();
        assert_ne!(backend.id, removed);
        engine
            .report_result(&backend.id, true, Some(Duration::from_millis(15)), None)
            .unwrap();
    }

    let response = engine
        .execute(Method::GET, "http://example.com/", &ctx)
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let stats = engine.get_pool_stats();
    assert_eq!(stats.total_backends, 4);
    assert_eq!(stats.circuit_breakers.closed, 4);
}

#[tokio::test]
async fn failed_probes_mark_backend_unhealthy_once() {
    let base = Duration::from_secs(60);
    let config = HealthCheckConfig {
        failure_threshold: 3,
        recovery_cooldown_base: base,
        ..HealthCheckConfig::default()
    };
    let probe = Arc::new(FailingProbe {
        calls: AtomicUsize::new(0),
    });
    let cache = Arc::new(RecordingCache::default());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();

    let checker = HealthChecker::new(config)
        .with_probe(probe.clone())
        .with_cache(cache.clone())
        .with_event_callback(Arc::new(move |event: &HealthEvent| -> anyhow::Result<()> {
            sink.lock().unwrap().push(event.name());
            Ok(())
        }));

    let engine = engine("round_robin").with_health_checker(checker);
    let backend = register(&engine, 1).remove(0);
    let health = engine.health_checker().unwrap().clone();

    for _ in 0..3 {
        health.check_and_update(&backend.id).await.unwrap();
    }
    let scheduled_at = Instant::now();

    assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    assert_eq!(backend.health_status(), HealthStatus::Unhealthy);
    assert_eq!(cache.keys.lock().unwrap().as_slice(), &[backend.id.clone()]);
    assert!(events.lock().unwrap().contains(&"proxy_down"));

    let status = health.get_backend_status(&backend.id).unwrap();
    assert_eq!(status.status, HealthState::Recovering);
    assert_eq!(status.consecutive_failures, 3);

    // Nothing is due before the base cooldown has passed
    let before = scheduled_at + base - Duration::from_secs(1);
    assert!(health.due_backends("loader", before).is_empty());
    let after = scheduled_at + base + Duration::from_secs(1);
    assert_eq!(
        health.due_backends("loader", after),
        vec![(backend.id.clone(), HealthAction::Recover)]
    );

    assert!(matches!(
        engine.select(&SelectionContext::new()),
        Err(RotaError::NoProxiesAvailable)
    ));

    let pool = health.get_pool_status();
    assert_eq!(pool.overall.total, 1);
    assert_eq!(pool.overall.sum(), 1);
    assert_eq!(pool.overall.recovering, 1);
    assert_eq!(pool.by_source["loader"].sum(), 1);
}

struct CountingProbe {
    calls: Mutex<HashMap<String, usize>>,
}

#[async_trait]
impl HealthProbe for CountingProbe {
    async fn probe(&self, backend: &Arc<ProxyBackend>, _target_url: &str) -> Result<u16> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(backend.id.clone())
            .or_default() += 1;
        Ok(200)
    }
}

#[tokio::test]
async fn sources_added_after_start_are_probed() {
    let probe = Arc::new(CountingProbe {
        calls: Mutex::new(HashMap::new()),
    });
    let config = HealthCheckConfig {
        check_interval: Duration::from_millis(10),
        ..HealthCheckConfig::default()
    };
    let engine = engine("round_robin")
        .with_health_checker(HealthChecker::new(config).with_probe(probe.clone()));

    let early = engine
        .add_backend("http://10.0.0.1:8080", "a", BackendTags::default())
        .unwrap();
    assert!(engine.start_health_checks());

    let late = engine
        .add_backend("http://10.0.0.2:8080", "b", BackendTags::default())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(engine.stop_health_checks(Duration::from_secs(1)).await);

    let calls = probe.calls.lock().unwrap().clone();
    assert!(calls.get(&early.id).copied().unwrap_or(0) > 0);
    assert!(calls.get(&late.id).copied().unwrap_or(0) > 0);

    let health = engine.health_checker().unwrap();
    assert_eq!(
        health.get_backend_status(&late.id).unwrap().status,
        HealthState::Healthy
    );
    assert!(!health.is_running());
}

#[test]
fn sticky_sessions_fail_over_and_stick_again() {
    let engine = engine("session_persistence");
    register(&engine, 4);
    let ctx = SelectionContext::new().with_session("checkout-42");

    let first = engine.select(&ctx).unwrap();
    for _ in 0..1000 {
        assert_eq!(engine.select(&ctx).unwrap().id, first.id);
    }

    first.set_health_status(HealthStatus::Unhealthy);
    let second = engine.select(&ctx).unwrap();
    assert_ne!(second.id, first.id);
    assert!(second.is_eligible());
    for _ in 0..100 {
        assert_eq!(engine.select(&ctx).unwrap().id, second.id);
    }

    assert!(matches!(
        engine.select(&SelectionContext::new()),
        Err(RotaError::InvalidArgument(_))
    ));
}

#[test]
fn circuit_breaker_cycle() {
    let mut config = Config::default();
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.timeout_duration = Duration::from_millis(50);
    let engine = Orchestrator::new(&config).unwrap();
    let backend = register(&engine, 1).remove(0);

    for _ in 0..3 {
        engine
            .report_result(&backend.id, false, None, None)
            .unwrap();
    }
    assert_eq!(
        engine.get_circuit_breaker_states()[&backend.id],
        CircuitState::Open
    );
    assert!(engine.select(&SelectionContext::new()).is_err());

    std::thread::sleep(Duration::from_millis(70));
    assert_eq!(
        engine.get_circuit_breaker_states()[&backend.id],
        CircuitState::HalfOpen
    );

    // Failed trial reopens
    let trial = engine.select(&SelectionContext::new()).unwrap();
    engine.report_result(&trial.id, false, None, None).unwrap();
    assert_eq!(
        engine.get_circuit_breaker_states()[&backend.id],
        CircuitState::Open
    );

    // Successful trial closes
    std::thread::sleep(Duration::from_millis(70));
    let trial = engine.select(&SelectionContext::new()).unwrap();
    engine
        .report_result(&trial.id, true, Some(Duration::from_millis(5)), None)
        .unwrap();
    assert_eq!(
        engine.get_circuit_breaker_states()[&backend.id],
        CircuitState::Closed
    );
}

#[test]
fn least_used_stays_balanced_under_concurrency() {
    let engine = Arc::new(engine("least_used"));
    let backends = register(&engine, 6);

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                let ctx = SelectionContext::new();
                for _ in 0..200 {
                    engine.select(&ctx).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let started: Vec<u64> = backends.iter().map(|b| b.requests_started()).collect();
    let max = started.iter().max().unwrap();
    let min = started.iter().min().unwrap();
    assert!(max - min <= 1, "spread {:?}", started);
}

#[test]
fn geo_targeting_with_fallback() {
    let engine = engine("geo_targeted");
    engine
        .add_backend(
            "socks5://10.2.0.1:1080",
            "geo",
            BackendTags::default().with_country("US"),
        )
        .unwrap();
    let de = engine
        .add_backend(
            "socks5://10.2.0.2:1080",
            "geo",
            BackendTags::default().with_country("DE"),
        )
        .unwrap();

    let ctx = SelectionContext::new().with_country("de");
    for _ in 0..10 {
        assert_eq!(engine.select(&ctx).unwrap().id, de.id);
    }

    // No match falls back to every candidate
    let ctx = SelectionContext::new().with_country("JP");
    assert!(engine.select(&ctx).is_ok());
}

#[test]
fn custom_strategy_through_registry() {
    let engine = engine("round_robin");
    register(&engine, 3);

    engine
        .registry()
        .register("first_only", |_config: &rota_engine::config::StrategyConfig| {
            Ok(Arc::new(FirstOnly) as Arc<dyn rota_engine::proxy::ProxySelector>)
        })
        .unwrap();
    engine.set_strategy("first_only").unwrap();

    let first = engine.select(&SelectionContext::new()).unwrap();
    for _ in 0..5 {
        assert_eq!(engine.select(&SelectionContext::new()).unwrap().id, first.id);
    }
    assert_eq!(engine.strategy_name(), "first_only");
}

struct FirstOnly;

impl rota_engine::proxy::ProxySelector for FirstOnly {
    fn choose(
        &self,
        candidates: &[Arc<ProxyBackend>],
        context: &SelectionContext,
    ) -> Result<Arc<ProxyBackend>> {
        candidates
            .iter()
            .filter(|b| b.is_eligible() && !context.is_excluded(&b.id))
            .min_by(|a, b| a.id.cmp(&b.id))
            .cloned()
            .ok_or(RotaError::NoProxiesAvailable)
    }

    fn strategy_name(&self) -> &'static str {
        "first_only"
    }
}

#[test]
fn execute_on_a_blocking_caller() {
    let engine = engine("random");
    register(&engine, 2);

    let response = tokio_test::block_on(engine.execute(
        Method::POST,
        "http://example.com/submit",
        &SelectionContext::new(),
    ));
    let response = tokio_test::assert_ok!(response);
    assert_eq!(response.status(), 200);
    assert_eq!(engine.get_pool_stats().total_successes, 1);
}
