//! Proxy selection and resilience
//!
//! This module provides the engine's request path:
//! - A bounded pool of upstream backends
//! - Multiple proxy rotation strategies
//! - Per-backend circuit breakers
//! - Health checking with recovery backoff
//! - Cached upstream connections and failover across backends

pub mod circuit_breaker;
pub mod client;
pub mod connection_pool;
pub mod health;
pub mod orchestrator;
pub mod pool;
pub mod rotation;
pub mod session;
pub mod transport;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakers, CircuitState};
pub use client::{DefaultUpstreamFactory, Upstream, UpstreamClient, UpstreamFactory};
pub use connection_pool::{ConnectionPool, PooledConnection};
pub use health::{CacheInvalidator, HealthCheckConfig, HealthChecker, HealthProbe, HttpProbe};
pub use orchestrator::{FixedRetryPolicy, Orchestrator, RetryPolicy};
pub use pool::ProxyPool;
pub use rotation::{create_selector, ProxySelector, RotationStrategy, StrategyRegistry};
pub use session::SessionManager;
pub use transport::ProxyTransport;
