//! Rota Engine - Proxy Selection & Resilience
//!
//! The selection core of the Rota proxy rotation system, packaged as a library.
//!
//! ## Features
//!
//! - Thread-safe, bounded proxy pool with TTL expiry
//! - Pluggable rotation strategies (round-robin, random, weighted, least-used,
//!   performance-based, session-sticky, geo-targeted, composite)
//! - Per-backend circuit breakers with sliding failure windows
//! - Background health checking with exponential-backoff recovery
//! - LRU-bounded reuse of upstream connections
//! - HTTP, HTTPS, SOCKS4, SOCKS4a and SOCKS5 upstream proxies

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod services;
pub mod telemetry;

pub use config::Config;
pub use error::{ErrorKind, Result, RotaError};
pub use models::{BackendTags, HealthStatus, ProxyBackend, SelectionContext};
pub use proxy::{Orchestrator, ProxyPool, StrategyRegistry};
pub use telemetry::init_tracing;
