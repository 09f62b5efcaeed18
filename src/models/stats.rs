use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{HealthStatus, ProxyBackend, ProxyProtocol};
use crate::proxy::circuit_breaker::CircuitState;

/// Per-backend row of the pool metrics summary
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub id: String,
    pub source: String,
    pub protocol: ProxyProtocol,
    pub health_status: HealthStatus,
    pub circuit_state: CircuitState,
    pub requests_started: u64,
    pub requests_completed: u64,
    pub total_requests: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub ema_response_time_ms: Option<f64>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl BackendSnapshot {
    pub fn new(backend: &ProxyBackend, circuit_state: CircuitState) -> Self {
        let stats = backend.stats();
        Self {
            id: backend.id.clone(),
            source: backend.source.clone(),
            protocol: backend.protocol,
            health_status: stats.health_status,
            circuit_state,
            requests_started: stats.requests_started,
            requests_completed: stats.requests_completed,
            total_requests: stats.total_requests,
            total_failures: stats.total_failures,
            success_rate: stats.success_rate(),
            ema_response_time_ms: stats.ema_response_time_ms,
            country: backend.country.clone(),
            region: backend.region.clone(),
            expires_at: backend.expires_at,
        }
    }
}

/// Circuit breaker state totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CircuitSummary {
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
}

impl CircuitSummary {
    pub fn record(&mut self, state: CircuitState) {
        match state {
            CircuitState::Closed => self.closed += 1,
            CircuitState::Open => self.open += 1,
            CircuitState::HalfOpen => self.half_open += 1,
        }
    }
}

/// Pool-wide metrics summary
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pool: String,
    pub strategy: String,
    pub total_backends: usize,
    pub eligible_backends: usize,
    pub max_pool_size: usize,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub open_connections: usize,
    pub circuit_breakers: CircuitSummary,
    pub backends: Vec<BackendSnapshot>,
}
