use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::HealthStatus;

/// Health-checker view of a monitored backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    /// A probe is in flight
    Checking,
    /// Waiting out a backoff cooldown before the next recovery probe
    Recovering,
    /// Exhausted its recovery attempts; never probed again automatically
    PermanentlyFailed,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Checking => "checking",
            HealthState::Recovering => "recovering",
            HealthState::PermanentlyFailed => "permanently_failed",
        }
    }

    /// Status the selection path should observe, if this state implies one
    pub fn backend_status(&self) -> Option<HealthStatus> {
        match self {
            HealthState::Healthy => Some(HealthStatus::Healthy),
            HealthState::Unhealthy | HealthState::Recovering => Some(HealthStatus::Unhealthy),
            HealthState::PermanentlyFailed => Some(HealthStatus::Dead),
            HealthState::Unknown | HealthState::Checking => None,
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one probe
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub backend_url: String,
    pub checked_at: DateTime<Utc>,
    /// Either `Healthy` or `Unhealthy`
    pub status: HealthState,
    pub response_time: Option<Duration>,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub target_url: String,
}

impl HealthCheckResult {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

/// Transition notifications emitted by the health checker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HealthEvent {
    ProxyDown {
        backend: String,
        source: String,
        consecutive_failures: u32,
    },
    ProxyRecovered {
        backend: String,
        source: String,
        recovery_attempts: u32,
    },
    PermanentlyFailed {
        backend: String,
        source: String,
        recovery_attempts: u32,
    },
    PoolDegraded {
        healthy_percent: f64,
        threshold_percent: f64,
    },
}

impl HealthEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HealthEvent::ProxyDown { .. } => "proxy_down",
            HealthEvent::ProxyRecovered { .. } => "proxy_recovered",
            HealthEvent::PermanentlyFailed { .. } => "permanently_failed",
            HealthEvent::PoolDegraded { .. } => "pool_degraded",
        }
    }
}

/// Per-state tallies; `permanently_failed` is a subset of `unhealthy`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthCounts {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub checking: usize,
    pub recovering: usize,
    pub unknown: usize,
    pub permanently_failed: usize,
}

impl HealthCounts {
    pub fn record(&mut self, state: HealthState) {
        self.total += 1;
        match state {
            HealthState::Healthy => self.healthy += 1,
            HealthState::Unhealthy => self.unhealthy += 1,
            HealthState::PermanentlyFailed => {
                self.unhealthy += 1;
                self.permanently_failed += 1;
            }
            HealthState::Checking => self.checking += 1,
            HealthState::Recovering => self.recovering += 1,
            HealthState::Unknown => self.unknown += 1,
        }
    }

    pub fn healthy_percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.healthy as f64 / self.total as f64 * 100.0
        }
    }

    /// healthy + unhealthy + checking + recovering + unknown
    pub fn sum(&self) -> usize {
        self.healthy + self.unhealthy + self.checking + self.recovering + self.unknown
    }
}

/// Aggregated health of all monitored backends
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolHealthStatus {
    #[serde(flatten)]
    pub overall: HealthCounts,
    pub by_source: BTreeMap<String, HealthCounts>,
}

/// Snapshot of one monitored backend's health counters
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub backend: String,
    pub source: String,
    pub status: HealthState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_checks: u64,
    pub total_failures: u64,
    pub recovery_attempt: u32,
    /// Time until the next scheduled probe, if any
    pub next_check_in: Option<Duration>,
    pub last_error: Option<String>,
}
