use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, RotaError};

/// Default smoothing factor for the response-time EMA
pub const DEFAULT_EMA_ALPHA: f64 = 0.2;

/// Proxy protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks4,
    Socks4a,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks4a => "socks4a",
            ProxyProtocol::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(ProxyProtocol::Http),
            "https" => Some(ProxyProtocol::Https),
            "socks4" => Some(ProxyProtocol::Socks4),
            "socks4a" => Some(ProxyProtocol::Socks4a),
            "socks5" | "socks5h" => Some(ProxyProtocol::Socks5),
            _ => None,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(
            self,
            ProxyProtocol::Socks4 | ProxyProtocol::Socks4a | ProxyProtocol::Socks5
        )
    }

    pub fn is_http(&self) -> bool {
        matches!(self, ProxyProtocol::Http | ProxyProtocol::Https)
    }

    pub fn default_port(&self) -> u16 {
        match self {
            ProxyProtocol::Http => 80,
            ProxyProtocol::Https => 443,
            ProxyProtocol::Socks4 | ProxyProtocol::Socks4a | ProxyProtocol::Socks5 => 1080,
        }
    }
}

impl std::fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Backend health as seen by the selection path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Dead,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Dead => "dead",
            HealthStatus::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "healthy" => Some(HealthStatus::Healthy),
            "degraded" => Some(HealthStatus::Degraded),
            "unhealthy" => Some(HealthStatus::Unhealthy),
            "dead" => Some(HealthStatus::Dead),
            "unknown" => Some(HealthStatus::Unknown),
            _ => None,
        }
    }

    /// Only healthy and degraded backends may be handed out
    pub fn is_selectable(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime statistics of a backend
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendStats {
    pub health_status: HealthStatus,
    /// Smoothed response time in milliseconds, `None` until the first timed success
    pub ema_response_time_ms: Option<f64>,
    pub requests_started: u64,
    pub requests_completed: u64,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl BackendStats {
    /// Calculate success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.total_successes as f64 / self.total_requests as f64) * 100.0
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.requests_started.saturating_sub(self.requests_completed)
    }
}

/// One upstream proxy: immutable identity plus mutable runtime statistics
///
/// Identity is the normalized `scheme://host:port`; two records with the same
/// identity are the same backend regardless of credentials or tags.
#[derive(Debug)]
pub struct ProxyBackend {
    pub id: String,
    pub protocol: ProxyProtocol,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Label of the loader that supplied this backend
    pub source: String,
    pub country: Option<String>,
    pub region: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub ema_alpha: f64,
    pub created_at: DateTime<Utc>,
    stats: Mutex<BackendStats>,
}

impl ProxyBackend {
    /// Parse a backend from a proxy URL
    ///
    /// Accepts `scheme://[user[:pass]@]host[:port]`; a bare `host:port` is
    /// treated as an HTTP proxy.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(RotaError::InvalidProxyAddress("empty proxy URL".to_string()));
        }

        let normalized = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };

        let url = Url::parse(&normalized)
            .map_err(|e| RotaError::InvalidProxyAddress(format!("{}: {}", raw, e)))?;

        let protocol = ProxyProtocol::from_str(url.scheme())
            .ok_or_else(|| RotaError::UnsupportedProtocol(url.scheme().to_string()))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RotaError::InvalidProxyAddress(format!("{}: missing host", raw)))?
            .to_lowercase();

        if !(url.path().is_empty() || url.path() == "/")
            || url.query().is_some()
            || url.fragment().is_some()
        {
            return Err(RotaError::InvalidProxyAddress(format!(
                "{}: must not include path, query or fragment",
                raw
            )));
        }

        let port = url.port().unwrap_or_else(|| protocol.default_port());
        let username = (!url.username().is_empty()).then(|| url.username().to_string());
        let password = url.password().map(|p| p.to_string());

        Ok(Self {
            id: format!("{}://{}:{}", protocol.as_str(), host, port),
            protocol,
            host,
            port,
            username,
            password,
            source: "default".to_string(),
            country: None,
            region: None,
            expires_at: None,
            ema_alpha: DEFAULT_EMA_ALPHA,
            created_at: Utc::now(),
            stats: Mutex::new(BackendStats::default()),
        })
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into().to_uppercase());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_ema_alpha(mut self, alpha: f64) -> Self {
        self.ema_alpha = alpha.clamp(0.01, 1.0);
        self
    }

    pub fn with_status(self, status: HealthStatus) -> Self {
        self.stats.lock().health_status = status;
        self
    }

    /// `host:port` of the proxy itself
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Get proxy URL with optional authentication
    pub fn url(&self) -> String {
        let scheme = match self.protocol {
            ProxyProtocol::Http | ProxyProtocol::Https => "http",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks4a => "socks4a",
            ProxyProtocol::Socks5 => "socks5",
        };

        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                format!("{}://{}:{}@{}", scheme, user, pass, self.address())
            }
            (Some(user), None) => {
                format!("{}://{}@{}", scheme, user, self.address())
            }
            _ => {
                format!("{}://{}", scheme, self.address())
            }
        }
    }

    pub fn health_status(&self) -> HealthStatus {
        self.stats.lock().health_status
    }

    /// Set the health status, returning the previous one
    pub fn set_health_status(&self, status: HealthStatus) -> HealthStatus {
        std::mem::replace(&mut self.stats.lock().health_status, status)
    }

    pub fn is_selectable(&self) -> bool {
        self.health_status().is_selectable()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Healthy (or degraded) and within its TTL
    pub fn is_eligible(&self) -> bool {
        self.is_selectable() && !self.is_expired()
    }

    /// Account a selection as a started request
    pub fn record_selection(&self) {
        let mut stats = self.stats.lock();
        stats.requests_started += 1;
        stats.last_used = Some(Utc::now());
    }

    /// Undo a selection that was never used
    pub fn cancel_selection(&self) {
        let mut stats = self.stats.lock();
        if stats.requests_started > stats.requests_completed {
            stats.requests_started -= 1;
        }
    }

    /// Account a finished request and fold its response time into the EMA
    pub fn complete_request(&self, success: bool, response_time: Option<Duration>) {
        let mut stats = self.stats.lock();

        // Results reported for requests this engine never selected still count as started.
        if stats.requests_completed >= stats.requests_started {
            stats.requests_started = stats.requests_completed + 1;
        }
        stats.requests_completed += 1;
        stats.total_requests += 1;

        if success {
            stats.total_successes += 1;
            if let Some(elapsed) = response_time {
                let sample = elapsed.as_secs_f64() * 1000.0;
                stats.ema_response_time_ms = Some(match stats.ema_response_time_ms {
                    Some(ema) => self.ema_alpha * sample + (1.0 - self.ema_alpha) * ema,
                    None => sample,
                });
            }
        } else {
            stats.total_failures += 1;
        }
    }

    pub fn ema_response_time(&self) -> Option<f64> {
        self.stats.lock().ema_response_time_ms
    }

    pub fn requests_started(&self) -> u64 {
        self.stats.lock().requests_started
    }

    pub fn stats(&self) -> BackendStats {
        self.stats.lock().clone()
    }

    /// Carry runtime statistics over from a record this one replaces
    pub(crate) fn adopt_stats(&self, previous: &ProxyBackend) {
        let carried = previous.stats();
        let mut stats = self.stats.lock();
        let status = stats.health_status;
        *stats = carried;
        if status != HealthStatus::Unknown {
            stats.health_status = status;
        }
    }

    /// Check the backend against a country/region target; unset targets match anything
    pub fn matches_location(&self, country: Option<&str>, region: Option<&str>) -> bool {
        let country_ok = match country {
            Some(want) => self
                .country
                .as_deref()
                .map(|have| have.eq_ignore_ascii_case(want))
                .unwrap_or(false),
            None => true,
        };
        let region_ok = match region {
            Some(want) => self
                .region
                .as_deref()
                .map(|have| have.eq_ignore_ascii_case(want))
                .unwrap_or(false),
            None => true,
        };
        country_ok && region_ok
    }

    /// Same location tags as `other`
    pub fn same_profile(&self, other: &ProxyBackend) -> bool {
        fn eq(a: Option<&str>, b: Option<&str>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                (None, None) => true,
                _ => false,
            }
        }
        eq(self.country.as_deref(), other.country.as_deref())
            && eq(self.region.as_deref(), other.region.as_deref())
    }
}

impl std::fmt::Display for ProxyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Optional attributes a loader attaches when registering a backend
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendTags {
    pub country: Option<String>,
    pub region: Option<String>,
    /// Lifetime from registration; `None` never expires
    #[serde(default, with = "ttl_secs")]
    pub ttl: Option<Duration>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BackendTags {
    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Stamp the tags onto a parsed backend; explicit credentials win over URL userinfo
    pub fn apply(self, mut backend: ProxyBackend) -> ProxyBackend {
        if let Some(country) = self.country {
            backend = backend.with_country(country);
        }
        if let Some(region) = self.region {
            backend = backend.with_region(region);
        }
        if let Some(ttl) = self.ttl {
            backend = backend.with_ttl(ttl);
        }
        if let Some(username) = self.username {
            backend.username = Some(username);
            backend.password = self.password;
        }
        backend
    }
}

/// TTLs arrive as whole seconds
mod ttl_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
