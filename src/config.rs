use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, RotaError};
use crate::models::DEFAULT_EMA_ALPHA;
use crate::proxy::circuit_breaker::CircuitBreakerConfig;
use crate::proxy::connection_pool::DEFAULT_CONNECTION_POOL_SIZE;
use crate::proxy::health::HealthCheckConfig;
use crate::proxy::pool::DEFAULT_MAX_POOL_SIZE;
use crate::proxy::session::{DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_TIMEOUT};

/// Engine configuration loaded from environment variables
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Pool sizing and backend defaults
    pub pool: PoolConfig,
    /// Rotation strategy and its tunables
    pub strategy: StrategyConfig,
    /// Per-backend circuit breaker tunables
    pub circuit_breaker: CircuitBreakerConfig,
    /// Background health checking
    pub health: HealthCheckConfig,
    /// Outbound request behaviour
    pub request: RequestConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Name used in logs and stats (default: default)
    pub name: String,
    /// Maximum number of backends (default: 1000)
    pub max_pool_size: usize,
    /// EMA smoothing factor applied to new backends (default: 0.2)
    pub ema_alpha: f64,
    /// Maximum number of cached upstream connections (default: 100)
    pub connection_pool_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            ema_alpha: DEFAULT_EMA_ALPHA,
            connection_pool_size: DEFAULT_CONNECTION_POOL_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// Rotation strategy name (round_robin, random, weighted, least_used,
    /// performance_based, session_persistence, geo_targeted, composite)
    pub strategy: String,
    /// Static weight multipliers by backend id for the weighted strategy
    pub weights: HashMap<String, f64>,
    /// Trials given to a backend with no response-time history
    pub exploration_count: u32,
    pub max_sessions: usize,
    /// Idle lifetime of a sticky session
    pub session_timeout: Duration,
    /// Strategy used by geo targeting over the matching set
    pub geo_secondary_strategy: String,
    /// Fall back to every candidate when no backend matches the location
    pub geo_fallback: bool,
    /// Filter strategies applied in order by the composite strategy
    pub composite_filters: Vec<String>,
    /// Final selector of the composite strategy
    pub composite_selector: Option<String>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            strategy: "round_robin".to_string(),
            weights: HashMap::new(),
            exploration_count: crate::proxy::rotation::DEFAULT_EXPLORATION_COUNT,
            max_sessions: DEFAULT_MAX_SESSIONS,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            geo_secondary_strategy: "round_robin".to_string(),
            geo_fallback: true,
            composite_filters: Vec::new(),
            composite_selector: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Maximum retry attempts after the first failed attempt (default: 3)
    pub max_retries: u32,
    /// Connection timeout for upstream proxies
    pub connect_timeout: Duration,
    /// Request/response timeout
    pub request_timeout: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let health_defaults = HealthCheckConfig::default();
        let breaker_defaults = CircuitBreakerConfig::default();

        let config = Config {
            pool: PoolConfig {
                name: get_env_or("ROTA_POOL_NAME", "default"),
                max_pool_size: parse_env("ROTA_MAX_POOL_SIZE", DEFAULT_MAX_POOL_SIZE)?,
                ema_alpha: parse_env("ROTA_EMA_ALPHA", DEFAULT_EMA_ALPHA)?,
                connection_pool_size: parse_env(
                    "ROTA_CONNECTION_POOL_SIZE",
                    DEFAULT_CONNECTION_POOL_SIZE,
                )?,
            },
            strategy: StrategyConfig {
                strategy: get_env_or("ROTA_STRATEGY", "round_robin"),
                weights: parse_weights(&get_env_or("ROTA_STRATEGY_WEIGHTS", ""))?,
                exploration_count: parse_env(
                    "ROTA_EXPLORATION_COUNT",
                    crate::proxy::rotation::DEFAULT_EXPLORATION_COUNT,
                )?,
                max_sessions: parse_env("ROTA_MAX_SESSIONS", DEFAULT_MAX_SESSIONS)?,
                session_timeout: parse_secs("ROTA_SESSION_TIMEOUT", DEFAULT_SESSION_TIMEOUT)?,
                geo_secondary_strategy: get_env_or("ROTA_GEO_SECONDARY_STRATEGY", "round_robin"),
                geo_fallback: parse_env("ROTA_GEO_FALLBACK", true)?,
                composite_filters: split_list(&get_env_or("ROTA_COMPOSITE_FILTERS", "")),
                composite_selector: env::var("ROTA_COMPOSITE_SELECTOR")
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: parse_env(
                    "ROTA_CB_FAILURE_THRESHOLD",
                    breaker_defaults.failure_threshold,
                )?,
                window_duration: parse_secs("ROTA_CB_WINDOW", breaker_defaults.window_duration)?,
                timeout_duration: parse_secs("ROTA_CB_TIMEOUT", breaker_defaults.timeout_duration)?,
            },
            health: HealthCheckConfig {
                check_interval: parse_secs("ROTA_HEALTH_INTERVAL", health_defaults.check_interval)?,
                source_intervals: parse_source_intervals(&get_env_or(
                    "ROTA_HEALTH_SOURCE_INTERVALS",
                    "",
                ))?,
                failure_threshold: parse_env(
                    "ROTA_HEALTH_FAILURE_THRESHOLD",
                    health_defaults.failure_threshold,
                )?,
                success_threshold: parse_env(
                    "ROTA_HEALTH_SUCCESS_THRESHOLD",
                    health_defaults.success_threshold,
                )?,
                recovery_cooldown_base: parse_secs(
                    "ROTA_HEALTH_RECOVERY_BASE",
                    health_defaults.recovery_cooldown_base,
                )?,
                max_recovery_attempts: parse_env(
                    "ROTA_HEALTH_MAX_RECOVERY_ATTEMPTS",
                    health_defaults.max_recovery_attempts,
                )?,
                probe_url: get_env_or("ROTA_HEALTH_PROBE_URL", &health_defaults.probe_url),
                acceptable_status_codes: parse_status_codes(&get_env_or(
                    "ROTA_HEALTH_ACCEPTABLE_CODES",
                    "200,204",
                ))?,
                probe_timeout: parse_secs("ROTA_HEALTH_PROBE_TIMEOUT", health_defaults.probe_timeout)?,
                probe_concurrency: parse_env(
                    "ROTA_HEALTH_CONCURRENCY",
                    health_defaults.probe_concurrency,
                )?,
                degradation_threshold: parse_env(
                    "ROTA_HEALTH_DEGRADATION_THRESHOLD",
                    health_defaults.degradation_threshold,
                )?,
            },
            request: RequestConfig {
                max_retries: parse_env("ROTA_MAX_RETRIES", 3)?,
                connect_timeout: parse_secs("ROTA_CONNECT_TIMEOUT", Duration::from_secs(10))?,
                request_timeout: parse_secs("ROTA_REQUEST_TIMEOUT", Duration::from_secs(30))?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but make no sense
    pub fn validate(&self) -> Result<()> {
        if !(self.pool.ema_alpha > 0.0 && self.pool.ema_alpha <= 1.0) {
            return Err(RotaError::InvalidConfig(
                "ROTA_EMA_ALPHA must be in (0, 1]".into(),
            ));
        }
        if self.pool.max_pool_size == 0 {
            return Err(RotaError::InvalidConfig(
                "ROTA_MAX_POOL_SIZE must be at least 1".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(RotaError::InvalidConfig(
                "ROTA_CB_FAILURE_THRESHOLD must be at least 1".into(),
            ));
        }
        if self.health.failure_threshold == 0 || self.health.success_threshold == 0 {
            return Err(RotaError::InvalidConfig(
                "health check thresholds must be at least 1".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.health.degradation_threshold) {
            return Err(RotaError::InvalidConfig(
                "ROTA_HEALTH_DEGRADATION_THRESHOLD must be a percentage".into(),
            ));
        }
        if self.health.acceptable_status_codes.is_empty() {
            return Err(RotaError::InvalidConfig(
                "ROTA_HEALTH_ACCEPTABLE_CODES must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an environment variable, falling back to `default` when unset
fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| RotaError::InvalidConfig(format!("{} has an invalid value: {}", key, raw))),
        _ => Ok(default),
    }
}

/// Parse a duration given in whole seconds
fn parse_secs(key: &str, default: Duration) -> Result<Duration> {
    parse_env(key, default.as_secs()).map(Duration::from_secs)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `source=secs,...`
fn parse_source_intervals(raw: &str) -> Result<HashMap<String, Duration>> {
    split_list(raw)
        .into_iter()
        .map(|entry| {
            let (source, secs) = entry.split_once('=').ok_or_else(|| {
                RotaError::InvalidConfig(format!(
                    "ROTA_HEALTH_SOURCE_INTERVALS entry must be source=secs: {}",
                    entry
                ))
            })?;
            let secs: u64 = secs.trim().parse().map_err(|_| {
                RotaError::InvalidConfig(format!(
                    "ROTA_HEALTH_SOURCE_INTERVALS has an invalid interval: {}",
                    entry
                ))
            })?;
            Ok((source.trim().to_string(), Duration::from_secs(secs)))
        })
        .collect()
}

/// `backend_id=weight,...`; the id itself contains `:` so split on the last `=`
fn parse_weights(raw: &str) -> Result<HashMap<String, f64>> {
    split_list(raw)
        .into_iter()
        .map(|entry| {
            let (id, weight) = entry.rsplit_once('=').ok_or_else(|| {
                RotaError::InvalidConfig(format!(
                    "ROTA_STRATEGY_WEIGHTS entry must be id=weight: {}",
                    entry
                ))
            })?;
            let weight: f64 = weight
                .trim()
                .parse()
                .ok()
                .filter(|w: &f64| w.is_finite() && *w >= 0.0)
                .ok_or_else(|| {
                    RotaError::InvalidConfig(format!(
                        "ROTA_STRATEGY_WEIGHTS has an invalid weight: {}",
                        entry
                    ))
                })?;
            Ok((id.trim().to_string(), weight))
        })
        .collect()
}

fn parse_status_codes(raw: &str) -> Result<Vec<u16>> {
    split_list(raw)
        .into_iter()
        .map(|code| {
            code.parse::<u16>()
                .ok()
                .filter(|c| (100..=599).contains(c))
                .ok_or_else(|| {
                    RotaError::InvalidConfig(format!(
                        "ROTA_HEALTH_ACCEPTABLE_CODES has an invalid status code: {}",
                        code
                    ))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "ROTA_POOL_NAME",
        "ROTA_MAX_POOL_SIZE",
        "ROTA_EMA_ALPHA",
        "ROTA_CONNECTION_POOL_SIZE",
        "ROTA_STRATEGY",
        "ROTA_STRATEGY_WEIGHTS",
        "ROTA_EXPLORATION_COUNT",
        "ROTA_MAX_SESSIONS",
        "ROTA_SESSION_TIMEOUT",
        "ROTA_GEO_SECONDARY_STRATEGY",
        "ROTA_GEO_FALLBACK",
        "ROTA_COMPOSITE_FILTERS",
        "ROTA_COMPOSITE_SELECTOR",
        "ROTA_CB_FAILURE_THRESHOLD",
        "ROTA_CB_WINDOW",
        "ROTA_CB_TIMEOUT",
        "ROTA_HEALTH_INTERVAL",
        "ROTA_HEALTH_SOURCE_INTERVALS",
        "ROTA_HEALTH_FAILURE_THRESHOLD",
        "ROTA_HEALTH_SUCCESS_THRESHOLD",
        "ROTA_HEALTH_RECOVERY_BASE",
        "ROTA_HEALTH_MAX_RECOVERY_ATTEMPTS",
        "ROTA_HEALTH_PROBE_URL",
        "ROTA_HEALTH_ACCEPTABLE_CODES",
        "ROTA_HEALTH_PROBE_TIMEOUT",
        "ROTA_HEALTH_CONCURRENCY",
        "ROTA_HEALTH_DEGRADATION_THRESHOLD",
        "ROTA_MAX_RETRIES",
        "ROTA_CONNECT_TIMEOUT",
        "ROTA_REQUEST_TIMEOUT",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.pool.max_pool_size, 1000);
        assert_eq!(config.pool.connection_pool_size, 100);
        assert_eq!(config.strategy.strategy, "round_robin");
        assert!(config.strategy.geo_fallback);
        assert_eq!(config.strategy.session_timeout, Duration::from_secs(3600));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.health.acceptable_status_codes, vec![200, 204]);
        assert!(config.health.source_intervals.is_empty());
        assert_eq!(config.request.max_retries, 3);
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("ROTA_MAX_POOL_SIZE", "50");
        env::set_var("ROTA_STRATEGY", "least_used");
        env::set_var("ROTA_STRATEGY_WEIGHTS", "http://1.2.3.4:80=2.5");
        env::set_var("ROTA_GEO_FALLBACK", "false");
        env::set_var("ROTA_COMPOSITE_FILTERS", "geo_targeted, least_used");
        env::set_var("ROTA_CB_TIMEOUT", "5");
        env::set_var("ROTA_HEALTH_SOURCE_INTERVALS", "scraper=15, premium=120");
        env::set_var("ROTA_HEALTH_ACCEPTABLE_CODES", "200,301");

        let config = Config::from_env().unwrap();

        assert_eq!(config.pool.max_pool_size, 50);
        assert_eq!(config.strategy.strategy, "least_used");
        assert_eq!(config.strategy.weights.get("http://1.2.3.4:80"), Some(&2.5));
        assert!(!config.strategy.geo_fallback);
        assert_eq!(
            config.strategy.composite_filters,
            vec!["geo_targeted".to_string(), "least_used".to_string()]
        );
        assert_eq!(config.circuit_breaker.timeout_duration, Duration::from_secs(5));
        assert_eq!(
            config.health.interval_for("scraper"),
            Duration::from_secs(15)
        );
        assert_eq!(
            config.health.interval_for("premium"),
            Duration::from_secs(120)
        );
        assert_eq!(config.health.interval_for("other"), Duration::from_secs(30));
        assert_eq!(config.health.acceptable_status_codes, vec![200, 301]);
    }

    #[test]
    fn test_config_from_env_invalid_number() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("ROTA_MAX_RETRIES", "lots");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, RotaError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_rejects_bad_ema_alpha() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("ROTA_EMA_ALPHA", "1.5");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, RotaError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_rejects_malformed_lists() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("ROTA_HEALTH_SOURCE_INTERVALS", "scraper");
        assert!(matches!(
            Config::from_env(),
            Err(RotaError::InvalidConfig(_))
        ));
        env::remove_var("ROTA_HEALTH_SOURCE_INTERVALS");

        env::set_var("ROTA_HEALTH_ACCEPTABLE_CODES", "200,999");
        assert!(matches!(
            Config::from_env(),
            Err(RotaError::InvalidConfig(_))
        ));
        env::remove_var("ROTA_HEALTH_ACCEPTABLE_CODES");

        env::set_var("ROTA_STRATEGY_WEIGHTS", "http://1.2.3.4:80=-1");
        assert!(matches!(
            Config::from_env(),
            Err(RotaError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }
}
