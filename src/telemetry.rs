//! Tracing subscriber setup for binaries embedding the engine

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;
use crate::error::{Result, RotaError};

/// Install the global subscriber
///
/// `RUST_LOG` wins over `LOG_LEVEL`; `LOG_FORMAT=pretty` selects
/// human-readable output, anything else JSON lines.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(&config.level)))
        .map_err(|e| RotaError::InvalidConfig(format!("LOG_LEVEL is invalid: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.format.eq_ignore_ascii_case("pretty") {
        registry.with(tracing_subscriber::fmt::layer().pretty()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    };

    installed.map_err(|e| RotaError::Internal(format!("tracing already initialized: {}", e)))
}

fn default_directive(level: &str) -> String {
    format!("rota_engine={}", level.trim().to_lowercase())
}
