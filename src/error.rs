use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome class of a single upstream attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connect, protocol or I/O failure talking to the upstream
    Transport,
    /// The attempt exceeded its deadline
    Timeout,
    /// Upstream answered 401/407
    Authentication,
    /// Anything else (bad request, internal error)
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Other => "other",
        }
    }

    /// Whether another backend may succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transport | ErrorKind::Timeout)
    }

    /// Whether the failure counts against the backend's circuit breaker
    pub fn trips_circuit(&self) -> bool {
        !matches!(self, ErrorKind::Authentication)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unified error type for the Rota engine
#[derive(Error, Debug)]
pub enum RotaError {
    // Pool errors
    #[error("No proxies available")]
    NoProxiesAvailable,

    #[error("Capacity exceeded: at most {capacity} entries allowed")]
    CapacityExceeded { capacity: usize },

    #[error("Proxy not found: {id}")]
    ProxyNotFound { id: String },

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    // Request errors
    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    #[error("Upstream {backend} requires authentication (status {status})")]
    AuthenticationRequired { backend: String, status: u16 },

    #[error("All proxies exhausted after {attempts} attempts (last: {last_backend}, {kind})")]
    AllProxiesExhausted {
        attempts: u32,
        last_backend: String,
        kind: ErrorKind,
    },

    #[error("Operation timed out")]
    Timeout,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Argument and configuration errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown rotation strategy: {0}")]
    UnknownStrategy(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Rota operations
pub type Result<T> = std::result::Result<T, RotaError>;

impl RotaError {
    /// Get the HTTP status code the API shell should answer with
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            RotaError::InvalidRequest(_)
            | RotaError::InvalidArgument(_)
            | RotaError::InvalidProxyAddress(_)
            | RotaError::UnsupportedProtocol(_)
            | RotaError::UnknownStrategy(_)
            | RotaError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 404 Not Found
            RotaError::ProxyNotFound { .. } => StatusCode::NOT_FOUND,

            // 407 Proxy Authentication Required
            RotaError::AuthenticationRequired { .. } => {
                StatusCode::PROXY_AUTHENTICATION_REQUIRED
            }

            // 409 Conflict
            RotaError::CapacityExceeded { .. } => StatusCode::CONFLICT,

            // 502 Bad Gateway
            RotaError::ProxyConnectionFailed(_) | RotaError::AllProxiesExhausted { .. } => {
                StatusCode::BAD_GATEWAY
            }

            // 503 Service Unavailable
            RotaError::NoProxiesAvailable => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            RotaError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            RotaError::Io(_) | RotaError::Http(_) | RotaError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Classify this error as an attempt outcome
    pub fn kind(&self) -> ErrorKind {
        match self {
            RotaError::ProxyConnectionFailed(_) | RotaError::Io(_) | RotaError::Http(_) => {
                ErrorKind::Transport
            }
            RotaError::Timeout => ErrorKind::Timeout,
            RotaError::AuthenticationRequired { .. } => ErrorKind::Authentication,
            RotaError::AllProxiesExhausted { kind, .. } => *kind,
            _ => ErrorKind::Other,
        }
    }

    /// Check if the failed attempt may be retried against a different backend
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RotaError::AllProxiesExhausted { .. }) && self.kind().is_retryable()
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for RotaError {
    fn from(err: hyper::Error) -> Self {
        RotaError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for RotaError {
    fn from(err: url::ParseError) -> Self {
        RotaError::InvalidProxyAddress(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            RotaError::InvalidRequest("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RotaError::InvalidProxyAddress("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RotaError::ProxyNotFound {
                id: "http://1.2.3.4:80".to_string()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RotaError::AuthenticationRequired {
                backend: "http://1.2.3.4:80".to_string(),
                status: 407
            }
            .status_code(),
            StatusCode::PROXY_AUTHENTICATION_REQUIRED
        );
        assert_eq!(
            RotaError::CapacityExceeded { capacity: 1 }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            RotaError::Timeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            RotaError::NoProxiesAvailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(
            RotaError::ProxyConnectionFailed("refused".to_string()).kind(),
            ErrorKind::Transport
        );
        assert_eq!(RotaError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            RotaError::AuthenticationRequired {
                backend: "x".to_string(),
                status: 401
            }
            .kind(),
            ErrorKind::Authentication
        );
        assert_eq!(RotaError::NoProxiesAvailable.kind(), ErrorKind::Other);
    }

    #[test]
    fn test_error_retryable() {
        assert!(RotaError::Timeout.is_retryable());
        assert!(RotaError::ProxyConnectionFailed("reset".to_string()).is_retryable());
        assert!(!RotaError::AuthenticationRequired {
            backend: "x".to_string(),
            status: 407
        }
        .is_retryable());
        assert!(!RotaError::AllProxiesExhausted {
            attempts: 3,
            last_backend: "x".to_string(),
            kind: ErrorKind::Transport,
        }
        .is_retryable());
        assert!(!ErrorKind::Authentication.trips_circuit());
        assert!(ErrorKind::Timeout.trips_circuit());
    }

    #[test]
    fn test_error_client_server_helpers() {
        assert!(RotaError::InvalidRequest("bad".to_string()).is_client_error());
        assert!(!RotaError::InvalidRequest("bad".to_string()).is_server_error());

        assert!(RotaError::NoProxiesAvailable.is_server_error());
        assert!(!RotaError::NoProxiesAvailable.is_client_error());
    }
}
