use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Classification of everything that can go wrong between the gateway and an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or malformed credentials, disabled exchange. Not retried.
    Configuration,
    /// Credentials rejected by the exchange. Not retried for the session.
    Authentication,
    /// Timeout, refused connection, DNS failure, 5xx
    TransientNetwork,
    /// Exchange or local request budget exhausted
    RateLimit,
    /// Exchange-side validation failure on an order. Never resubmitted.
    OrderRejected,
    /// Raised locally while the circuit breaker is open
    CircuitOpen,
    /// Operation needs a connected adapter
    NotConnected,
    /// Payload did not have the expected shape
    InvalidResponse,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransientNetwork | ErrorKind::RateLimit | ErrorKind::InvalidResponse
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorKind::Configuration | ErrorKind::Authentication)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Authentication => "authentication error",
            ErrorKind::TransientNetwork => "network error",
            ErrorKind::RateLimit => "rate limit error",
            ErrorKind::OrderRejected => "order rejected",
            ErrorKind::CircuitOpen => "circuit open",
            ErrorKind::NotConnected => "not connected",
            ErrorKind::InvalidResponse => "invalid response",
        };
        f.write_str(name)
    }
}

/// Error carried through every gateway path
#[derive(Debug, Clone, PartialEq, Error)]
#[error("[{exchange}] {kind}: {message}")]
pub struct GatewayError {
    pub exchange: String,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn new(exchange: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn configuration(exchange: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(exchange, ErrorKind::Configuration, message)
    }

    pub fn authentication(exchange: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(exchange, ErrorKind::Authentication, message)
    }

    pub fn network(exchange: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(exchange, ErrorKind::TransientNetwork, message)
    }

    pub fn rate_limited(exchange: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(exchange, ErrorKind::RateLimit, message)
    }

    pub fn rejected(exchange: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(exchange, ErrorKind::OrderRejected, message)
    }

    pub fn circuit_open(exchange: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(exchange, ErrorKind::CircuitOpen, message)
    }

    pub fn not_connected(exchange: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(exchange, ErrorKind::NotConnected, message)
    }

    pub fn invalid_response(exchange: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(exchange, ErrorKind::InvalidResponse, message)
    }

    /// Map a transport-level reqwest failure. Anything that never produced an
    /// HTTP status is treated as transient.
    pub fn from_http(exchange: &str, error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            return Self::new(exchange, classify_status(status.as_u16()), error.to_string());
        }
        if error.is_decode() {
            return Self::invalid_response(exchange, error.to_string());
        }
        let detail = if error.is_timeout() {
            format!("request timed out: {}", error)
        } else if error.is_connect() {
            format!("connection failed: {}", error)
        } else {
            error.to_string()
        };
        Self::network(exchange, detail)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// Classify a non-success HTTP status into an error kind
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::Authentication,
        418 | 429 => ErrorKind::RateLimit,
        400..=499 => ErrorKind::OrderRejected,
        _ => ErrorKind::TransientNetwork,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_exchange_and_kind() {
        let error = GatewayError::rejected("binance", "Account has insufficient balance");
        assert_eq!(
            error.to_string(),
            "[binance] order rejected: Account has insufficient balance"
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(ErrorKind::TransientNetwork.is_retryable());
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(!ErrorKind::OrderRejected.is_retryable());
        assert!(!ErrorKind::Authentication.is_retryable());
        assert!(ErrorKind::Configuration.is_terminal());
        assert!(!ErrorKind::CircuitOpen.is_terminal());
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(401), ErrorKind::Authentication);
        assert_eq!(classify_status(403), ErrorKind::Authentication);
        assert_eq!(classify_status(429), ErrorKind::RateLimit);
        assert_eq!(classify_status(418), ErrorKind::RateLimit);
        assert_eq!(classify_status(400), ErrorKind::OrderRejected);
        assert_eq!(classify_status(502), ErrorKind::TransientNetwork);
    }
}
