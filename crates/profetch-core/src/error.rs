use std::time::Duration;

use thiserror::Error;

/// Typed failure reported by a [`Fetcher`](crate::traits::Fetcher) for one attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The call did not complete within its per-call timeout.
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Connection could not be established or was reset mid-flight.
    #[error("Connection failed: {0}")]
    ConnectionRefused(String),

    /// The target answered with a non-success HTTP status.
    #[error("HTTP {code}")]
    HttpStatus {
        code: u16,
        retry_after: Option<Duration>,
    },

    /// The target served a CAPTCHA, auth wall or "slow down" page.
    #[error("Blocked by target: {reason}")]
    Blocked {
        reason: String,
        retry_after: Option<Duration>,
    },

    /// The profile does not exist or is private.
    #[error("Profile unavailable: {0}")]
    NotFound(String),

    /// The target was refused locally before any request was made.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// The caller cancelled the operation while the call was in flight.
    #[error("Fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Returns true if this failure is transient and worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::ConnectionRefused(_) | FetchError::Blocked { .. } => {
                true
            }
            FetchError::HttpStatus { code, .. } => {
                matches!(*code, 408 | 425 | 429) || (500..=599).contains(code)
            }
            FetchError::NotFound(_) | FetchError::InvalidTarget(_) | FetchError::Cancelled => false,
        }
    }

    /// Server-supplied wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::HttpStatus { retry_after, .. } | FetchError::Blocked { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }
}

/// The extractor could not turn raw content into a record.
///
/// Always permanent: malformed content will not fix itself on retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("Malformed content: {0}")]
    Malformed(String),

    #[error("Unexpected content shape: {0}")]
    UnexpectedShape(String),
}

/// A call was rejected because the target's circuit breaker is open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Circuit breaker '{name}' is open. Retry after {}ms.", .retry_after.as_millis())]
pub struct CircuitOpenError {
    pub name: String,
    pub retry_after: Duration,
}

/// Application-wide error types for profetch.
#[derive(Error, Debug)]
pub enum AppError {
    /// Budget or runtime configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Quality schema could not be loaded or is inconsistent.
    #[error("Schema error: {0}")]
    Schema(String),

    /// An exporter failed to write a result.
    #[error("Export error: {0}")]
    Export(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_fetch_errors() {
        assert!(FetchError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(FetchError::ConnectionRefused("reset".into()).is_retryable());
        assert!(
            FetchError::Blocked {
                reason: "captcha".into(),
                retry_after: None,
            }
            .is_retryable()
        );
        for code in [408, 425, 429, 500, 502, 503, 599] {
            assert!(
                FetchError::HttpStatus {
                    code,
                    retry_after: None
                }
                .is_retryable(),
                "HTTP {code} should be retryable"
            );
        }
    }

    #[test]
    fn test_permanent_fetch_errors() {
        assert!(!FetchError::NotFound("gone".into()).is_retryable());
        assert!(!FetchError::InvalidTarget("ftp://x".into()).is_retryable());
        assert!(!FetchError::Cancelled.is_retryable());
        for code in [400, 401, 403, 404, 410] {
            assert!(
                !FetchError::HttpStatus {
                    code,
                    retry_after: None
                }
                .is_retryable(),
                "HTTP {code} should be permanent"
            );
        }
    }

    #[test]
    fn test_retry_after_hint() {
        let hint = Some(Duration::from_secs(12));
        assert_eq!(
            FetchError::HttpStatus {
                code: 429,
                retry_after: hint
            }
            .retry_after(),
            hint
        );
        assert_eq!(
            FetchError::Timeout(Duration::from_secs(1)).retry_after(),
            None
        );
    }

    #[test]
    fn test_circuit_open_display() {
        let err = CircuitOpenError {
            name: "https://example.com:443".into(),
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(
            err.to_string(),
            "Circuit breaker 'https://example.com:443' is open. Retry after 1500ms."
        );
    }
}
