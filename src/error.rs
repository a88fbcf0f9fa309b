use thiserror::Error;

/// Errors surfaced by remote fetches.
///
/// Cache misses are not errors (they are `None`), and persistence failures
/// are absorbed by the cache layer, so this taxonomy covers only the remote
/// leg of a fetch. Transient variants are additionally masked by a cached
/// fallback value when one exists; see [`FetchError::is_transient`].
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("Request timed out after {limit_ms}ms")]
    Timeout { limit_ms: i64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request cancelled")]
    Cancelled,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl FetchError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..MAX_ERROR_BODY_LENGTH],
                body.len()
            )
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => FetchError::Unauthorized,
            403 => FetchError::AccessDenied(truncated),
            404 => FetchError::NotFound(truncated),
            429 => FetchError::RateLimited,
            500..=599 => FetchError::ServerError(truncated),
            _ => FetchError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// True when the failure is transient transport trouble (timeout or
    /// network), the cases where a stale cache fallback is preferable to
    /// surfacing the error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout { .. } | FetchError::Network(_) | FetchError::Cancelled
        )
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not expose the configured limit here
            FetchError::Timeout { limit_ms: 0 }
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_mapping() {
        let unauthorized = FetchError::from_status(reqwest::StatusCode::UNAUTHORIZED, "");
        assert!(matches!(unauthorized, FetchError::Unauthorized));

        let rate_limited = FetchError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "");
        assert!(matches!(rate_limited, FetchError::RateLimited));

        let server = FetchError::from_status(reqwest::StatusCode::BAD_GATEWAY, "oops");
        assert!(matches!(server, FetchError::ServerError(body) if body == "oops"));
    }

    #[test]
    fn test_body_truncation() {
        let long_body = "x".repeat(1000);
        let err = FetchError::from_status(reqwest::StatusCode::FORBIDDEN, &long_body);
        let msg = err.to_string();
        assert!(msg.contains("truncated, 1000 total bytes"));
        assert!(msg.len() < 700);
    }

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Timeout { limit_ms: 5000 }.is_transient());
        assert!(FetchError::Network("reset".into()).is_transient());
        assert!(!FetchError::Unauthorized.is_transient());
        assert!(!FetchError::ServerError("500".into()).is_transient());
    }
}
