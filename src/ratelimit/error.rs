//! Error taxonomy for admission control.

use thiserror::Error;

/// Errors produced by policies, key extraction and limiter backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// Policy failed validation at construction or update.
    #[error("invalid rate limit policy: {0}")]
    InvalidPolicy(String),

    /// Shared store unreachable or timed out.
    #[error("rate limit backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The atomic step returned something other than the expected reply.
    #[error("malformed rate limit backend response: {0}")]
    MalformedBackendResponse(String),

    /// A custom key function produced an empty key.
    #[error("rate limit key could not be resolved")]
    KeyResolutionAmbiguous,

    /// Operation on a limiter that has been closed.
    #[error("limiter is closed")]
    Closed,
}

impl RateLimitError {
    /// Whether the middleware should recover by admitting the request.
    ///
    /// Only backend-side failures qualify. A bad policy is never papered over.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            RateLimitError::BackendUnavailable(_)
                | RateLimitError::MalformedBackendResponse(_)
                | RateLimitError::Closed
        )
    }
}

/// Result type for admission control operations.
pub type RateLimitResult<T> = Result<T, RateLimitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RateLimitError::InvalidPolicy("burst must be positive".into());
        assert_eq!(
            err.to_string(),
            "invalid rate limit policy: burst must be positive"
        );
        assert_eq!(RateLimitError::Closed.to_string(), "limiter is closed");
    }

    #[test]
    fn test_backend_failure_classification() {
        assert!(RateLimitError::BackendUnavailable("down".into()).is_backend_failure());
        assert!(RateLimitError::MalformedBackendResponse("nil".into()).is_backend_failure());
        assert!(RateLimitError::Closed.is_backend_failure());
        assert!(!RateLimitError::InvalidPolicy("x".into()).is_backend_failure());
        assert!(!RateLimitError::KeyResolutionAmbiguous.is_backend_failure());
    }
}
