// 🚨 Error Taxonomy - every failure the core can surface
//
// ValidationError      → malformed record, rejected before candidate search
// TransientIngestion   → network / timeout / 5xx / 429, retried by resilience
// ServiceUnavailable   → breaker OPEN or retries exhausted
// MergeConflict        → concurrent write detected at commit time
//
// "No match found" is never an error: scoring and candidate search return
// empty results instead.

use thiserror::Error;

// ============================================================================
// VALIDATION ERROR
// ============================================================================

/// A CandidateRecord (or a request against the engine) that cannot be accepted.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// UPSTREAM FETCH ERROR
// ============================================================================

/// Failures reported by an upstream record source (mail provider, bank feed...).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("upstream returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("malformed upstream payload: {0}")]
    Malformed(String),
}

impl FetchError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        FetchError::Http {
            status,
            message: message.into(),
        }
    }

    /// Network, timeout, 5xx and 429 are worth retrying. Everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::Timeout(_) | FetchError::RateLimited { .. } => {
                true
            }
            FetchError::Http { status, .. } => *status >= 500 || *status == 429,
            FetchError::Auth(_) | FetchError::Malformed(_) => false,
        }
    }
}

// ============================================================================
// CRATE ERROR
// ============================================================================

#[derive(Debug, Error)]
pub enum UnifyError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("transient ingestion error: {0}")]
    TransientIngestion(FetchError),

    #[error("service unavailable for {account}: {reason}")]
    ServiceUnavailable { account: String, reason: String },

    #[error("merge conflict: {0}")]
    MergeConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream error: {0}")]
    Upstream(FetchError),

    #[error("ingestion cancelled by shutdown")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl UnifyError {
    pub fn service_unavailable(account: impl Into<String>, reason: impl Into<String>) -> Self {
        UnifyError::ServiceUnavailable {
            account: account.into(),
            reason: reason.into(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        UnifyError::MergeConflict(reason.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        UnifyError::NotFound(what.into())
    }

    /// Classify an upstream failure: transient ones are retryable, the rest propagate as-is.
    pub fn from_fetch(err: FetchError) -> Self {
        if err.is_transient() {
            UnifyError::TransientIngestion(err)
        } else {
            UnifyError::Upstream(err)
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, UnifyError::TransientIngestion(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, UnifyError::MergeConflict(_))
    }
}

pub type Result<T> = std::result::Result<T, UnifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Network("reset".into()).is_transient());
        assert!(FetchError::Timeout("30s".into()).is_transient());
        assert!(FetchError::RateLimited { retry_after_secs: 5 }.is_transient());
        assert!(FetchError::http(503, "unavailable").is_transient());
        assert!(FetchError::http(429, "slow down").is_transient());

        assert!(!FetchError::http(404, "missing").is_transient());
        assert!(!FetchError::Auth("expired token".into()).is_transient());
        assert!(!FetchError::Malformed("bad json".into()).is_transient());
    }

    #[test]
    fn test_from_fetch_routes_by_class() {
        let err = UnifyError::from_fetch(FetchError::http(500, "boom"));
        assert!(err.is_retryable());

        let err = UnifyError::from_fetch(FetchError::http(401, "nope"));
        assert!(!err.is_retryable());
        assert!(matches!(err, UnifyError::Upstream(_)));
    }

    #[test]
    fn test_error_display() {
        let err = UnifyError::service_unavailable("alice@mail", "circuit open");
        let display = err.to_string();
        assert!(display.contains("alice@mail"));
        assert!(display.contains("circuit open"));

        let err: UnifyError = ValidationError::new("amount", "must not be negative").into();
        assert!(err.to_string().contains("amount"));
    }
}
