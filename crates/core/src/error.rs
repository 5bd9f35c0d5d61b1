//! Error types for the Cadenza domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Cadenza operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Admission errors ---
    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    // --- Provider errors ---
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Selector error: {0}")]
    Selector(#[from] SelectorError),

    // --- Streaming errors ---
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Rejections produced by the admission gate before any provider work begins.
///
/// `RateLimited` and `Banned` are deliberately distinct: a throttled caller
/// gets a short wait hint, a banned caller gets forbidden semantics with a
/// longer-lived block.
#[derive(Debug, Clone, Error)]
pub enum AdmissionError {
    #[error("Rate limited on '{tier}' tier, retry after {retry_after_secs}s")]
    RateLimited {
        tier: String,
        retry_after_secs: u64,
    },

    #[error("Banned, retry after {retry_after_secs}s")]
    Banned { retry_after_secs: u64 },
}

/// Transport-level failures from a single model source.
///
/// The provider selector interprets any of these as "this source failed"
/// and moves on; none of them reach the caller directly.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Source not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// The only hard provider error surfaced to the caller: both the primary
/// and the fallback source failed for this turn.
#[derive(Debug, Clone, Error)]
pub enum SelectorError {
    #[error("All model sources unavailable: {last}")]
    Unavailable { last: SourceError },
}

#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// Caller-initiated cancellation. Terminates the paced sequence early
    /// and is not a failure condition.
    #[error("Stream cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_error_displays_correctly() {
        let err = Error::Admission(AdmissionError::RateLimited {
            tier: "burst".into(),
            retry_after_secs: 4,
        });
        assert!(err.to_string().contains("burst"));
        assert!(err.to_string().contains("4s"));
    }

    #[test]
    fn banned_is_distinct_from_rate_limited() {
        let banned = AdmissionError::Banned {
            retry_after_secs: 120,
        };
        assert!(!matches!(banned, AdmissionError::RateLimited { .. }));
        assert!(banned.to_string().contains("Banned"));
    }

    #[test]
    fn selector_error_wraps_last_source_error() {
        let err = SelectorError::Unavailable {
            last: SourceError::Network("conn refused".into()),
        };
        assert!(err.to_string().contains("conn refused"));
    }
}
