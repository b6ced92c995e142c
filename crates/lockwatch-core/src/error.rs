//! Common error types for lockwatch.

use thiserror::Error;

/// Errors surfaced by subscriptions and session queries.
#[derive(Debug, Error)]
pub enum LockwatchError {
    /// The native subscription mechanism could not be established.
    #[error("resource acquisition failed: {0}")]
    ResourceAcquisitionFailed(String),
    /// Native resources could not be released within the shutdown bound.
    #[error("resource release failed: {0}")]
    ResourceReleaseFailed(String),
    /// A session state query could not be performed.
    #[error("inspection unavailable: {0}")]
    InspectionUnavailable(String),
    /// No adapter exists for the host OS or desktop environment.
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<serde_yaml::Error> for LockwatchError {
    fn from(err: serde_yaml::Error) -> Self {
        LockwatchError::Config(err.to_string())
    }
}

/// Result type for lockwatch operations.
pub type LockwatchResult<T> = Result<T, LockwatchError>;
