//! Native failures, classified into [`LockwatchError`] at the adapter edge.

use lockwatch_core::LockwatchError;
use std::time::Duration;
use thiserror::Error;

/// What went wrong inside a native call.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("{call} failed (os error {code})")]
    Os { call: &'static str, code: u32 },
    #[error("D-Bus: {0}")]
    Bus(String),
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
    #[error("{0}")]
    Native(String),
}

impl PlatformError {
    /// Failure while establishing a subscription.
    pub fn acquisition(self) -> LockwatchError {
        LockwatchError::ResourceAcquisitionFailed(self.to_string())
    }

    /// Failure while tearing a subscription down.
    pub fn release(self) -> LockwatchError {
        LockwatchError::ResourceReleaseFailed(self.to_string())
    }

    /// Failure while answering a state query.
    pub fn inspection(self) -> LockwatchError {
        LockwatchError::InspectionUnavailable(self.to_string())
    }
}

#[cfg(target_os = "linux")]
impl From<zbus::Error> for PlatformError {
    fn from(err: zbus::Error) -> Self {
        PlatformError::Bus(err.to_string())
    }
}

/// Result type for native calls.
pub type PlatformResult<T> = Result<T, PlatformError>;
