//! Synchronization layer error types.

use std::fmt;

/// Errors returned by backend-facing operations.
///
/// Hazard tracking and barrier emission never produce these; they only
/// surface from native handle creation, submission and waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Failed to initialize the backend.
    InitializationFailed(String),
    /// Failed to create a native object (buffer, image, command buffer, fence).
    ResourceCreationFailed(String),
    /// A queue submission was rejected by the driver.
    SubmissionFailed(String),
    /// Waiting on a fence exceeded the configured timeout.
    Timeout,
    /// Out of GPU memory.
    OutOfMemory,
    /// The GPU device was lost.
    DeviceLost,
    /// A handle refers to a slot that was freed or reused.
    StaleHandle(String),
    /// An invalid parameter was provided.
    InvalidParameter(String),
    /// An internal error occurred.
    Internal(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitializationFailed(msg) => write!(f, "initialization failed: {msg}"),
            Self::ResourceCreationFailed(msg) => write!(f, "resource creation failed: {msg}"),
            Self::SubmissionFailed(msg) => write!(f, "queue submission failed: {msg}"),
            Self::Timeout => write!(f, "fence wait timed out"),
            Self::OutOfMemory => write!(f, "out of GPU memory"),
            Self::DeviceLost => write!(f, "GPU device lost"),
            Self::StaleHandle(msg) => write!(f, "stale handle: {msg}"),
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for SyncError {}

#[cfg(feature = "vulkan-backend")]
impl From<ash::vk::Result> for SyncError {
    fn from(result: ash::vk::Result) -> Self {
        match result {
            ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::OutOfMemory
            }
            ash::vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            ash::vk::Result::TIMEOUT => Self::Timeout,
            other => Self::Internal(format!("{other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::OutOfMemory;
        assert_eq!(err.to_string(), "out of GPU memory");

        let err = SyncError::SubmissionFailed("queue busy".to_string());
        assert_eq!(err.to_string(), "queue submission failed: queue busy");

        let err = SyncError::StaleHandle("res#3.1".to_string());
        assert_eq!(err.to_string(), "stale handle: res#3.1");
    }

    #[test]
    fn test_error_is_std_error() {
        fn takes_error(_: &dyn std::error::Error) {}
        takes_error(&SyncError::Timeout);
    }
}
