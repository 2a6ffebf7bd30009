//! Error handling for bucket publishing
//!
//! Run-level failures (`PublishError`) stop a publish run before any upload is
//! attempted. Storage failures (`StorageError`) are captured per task and folded
//! into the run report instead of being propagated.

use thiserror::Error;

/// Run-level error type for publishing operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    // Configuration errors
    #[error("No storage profile is configured")]
    ProfileNotConfigured,

    #[error("Storage profile '{name}' is not configured")]
    ProfileNotFound { name: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("[{field}] {message}")]
    InvalidConfig { field: String, message: String },

    // Session errors
    #[error("[{profile}] Can't connect to storage service: {message}")]
    AuthenticationFailed { profile: String, message: String },
}

impl PublishError {
    /// Get suggested actions for this error
    pub fn suggested_actions(&self) -> Vec<&'static str> {
        match self {
            Self::ProfileNotConfigured => vec![
                "Add at least one storage profile to the profiles file",
                "Check that the profiles file is loaded before the run starts",
            ],
            Self::ProfileNotFound { .. } => vec![
                "Check the profile name in the publisher configuration",
                "Remove profileName to fall back to the first configured profile",
            ],
            Self::ConfigError(_) | Self::InvalidConfig { .. } => {
                vec!["Fix the configuration file and run again"]
            }
            Self::AuthenticationFailed { .. } => vec![
                "Check the access key and secret key of the profile",
                "Check network connectivity to the storage service",
            ],
        }
    }

    /// Get error code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProfileNotConfigured => "PROFILE_NOT_CONFIGURED",
            Self::ProfileNotFound { .. } => "PROFILE_NOT_FOUND",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::AuthenticationFailed { .. } => "AUTHENTICATION_FAILED",
        }
    }
}

/// Errors reported by a storage capability
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Access denied to {bucket}: {message}")]
    AccessDenied { bucket: String, message: String },

    #[error("Invalid bucket name '{bucket}': {message}")]
    InvalidBucket { bucket: String, message: String },

    #[error("Size mismatch for {key}: expected {expected} bytes, got {actual}")]
    SizeMismatch { key: String, expected: u64, actual: u64 },

    #[error("Network error: {message}")]
    Network { message: String, retryable: bool },

    #[error("I/O error for {path}: {message}")]
    Io { path: String, message: String },

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("{message}")]
    Other { message: String },
}

impl StorageError {
    /// Check if this error is worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::Io { .. } | Self::SizeMismatch { .. } | Self::Other { .. } => true,
            Self::AccessDenied { .. } | Self::InvalidBucket { .. } | Self::Cancelled => false,
        }
    }

    pub(crate) fn io(path: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
