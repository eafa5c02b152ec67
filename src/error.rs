//! Custom error types for Shepherd.
//!
//! This module provides structured error types that enable better
//! error handling, reporting, and recovery throughout the bot.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Shepherd operations
#[derive(Error, Debug)]
pub enum ShepherdError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    /// Unknown CI provider requested
    #[error("Unknown CI provider: {provider} (valid: {valid})")]
    UnknownCiProvider { provider: String, valid: String },

    // =========================================================================
    // Reconciliation Errors
    // =========================================================================
    /// Contradictory or oscillating label proposal; fatal to the item only
    #[error("Policy conflict on item #{item}: label '{label}' {detail}")]
    PolicyConflict {
        item: u64,
        label: String,
        detail: String,
    },

    // =========================================================================
    // Remote Call Errors
    // =========================================================================
    /// Remote API call failed in a way the governor could not recover
    #[error("Remote call failed: {message}")]
    Remote { message: String },

    /// Retry ceiling reached; fatal to the whole process
    #[error("Retry ceiling reached after {attempts} attempts: {message}")]
    RetryExhausted { attempts: u32, message: String },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Snapshot store failure
    #[error("Snapshot error for item #{item}: {message}")]
    Snapshot { item: u64, message: String },

    /// Rate quota persistence failure
    #[error("Quota store error: {message}")]
    QuotaStore { message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ShepherdError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create a policy conflict error
    pub fn policy_conflict(item: u64, label: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::PolicyConflict {
            item,
            label: label.into(),
            detail: detail.into(),
        }
    }

    /// Create a remote error
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Create a snapshot error
    pub fn snapshot(item: u64, message: impl Into<String>) -> Self {
        Self::Snapshot {
            item,
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error aborts only the current item (batch continues)
    pub fn is_item_fatal(&self) -> bool {
        matches!(
            self,
            Self::PolicyConflict { .. } | Self::Remote { .. } | Self::Snapshot { .. }
        )
    }

    /// Check if this error must terminate the whole process
    pub fn is_process_fatal(&self) -> bool {
        matches!(
            self,
            Self::RetryExhausted { .. }
                | Self::Config { .. }
                | Self::InvalidConfig { .. }
                | Self::UnknownCiProvider { .. }
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        // 0 is reserved for normal completion; every error that escapes to
        // the process boundary terminates with 1
        1
    }
}

/// Type alias for Shepherd results
pub type Result<T> = std::result::Result<T, ShepherdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ShepherdError::policy_conflict(42, "needs_info", "is waffling");
        assert!(err.to_string().contains("42"));
        assert!(err.to_string().contains("needs_info"));
    }

    #[test]
    fn test_is_item_fatal() {
        assert!(ShepherdError::policy_conflict(1, "module", "in both sets").is_item_fatal());
        assert!(ShepherdError::remote("boom").is_item_fatal());
        assert!(!ShepherdError::config("bad").is_item_fatal());
    }

    #[test]
    fn test_is_process_fatal() {
        assert!(ShepherdError::RetryExhausted {
            attempts: 10,
            message: "gave up".into()
        }
        .is_process_fatal());
        assert!(ShepherdError::config("bad").is_process_fatal());
        assert!(ShepherdError::UnknownCiProvider {
            provider: "jenkins".into(),
            valid: "azp, gha".into()
        }
        .is_process_fatal());
        assert!(!ShepherdError::policy_conflict(1, "module", "waffling").is_process_fatal());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ShepherdError::config("test").exit_code(), 1);
        assert_eq!(
            ShepherdError::RetryExhausted {
                attempts: 10,
                message: "test".into()
            }
            .exit_code(),
            1
        );
    }

    #[test]
    fn test_config_with_path() {
        let path = PathBuf::from("/test/shepherd.toml");
        let err = ShepherdError::config_with_path("failed to parse", path.clone());
        if let ShepherdError::Config {
            message,
            path: opt_path,
        } = err
        {
            assert_eq!(message, "failed to parse");
            assert_eq!(opt_path, Some(path));
        } else {
            panic!("Wrong error variant");
        }
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: ShepherdError = io_err.into();
        assert!(matches!(err, ShepherdError::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }
}
