//! # Offkit Common
//!
//! Common utilities, error types, and logging configuration for the Offkit agent.
//!
//! ## Features
//!
//! - Unified error type shared by the agent crates and the CLI
//! - Logging configuration and setup
//! - Retry utilities for precache fetches

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_if, retry_with_backoff, RetryConfig};

/// Unified error type for Offkit.
#[derive(Error, Debug)]
pub enum OffkitError {
    /// Precache storage errors (quota, unavailable backend).
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Network-related errors.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Asset manifest errors.
    #[error("Manifest error: {message}")]
    Manifest {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Lifecycle state errors.
    #[error("Lifecycle error: {message}")]
    Lifecycle {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Cancelled operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl OffkitError {
    /// Create a storage error with source.
    pub fn storage_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a network error with source.
    pub fn network_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a manifest error.
    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest {
            message: message.into(),
            source: None,
        }
    }

    /// Create a lifecycle error.
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if this error is retryable.
    ///
    /// Storage errors are not: a failed put degrades that asset to the
    /// network until the next activation tries again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OffkitError::Network { .. } | OffkitError::Timeout(_) | OffkitError::Io(_)
        )
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            OffkitError::Storage { .. } => "storage",
            OffkitError::Network { .. } => "network",
            OffkitError::Manifest { .. } => "manifest",
            OffkitError::Lifecycle { .. } => "lifecycle",
            OffkitError::Config { .. } => "config",
            OffkitError::Io(_) => "io",
            OffkitError::Timeout(_) => "timeout",
            OffkitError::Cancelled => "cancelled",
            OffkitError::NotFound(_) => "not_found",
            OffkitError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

/// Result type alias for Offkit operations.
pub type Result<T> = std::result::Result<T, OffkitError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn io_error() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::Other, "disk gone")
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(OffkitError::storage_with_source("quota", io_error()).category(), "storage");
        assert_eq!(OffkitError::network_with_source("offline", io_error()).category(), "network");
        assert_eq!(OffkitError::manifest("dup").category(), "manifest");
        assert_eq!(OffkitError::InvalidArgument("url".into()).category(), "invalid_argument");
        assert_eq!(
            OffkitError::Timeout(Duration::from_secs(1)).category(),
            "timeout"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(OffkitError::network_with_source("offline", io_error()).is_retryable());
        assert!(OffkitError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!OffkitError::storage_with_source("quota", io_error()).is_retryable());
        assert!(!OffkitError::Cancelled.is_retryable());
    }

    #[test]
    fn test_source_is_kept() {
        let err = OffkitError::config_with_source("loading agent.json", io_error());
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "disk gone");
    }
}
