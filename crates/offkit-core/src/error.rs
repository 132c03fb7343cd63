//! Error types for manifest loading and agent configuration

use offkit_common::OffkitError;
use thiserror::Error;

/// Errors raised while loading or resolving an asset manifest.
///
/// These are build-time configuration mistakes; the agent refuses the
/// manifest rather than precaching an ambiguous asset set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Duplicate manifest URL: {0}")]
    DuplicateUrl(String),

    #[error("Invalid manifest URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Empty cache version")]
    EmptyVersion,

    #[error("Malformed manifest: {0}")]
    Malformed(String),
}

/// Errors raised while loading or validating [`crate::AgentConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid scope {0:?}: must be an absolute URL ending in '/'")]
    InvalidScope(String),

    #[error("Invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid app shell {0:?}")]
    InvalidAppShell(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ManifestError {
    /// Create an invalid URL error.
    pub fn invalid_url(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<ManifestError> for OffkitError {
    fn from(e: ManifestError) -> Self {
        OffkitError::manifest(e.to_string())
    }
}

impl From<ConfigError> for OffkitError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Io(io) => OffkitError::Io(io),
            other => OffkitError::config_with_source(other.to_string(), other),
        }
    }
}
