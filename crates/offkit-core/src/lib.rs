//! Offkit Core Library
//!
//! Shared configuration, asset manifest types and their errors.

pub mod config;
pub mod error;
pub mod manifest;

pub use config::{AgentConfig, NavigationMode, NotificationDefaults, PatternSpec};
pub use error::{ConfigError, ManifestError};
pub use manifest::{CacheKey, CacheVersion, Manifest, ManifestEntry, PrecacheAsset};
