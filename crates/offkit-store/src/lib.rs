//! # Offkit Precache Store
//!
//! Persistent, origin-scoped storage for precached responses.
//!
//! ## Features
//!
//! - **Per-key atomic writes**: a put either fully replaces the entry or
//!   leaves the previous one in place
//! - **Version tags**: every entry records the [`CacheVersion`] that wrote it
//! - **Garbage collection**: [`PrecacheStore::delete_outside_version`] drops
//!   everything written by superseded versions
//! - **Backends**: [`MemoryStore`] and [`SqliteStore`]
//!
//! ## Architecture
//!
//! ```text
//! PrecacheStore (trait)
//!     ├── MemoryStore   RwLock<HashMap<CacheKey, CachedResponse>>
//!     └── SqliteStore   Mutex<Connection>, one row per key
//!
//! CachedResponse
//!     ├── version  (CacheVersion tag)
//!     ├── status / headers
//!     └── body     (Bytes)
//! ```

use bytes::Bytes;
use hashbrown::HashMap;
use offkit_common::OffkitError;
use offkit_core::{CacheKey, CacheVersion};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

// ==================== Errors ====================

/// Errors reported by a precache store.
///
/// None of these are fatal to the agent: the caller logs them and lets the
/// affected asset fall back to the network.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for OffkitError {
    fn from(e: StoreError) -> Self {
        OffkitError::storage_with_source(e.to_string(), e)
    }
}

// ==================== Types ====================

/// A stored response body plus the metadata needed to replay it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Version that wrote this entry.
    pub version: CacheVersion,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: i64,
}

impl CachedResponse {
    /// Create a 200 response for `version`.
    pub fn new(version: CacheVersion, body: impl Into<Bytes>) -> Self {
        Self {
            version,
            status: 200,
            headers: HashMap::new(),
            body: body.into(),
            cached_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Set a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Same body and headers under another version tag.
    pub fn retagged(&self, version: CacheVersion) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }

    pub fn belongs_to(&self, version: &CacheVersion) -> bool {
        &self.version == version
    }
}

/// A key as enumerated for garbage collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoredKey {
    pub key: CacheKey,
    pub version: CacheVersion,
}

// ==================== Store ====================

/// Persistent key/value store for precached responses.
///
/// Every operation is atomic for a single key. There are no cross-key
/// transactions; the lifecycle controller is the only writer while it
/// installs or activates a version.
pub trait PrecacheStore: Send + Sync {
    /// Store `response` under `key`, replacing any previous entry whole.
    fn put(&self, key: &CacheKey, response: CachedResponse) -> StoreResult<()>;

    /// Read an entry.
    fn get(&self, key: &CacheKey) -> StoreResult<Option<CachedResponse>>;

    /// Remove an entry. Returns whether it existed.
    fn delete(&self, key: &CacheKey) -> StoreResult<bool>;

    /// Enumerate every stored key with its version tag.
    fn keys(&self) -> StoreResult<Vec<StoredKey>>;

    /// Version currently controlling the origin, if any has activated.
    fn active_version(&self) -> StoreResult<Option<CacheVersion>>;

    /// Record the version that just activated.
    fn set_active_version(&self, version: &CacheVersion) -> StoreResult<()>;

    /// Check for an entry.
    fn contains(&self, key: &CacheKey) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Delete every key not tagged with `current`. Returns how many went.
    fn delete_outside_version(&self, current: &CacheVersion) -> StoreResult<usize> {
        let mut removed = 0;
        for stored in self.keys()? {
            if &stored.version != current && self.delete(&stored.key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl<S: PrecacheStore + ?Sized> PrecacheStore for std::sync::Arc<S> {
    fn put(&self, key: &CacheKey, response: CachedResponse) -> StoreResult<()> {
        (**self).put(key, response)
    }

    fn get(&self, key: &CacheKey) -> StoreResult<Option<CachedResponse>> {
        (**self).get(key)
    }

    fn delete(&self, key: &CacheKey) -> StoreResult<bool> {
        (**self).delete(key)
    }

    fn keys(&self) -> StoreResult<Vec<StoredKey>> {
        (**self).keys()
    }

    fn active_version(&self) -> StoreResult<Option<CacheVersion>> {
        (**self).active_version()
    }

    fn set_active_version(&self, version: &CacheVersion) -> StoreResult<()> {
        (**self).set_active_version(version)
    }

    fn contains(&self, key: &CacheKey) -> StoreResult<bool> {
        (**self).contains(key)
    }

    fn delete_outside_version(&self, current: &CacheVersion) -> StoreResult<usize> {
        (**self).delete_outside_version(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retagged_keeps_body() {
        let v1 = CacheVersion::new("v1").unwrap();
        let v2 = CacheVersion::new("v2").unwrap();
        let response = CachedResponse::new(v1.clone(), "body").with_header("Content-Type", "text/css");

        let moved = response.retagged(v2.clone());
        assert!(moved.belongs_to(&v2));
        assert!(!moved.belongs_to(&v1));
        assert_eq!(moved.body, Bytes::from_static(b"body"));
        assert_eq!(moved.headers.get("content-type").map(String::as_str), Some("text/css"));
    }

    #[test]
    fn test_store_error_maps_to_storage() {
        let err: OffkitError = StoreError::QuotaExceeded("full".into()).into();
        assert_eq!(err.category(), "storage");
        assert!(!err.is_retryable());
    }
}
