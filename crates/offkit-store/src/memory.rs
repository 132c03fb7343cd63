//! In-memory precache store.
//!
//! Used by tests and by hosts that keep the store elsewhere. An optional byte
//! quota makes [`StoreError::QuotaExceeded`] reproducible.

use hashbrown::HashMap;
use offkit_core::{CacheKey, CacheVersion};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

use crate::{CachedResponse, PrecacheStore, StoreError, StoreResult, StoredKey};

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<CacheKey, CachedResponse>,
    active: Option<CacheVersion>,
    bytes_used: usize,
}

/// Precache store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    quota: Option<usize>,
}

impl MemoryStore {
    /// Create an unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that rejects puts once bodies exceed `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            inner: RwLock::default(),
            quota: Some(bytes),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.read().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total body bytes held.
    pub fn bytes_used(&self) -> usize {
        self.read().map(|inner| inner.bytes_used).unwrap_or(0)
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl PrecacheStore for MemoryStore {
    fn put(&self, key: &CacheKey, response: CachedResponse) -> StoreResult<()> {
        let mut inner = self.write()?;

        let replaced = inner.entries.get(key).map_or(0, |old| old.body.len());
        let after = inner.bytes_used - replaced + response.body.len();
        if let Some(quota) = self.quota {
            if after > quota {
                return Err(StoreError::QuotaExceeded(format!(
                    "{} would need {} of {} bytes",
                    key, after, quota
                )));
            }
        }

        trace!(key = %key, version = %response.version, bytes = response.body.len(), "put");
        inner.bytes_used = after;
        inner.entries.insert(key.clone(), response);
        Ok(())
    }

    fn get(&self, key: &CacheKey) -> StoreResult<Option<CachedResponse>> {
        Ok(self.read()?.entries.get(key).cloned())
    }

    fn contains(&self, key: &CacheKey) -> StoreResult<bool> {
        Ok(self.read()?.entries.contains_key(key))
    }

    fn delete(&self, key: &CacheKey) -> StoreResult<bool> {
        let mut inner = self.write()?;
        match inner.entries.remove(key) {
            Some(old) => {
                inner.bytes_used -= old.body.len();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn keys(&self) -> StoreResult<Vec<StoredKey>> {
        let inner = self.read()?;
        let mut keys: Vec<StoredKey> = inner
            .entries
            .iter()
            .map(|(key, response)| StoredKey {
                key: key.clone(),
                version: response.version.clone(),
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn active_version(&self) -> StoreResult<Option<CacheVersion>> {
        Ok(self.read()?.active.clone())
    }

    fn set_active_version(&self, version: &CacheVersion) -> StoreResult<()> {
        self.write()?.active = Some(version.clone());
        Ok(())
    }

    fn delete_outside_version(&self, current: &CacheVersion) -> StoreResult<usize> {
        let mut inner = self.write()?;
        let before = inner.entries.len();
        let mut freed = 0;
        inner.entries.retain(|_, response| {
            let keep = response.belongs_to(current);
            if !keep {
                freed += response.body.len();
            }
            keep
        });
        inner.bytes_used -= freed;

        let removed = before - inner.entries.len();
        debug!(current = %current, removed, freed, "Deleted entries outside version");
        Ok(removed)
    }
}
