//! SQLite-backed precache store.
//!
//! One row per cache key; each put is a single `INSERT OR REPLACE`, so a
//! reader sees either the previous row or the new one, never a mix. Several
//! agents can share a file as long as their `cache_id`s differ.

use hashbrown::HashMap;
use offkit_core::{CacheKey, CacheVersion};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, trace};

use crate::{CachedResponse, PrecacheStore, StoreError, StoreResult, StoredKey};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Precache store persisted in a SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    cache_id: String,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>, cache_id: impl Into<String>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path).map_err(map_sqlite)?;
        info!(path = %path.display(), "Opened precache database");
        Self::with_connection(conn, cache_id)
    }

    /// Open a private in-memory database.
    pub fn in_memory(cache_id: impl Into<String>) -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(map_sqlite)?, cache_id)
    }

    fn with_connection(conn: Connection, cache_id: impl Into<String>) -> StoreResult<Self> {
        init_database(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            cache_id: cache_id.into(),
        })
    }

    pub fn cache_id(&self) -> &str {
        &self.cache_id
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))
    }
}

/// Create or migrate the schema.
fn init_database(conn: &Connection) -> StoreResult<()> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i32>(0).map(|count| count > 0),
        )
        .unwrap_or(false);

    let version: i32 = if table_exists {
        conn.query_row(
            "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0)
    } else {
        0
    };

    if version < 1 {
        create_schema_v1(conn)?;
    }
    if version < 2 {
        migrate_to_v2(conn)?;
    }

    Ok(())
}

/// Entries table and version index.
fn create_schema_v1(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS precache_entries (
            cache_id TEXT NOT NULL,
            cache_key TEXT NOT NULL,
            version TEXT NOT NULL,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            cached_at INTEGER NOT NULL,
            PRIMARY KEY (cache_id, cache_key)
        );

        CREATE INDEX IF NOT EXISTS idx_entries_version ON precache_entries(cache_id, version);
        "#,
    )?;

    record_version(conn, 1)
}

/// Adds the durable active-version record.
fn migrate_to_v2(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS agent_state (
            cache_id TEXT PRIMARY KEY,
            active_version TEXT NOT NULL,
            activated_at INTEGER NOT NULL
        );
        "#,
    )?;

    record_version(conn, SCHEMA_VERSION)
}

fn record_version(conn: &Connection, version: i32) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        params![version, chrono::Utc::now().timestamp()],
    )?;
    debug!(version, "Applied precache schema");
    Ok(())
}

/// Map disk-full and busy conditions onto the store taxonomy.
fn map_sqlite(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DiskFull) => StoreError::QuotaExceeded(e.to_string()),
        Some(ErrorCode::CannotOpen)
        | Some(ErrorCode::DatabaseBusy)
        | Some(ErrorCode::DatabaseLocked)
        | Some(ErrorCode::ReadOnly) => StoreError::Unavailable(e.to_string()),
        _ => StoreError::Sqlite(e),
    }
}

impl PrecacheStore for SqliteStore {
    fn put(&self, key: &CacheKey, response: CachedResponse) -> StoreResult<()> {
        let headers = serde_json::to_string(&response.headers).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO precache_entries
                (cache_id, cache_key, version, status, headers, body, cached_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                self.cache_id,
                key.as_str(),
                response.version.as_str(),
                response.status,
                headers,
                &response.body[..],
                response.cached_at,
            ],
        )
        .map_err(map_sqlite)?;

        trace!(key = %key, version = %response.version, bytes = response.body.len(), "put");
        Ok(())
    }

    fn get(&self, key: &CacheKey) -> StoreResult<Option<CachedResponse>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT version, status, headers, body, cached_at FROM precache_entries
                 WHERE cache_id = ? AND cache_key = ?",
                params![self.cache_id, key.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u16>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(map_sqlite)?;

        let Some((version, status, headers, body, cached_at)) = row else {
            return Ok(None);
        };

        let corrupt = |reason: String| StoreError::Corrupt {
            key: key.to_string(),
            reason,
        };
        let version = CacheVersion::new(version).map_err(|e| corrupt(e.to_string()))?;
        let headers: HashMap<String, String> =
            serde_json::from_str(&headers).map_err(|e| corrupt(e.to_string()))?;

        Ok(Some(CachedResponse {
            version,
            status,
            headers,
            body: body.into(),
            cached_at,
        }))
    }

    fn contains(&self, key: &CacheKey) -> StoreResult<bool> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM precache_entries WHERE cache_id = ? AND cache_key = ?",
                params![self.cache_id, key.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map_err(map_sqlite)?;
        Ok(found.is_some())
    }

    fn delete(&self, key: &CacheKey) -> StoreResult<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "DELETE FROM precache_entries WHERE cache_id = ? AND cache_key = ?",
                params![self.cache_id, key.as_str()],
            )
            .map_err(map_sqlite)?;
        Ok(changed > 0)
    }

    fn keys(&self) -> StoreResult<Vec<StoredKey>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT cache_key, version FROM precache_entries
                 WHERE cache_id = ? ORDER BY cache_key",
            )
            .map_err(map_sqlite)?;

        let rows = stmt
            .query_map(params![self.cache_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(map_sqlite)?;

        let mut keys = Vec::new();
        for row in rows {
            let (key, version) = row.map_err(map_sqlite)?;
            let version = CacheVersion::new(version).map_err(|e| StoreError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            keys.push(StoredKey {
                key: CacheKey::from_stored(key),
                version,
            });
        }
        Ok(keys)
    }

    fn active_version(&self) -> StoreResult<Option<CacheVersion>> {
        let conn = self.lock()?;
        let version: Option<String> = conn
            .query_row(
                "SELECT active_version FROM agent_state WHERE cache_id = ?",
                params![self.cache_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqlite)?;

        version
            .map(|v| {
                CacheVersion::new(v).map_err(|e| StoreError::Corrupt {
                    key: "agent_state".to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn set_active_version(&self, version: &CacheVersion) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO agent_state (cache_id, active_version, activated_at)
             VALUES (?, ?, ?)",
            params![self.cache_id, version.as_str(), chrono::Utc::now().timestamp()],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }

    fn delete_outside_version(&self, current: &CacheVersion) -> StoreResult<usize> {
        let conn = self.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM precache_entries WHERE cache_id = ? AND version != ?",
                params![self.cache_id, current.as_str()],
            )
            .map_err(map_sqlite)?;
        debug!(current = %current, removed, "Deleted entries outside version");
        Ok(removed)
    }
}
