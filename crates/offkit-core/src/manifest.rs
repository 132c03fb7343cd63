//! Asset manifest, cache keys and cache versions.
//!
//! A manifest is produced at build time and handed to the agent as-is. It is
//! never mutated at runtime; the agent only resolves it against its scope and
//! derives one [`CacheKey`] per entry.

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::error::ManifestError;

/// Query parameter carrying the revision inside a revisioned cache key.
pub const REVISION_PARAM: &str = "__rev";

/// One generation of precached content, e.g. a build id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheVersion(String);

impl CacheVersion {
    /// Create a version tag. Empty tags are rejected.
    pub fn new(version: impl Into<String>) -> Result<Self, ManifestError> {
        let version = version.into();
        if version.trim().is_empty() {
            return Err(ManifestError::EmptyVersion);
        }
        Ok(Self(version))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key under which one immutable response body is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for `url` at `revision`.
    ///
    /// Without a revision the URL (minus fragment) is the key. With one, the
    /// revision is appended as `__rev=<revision>`.
    pub fn derive(url: &Url, revision: Option<&str>) -> Self {
        let mut keyed = url.clone();
        keyed.set_fragment(None);
        if let Some(revision) = revision {
            keyed.query_pairs_mut().append_pair(REVISION_PARAM, revision);
        }
        Self(keyed.into())
    }

    /// Key for a URL that carries no revision.
    pub fn bare(url: &Url) -> Self {
        Self::derive(url, None)
    }

    /// Split a key back into the URL and revision it was derived from.
    ///
    /// Returns `None` when the key is not an absolute URL.
    pub fn to_parts(&self) -> Option<(Url, Option<String>)> {
        let mut url = Url::parse(&self.0).ok()?;
        let marker = format!("{REVISION_PARAM}=");

        let Some(query) = url.query().map(str::to_string) else {
            return Some((url, None));
        };
        let (rest, encoded) = match query.rfind(&format!("&{marker}")) {
            Some(at) => (Some(&query[..at]), &query[at + 1 + marker.len()..]),
            None if query.starts_with(&marker) => (None, &query[marker.len()..]),
            None => return Some((url, None)),
        };
        // The revision is always the last pair.
        if encoded.contains('&') {
            return Some((url, None));
        }

        let revision = url::form_urlencoded::parse(encoded.as_bytes())
            .next()
            .map(|(value, _)| value.into_owned())
            .unwrap_or_default();
        url.set_query(rest);
        Some((url, Some(revision)))
    }

    /// Wrap a key read back from storage.
    pub fn from_stored(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One asset listed by the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Absolute or scope-relative URL.
    pub url: String,
    /// Content hash; `None` for content-addressed URLs.
    #[serde(default)]
    pub revision: Option<String>,
}

impl ManifestEntry {
    pub fn new(url: impl Into<String>, revision: Option<&str>) -> Self {
        Self {
            url: url.into(),
            revision: revision.map(str::to_string),
        }
    }
}

/// A manifest entry resolved against the agent scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecacheAsset {
    pub url: Url,
    pub revision: Option<String>,
    pub key: CacheKey,
}

impl PrecacheAsset {
    /// Rebuild the asset a stored key was derived from.
    pub fn from_key(key: CacheKey) -> Option<Self> {
        let (url, revision) = key.to_parts()?;
        Some(Self { url, revision, key })
    }
}

/// Immutable, ordered asset list for one [`CacheVersion`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    version: CacheVersion,
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Build a manifest, rejecting duplicate URLs.
    pub fn new(version: CacheVersion, entries: Vec<ManifestEntry>) -> Result<Self, ManifestError> {
        {
            let mut seen = HashSet::with_capacity(entries.len());
            for entry in &entries {
                if !seen.insert(entry.url.as_str()) {
                    return Err(ManifestError::DuplicateUrl(entry.url.clone()));
                }
            }
        }
        Ok(Self { version, entries })
    }

    /// Parse the build output: a JSON array of `{ "url", "revision" }`.
    pub fn from_json(version: CacheVersion, json: &str) -> Result<Self, ManifestError> {
        let entries: Vec<ManifestEntry> =
            serde_json::from_str(json).map_err(|e| ManifestError::Malformed(e.to_string()))?;
        Self::new(version, entries)
    }

    pub fn version(&self) -> &CacheVersion {
        &self.version
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve every entry against `scope` and derive its cache key.
    ///
    /// Two entries that spell the same asset differently (`/a.js` and
    /// `a.js` under a root scope) are reported as duplicates.
    pub fn resolve(&self, scope: &Url) -> Result<Vec<PrecacheAsset>, ManifestError> {
        let mut seen = HashSet::with_capacity(self.entries.len());
        let mut assets = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            let mut url = scope
                .join(&entry.url)
                .map_err(|e| ManifestError::invalid_url(&entry.url, e))?;
            url.set_fragment(None);

            if !seen.insert(url.clone()) {
                return Err(ManifestError::DuplicateUrl(url.into()));
            }

            let key = CacheKey::derive(&url, entry.revision.as_deref());
            assets.push(PrecacheAsset {
                url,
                revision: entry.revision.clone(),
                key,
            });
        }

        Ok(assets)
    }
}
