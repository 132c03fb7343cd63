//! Install and activate steps.
//!
//! Install fills the store for an incoming version without disturbing the
//! version that is currently serving; activate removes everything else.

use futures::stream::{self, StreamExt};
use offkit_common::retry::{retry_if, RetryConfig};
use offkit_core::{CacheKey, CacheVersion, PrecacheAsset};
use offkit_net::{Fetcher, NetError, Request, Response};
use offkit_store::{CachedResponse, PrecacheStore, StoreResult};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::registration::ServiceWorkerId;
use crate::ServiceWorkerError;

/// Default number of precache downloads in flight.
pub const DEFAULT_CONCURRENCY: usize = 6;

/// Cancellation flag shared by a worker and its install job.
///
/// Store writes run while holding the flag, so once [`InstallGate::cancel`]
/// returns no further write of that job can land.
#[derive(Debug, Clone, Default)]
pub struct InstallGate(Arc<Mutex<bool>>);

impl InstallGate {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raise the flag, waiting for an in-flight write to finish.
    pub fn cancel(&self) {
        *self.lock() = true;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.lock()
    }

    /// Run `write` unless cancelled.
    fn write<T>(&self, write: impl FnOnce() -> T) -> Option<T> {
        let cancelled = self.lock();
        if *cancelled {
            None
        } else {
            Some(write())
        }
    }
}

/// What an installer needs to precache one version.
#[derive(Debug, Clone)]
pub struct InstallJob {
    pub worker_id: ServiceWorkerId,
    pub version: CacheVersion,
    pub assets: Arc<Vec<PrecacheAsset>>,
    pub(crate) gate: InstallGate,
}

impl InstallJob {
    /// Set once a newer version supersedes this one.
    pub fn is_cancelled(&self) -> bool {
        self.gate.is_cancelled()
    }

    fn ensure_live(&self) -> Result<(), ServiceWorkerError> {
        if self.is_cancelled() {
            Err(self.superseded())
        } else {
            Ok(())
        }
    }

    fn superseded(&self) -> ServiceWorkerError {
        ServiceWorkerError::Superseded(self.version.clone())
    }

    /// Store `response` under `key` unless the job was cancelled.
    fn put(
        &self,
        store: &dyn PrecacheStore,
        key: &CacheKey,
        response: CachedResponse,
    ) -> Result<StoreResult<()>, ServiceWorkerError> {
        self.gate
            .write(|| store.put(key, response))
            .ok_or_else(|| self.superseded())
    }
}

/// Outcome of installing one version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    /// Downloaded and stored.
    pub written: usize,
    /// Already stored under another version; re-tagged without a download.
    pub reused: usize,
    /// Already stored under this version.
    pub skipped: usize,
    /// URLs that could not be stored; served from the network instead.
    pub failed: Vec<String>,
}

impl InstallReport {
    /// Number of manifest entries accounted for.
    pub fn total(&self) -> usize {
        self.written + self.reused + self.skipped + self.failed.len()
    }
}

/// Outcome of activating one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivateReport {
    pub version: CacheVersion,
    pub previous: Option<CacheVersion>,
    /// Entries of other versions removed.
    pub removed: usize,
}

enum AssetOutcome {
    Written,
    Reused,
    Skipped,
    Failed(String),
}

/// Downloads a version's manifest into the precache store.
pub struct Installer {
    store: Arc<dyn PrecacheStore>,
    fetcher: Arc<dyn Fetcher>,
    retry: RetryConfig,
    concurrency: usize,
}

impl Installer {
    pub fn new(store: Arc<dyn PrecacheStore>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            store,
            fetcher,
            retry: RetryConfig::default(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Precache every asset of `job`.
    ///
    /// Individual failures are counted in the report, never returned. The
    /// only error is [`ServiceWorkerError::Superseded`], after which no
    /// further store writes happen for this job.
    pub async fn install(&self, job: &InstallJob) -> Result<InstallReport, ServiceWorkerError> {
        info!(version = %job.version, assets = job.assets.len(), "Installing");

        let mut outcomes = stream::iter(job.assets.iter())
            .map(|asset| self.precache_asset(job, asset))
            .buffer_unordered(self.concurrency);

        let mut report = InstallReport::default();
        while let Some(outcome) = outcomes.next().await {
            match outcome? {
                AssetOutcome::Written => report.written += 1,
                AssetOutcome::Reused => report.reused += 1,
                AssetOutcome::Skipped => report.skipped += 1,
                AssetOutcome::Failed(url) => report.failed.push(url),
            }
        }
        job.ensure_live()?;

        report.failed.sort();
        info!(
            version = %job.version,
            written = report.written,
            reused = report.reused,
            skipped = report.skipped,
            failed = report.failed.len(),
            "Install finished"
        );
        Ok(report)
    }

    async fn precache_asset(
        &self,
        job: &InstallJob,
        asset: &PrecacheAsset,
    ) -> Result<AssetOutcome, ServiceWorkerError> {
        job.ensure_live()?;

        match self.store.get(&asset.key) {
            Ok(Some(existing)) if existing.belongs_to(&job.version) => {
                debug!(key = %asset.key, "Already precached");
                return Ok(AssetOutcome::Skipped);
            }
            Ok(Some(existing)) => {
                // Same key means same revision, so the stored bytes are current.
                let retagged = existing.retagged(job.version.clone());
                return Ok(match job.put(self.store.as_ref(), &asset.key, retagged)? {
                    Ok(()) => {
                        debug!(key = %asset.key, from = %existing.version, "Reused precached entry");
                        AssetOutcome::Reused
                    }
                    Err(e) => {
                        warn!(key = %asset.key, error = %e, "Failed to re-tag precached entry");
                        AssetOutcome::Failed(asset.url.to_string())
                    }
                });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(key = %asset.key, error = %e, "Precache lookup failed, downloading");
            }
        }

        let fetcher = &self.fetcher;
        let url = &asset.url;
        let response = retry_if(
            &self.retry,
            || async move {
                fetcher
                    .fetch(Request::precache(url.clone()))
                    .await?
                    .error_for_status()
            },
            NetError::is_retryable,
        )
        .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %asset.url, error = %e, "Precache download failed; asset stays network-only");
                return Ok(AssetOutcome::Failed(asset.url.to_string()));
            }
        };

        match job.put(self.store.as_ref(), &asset.key, cached_response(&job.version, response))? {
            Ok(()) => {
                debug!(key = %asset.key, "Precached");
                Ok(AssetOutcome::Written)
            }
            Err(e) => {
                warn!(key = %asset.key, error = %e, "Failed to store precached response");
                Ok(AssetOutcome::Failed(asset.url.to_string()))
            }
        }
    }
}

fn cached_response(version: &CacheVersion, response: Response) -> CachedResponse {
    let mut cached = CachedResponse::new(version.clone(), response.body);
    cached.status = response.status.as_u16();
    for (name, value) in response.headers.iter() {
        if let Ok(value) = value.to_str() {
            cached = cached.with_header(name.as_str(), value);
        }
    }
    cached
}

/// Make `version` the only one in the store and record it as active.
///
/// Idempotent. Failures are logged: leftover entries are unreachable through
/// the new router and get another chance at the next activation.
pub fn activate(
    store: &dyn PrecacheStore,
    version: &CacheVersion,
    previous: Option<CacheVersion>,
) -> ActivateReport {
    let removed = match store.delete_outside_version(version) {
        Ok(removed) => removed,
        Err(e) => {
            warn!(version = %version, error = %e, "Failed to remove outdated precache entries");
            0
        }
    };

    if let Err(e) = store.set_active_version(version) {
        warn!(version = %version, error = %e, "Failed to record active version");
    }

    info!(version = %version, previous = ?previous.as_ref().map(CacheVersion::as_str), removed, "Activated");
    ActivateReport {
        version: version.clone(),
        previous,
        removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hashbrown::HashMap;
    use http::StatusCode;
    use offkit_core::{Manifest, ManifestEntry};
    use offkit_store::{MemoryStore, StoredKey};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread::JoinHandle;
    use std::time::Duration;
    use url::Url;

    #[derive(Default)]
    struct ScriptedFetcher {
        routes: HashMap<String, (u16, &'static str)>,
        calls: AtomicUsize,
        cancel_after_first: Option<InstallGate>,
    }

    impl ScriptedFetcher {
        fn route(mut self, url: &str, status: u16, body: &'static str) -> Self {
            self.routes.insert(url.to_string(), (status, body));
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, request: Request) -> Result<Response, NetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.cancel_after_first {
                gate.cancel();
            }
            match self.routes.get(request.url.as_str()) {
                Some((status, body)) => {
                    let mut response = Response::ok_with(request.url, *body);
                    response.status = StatusCode::from_u16(*status).unwrap();
                    Ok(response)
                }
                None => Err(NetError::Offline),
            }
        }
    }

    fn job(version: &str, entries: Vec<ManifestEntry>) -> InstallJob {
        let manifest = Manifest::new(CacheVersion::new(version).unwrap(), entries).unwrap();
        let assets = manifest.resolve(&Url::parse("https://app.example/").unwrap()).unwrap();
        InstallJob {
            worker_id: ServiceWorkerId::new(),
            version: manifest.version().clone(),
            assets: Arc::new(assets),
            gate: InstallGate::default(),
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        }
    }

    fn installer(store: &Arc<MemoryStore>, fetcher: &Arc<ScriptedFetcher>) -> Installer {
        Installer::new(store.clone(), fetcher.clone()).with_retry(fast_retry())
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::from_stored(s)
    }

    #[tokio::test]
    async fn test_install_writes_every_asset() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .route("https://app.example/index.html", 200, "<html>")
                .route("https://app.example/app.js", 200, "js"),
        );
        let job = job(
            "v1",
            vec![
                ManifestEntry::new("/index.html", Some("r1")),
                ManifestEntry::new("/app.js", None),
            ],
        );

        let report = installer(&store, &fetcher).install(&job).await.unwrap();
        assert_eq!(report.written, 2);
        assert_eq!(report.total(), 2);

        let shell = store.get(&key("https://app.example/index.html?__rev=r1")).unwrap().unwrap();
        assert_eq!(&shell.body[..], b"<html>");
        assert_eq!(shell.version.as_str(), "v1");
    }

    #[tokio::test]
    async fn test_install_skips_and_reuses() {
        let store = Arc::new(MemoryStore::new());
        let v0 = CacheVersion::new("v0").unwrap();
        let v1 = CacheVersion::new("v1").unwrap();
        store
            .put(&key("https://app.example/a.js"), CachedResponse::new(v1.clone(), "a"))
            .unwrap();
        store
            .put(&key("https://app.example/b.js"), CachedResponse::new(v0, "b"))
            .unwrap();

        let fetcher = Arc::new(ScriptedFetcher::default());
        let job = job(
            "v1",
            vec![ManifestEntry::new("/a.js", None), ManifestEntry::new("/b.js", None)],
        );

        let report = installer(&store, &fetcher).install(&job).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.reused, 1);
        assert_eq!(fetcher.calls(), 0);

        let b = store.get(&key("https://app.example/b.js")).unwrap().unwrap();
        assert!(b.belongs_to(&v1));
        assert_eq!(&b.body[..], b"b");
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(ScriptedFetcher::default().route("https://app.example/gone.js", 404, ""));
        let job = job("v1", vec![ManifestEntry::new("/gone.js", None)]);

        let report = installer(&store, &fetcher).install(&job).await.unwrap();
        assert_eq!(report.failed, vec!["https://app.example/gone.js".to_string()]);
        assert_eq!(fetcher.calls(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_retried_then_skipped() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(ScriptedFetcher::default());
        let job = job("v1", vec![ManifestEntry::new("/flaky.js", None)]);

        let report = installer(&store, &fetcher).install(&job).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_install_stops_writing() {
        let store = Arc::new(MemoryStore::new());
        let job = job(
            "v1",
            vec![ManifestEntry::new("/a.js", None), ManifestEntry::new("/b.js", None)],
        );
        let fetcher = Arc::new(ScriptedFetcher {
            cancel_after_first: Some(job.gate.clone()),
            ..ScriptedFetcher::default()
                .route("https://app.example/a.js", 200, "a")
                .route("https://app.example/b.js", 200, "b")
        });

        let result = installer(&store, &fetcher).with_concurrency(1).install(&job).await;
        assert!(matches!(result, Err(ServiceWorkerError::Superseded(_))));
        assert!(store.is_empty());
    }

    /// Store whose first write races a cancellation from another thread.
    struct RacingStore {
        inner: MemoryStore,
        gate: InstallGate,
        cancel_returned_mid_write: AtomicBool,
        canceller: Mutex<Option<JoinHandle<()>>>,
    }

    impl PrecacheStore for RacingStore {
        fn put(&self, key: &CacheKey, response: CachedResponse) -> StoreResult<()> {
            let mut canceller = self.canceller.lock().unwrap();
            if canceller.is_none() {
                let gate = self.gate.clone();
                let returned = Arc::new(AtomicBool::new(false));
                let flag = returned.clone();
                *canceller = Some(std::thread::spawn(move || {
                    gate.cancel();
                    flag.store(true, Ordering::SeqCst);
                }));
                std::thread::sleep(Duration::from_millis(50));
                if returned.load(Ordering::SeqCst) {
                    self.cancel_returned_mid_write.store(true, Ordering::SeqCst);
                }
            }
            self.inner.put(key, response)
        }

        fn get(&self, key: &CacheKey) -> StoreResult<Option<CachedResponse>> {
            self.inner.get(key)
        }

        fn delete(&self, key: &CacheKey) -> StoreResult<bool> {
            self.inner.delete(key)
        }

        fn keys(&self) -> StoreResult<Vec<StoredKey>> {
            self.inner.keys()
        }

        fn active_version(&self) -> StoreResult<Option<CacheVersion>> {
            self.inner.active_version()
        }

        fn set_active_version(&self, version: &CacheVersion) -> StoreResult<()> {
            self.inner.set_active_version(version)
        }
    }

    #[tokio::test]
    async fn test_cancel_waits_for_in_flight_write() {
        let job = job("v1", vec![ManifestEntry::new("/a.js", None)]);
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
            gate: job.gate.clone(),
            cancel_returned_mid_write: AtomicBool::new(false),
            canceller: Mutex::new(None),
        });
        let fetcher = Arc::new(ScriptedFetcher::default().route("https://app.example/a.js", 200, "a"));

        let _ = Installer::new(store.clone(), fetcher)
            .with_retry(fast_retry())
            .install(&job)
            .await;
        let canceller = store.canceller.lock().unwrap().take().unwrap();
        canceller.join().unwrap();

        assert!(!store.cancel_returned_mid_write.load(Ordering::SeqCst));
        assert_eq!(store.inner.len(), 1);
        assert!(job.is_cancelled());

        let late = job.put(
            store.as_ref(),
            &key("https://app.example/b.js"),
            CachedResponse::new(job.version.clone(), "b"),
        );
        assert!(matches!(late, Err(ServiceWorkerError::Superseded(_))));
        assert_eq!(store.inner.len(), 1);
    }

    #[test]
    fn test_activate_is_idempotent() {
        let store = MemoryStore::new();
        let v1 = CacheVersion::new("v1").unwrap();
        let v2 = CacheVersion::new("v2").unwrap();
        store.put(&key("https://app.example/old.js"), CachedResponse::new(v1.clone(), "o")).unwrap();
        store.put(&key("https://app.example/new.js"), CachedResponse::new(v2.clone(), "n")).unwrap();

        let first = activate(&store, &v2, Some(v1));
        assert_eq!(first.removed, 1);
        let after_first = store.keys().unwrap();

        let second = activate(&store, &v2, None);
        assert_eq!(second.removed, 0);
        assert_eq!(store.keys().unwrap(), after_first);
        assert_eq!(store.active_version().unwrap(), Some(v2));
    }
}
