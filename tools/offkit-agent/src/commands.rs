//! Subcommand implementations.
//!
//! Every command reports failures as [`OffkitError`] so the binary can log
//! the error category before exiting.

use http::Method;
use offkit_common::{OffkitError, Result};
use offkit_core::{AgentConfig, CacheKey, CacheVersion, Manifest};
use offkit_net::{HttpFetcher, LoaderConfig};
use offkit_router::{NavigationPlan, RequestRouter, RouteDecision, RouterOptions};
use offkit_store::{PrecacheStore, SqliteStore};
use offkit_sw::{Agent, InstallOutcome, LogNotifier, Notification, PushDispatcher};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use url::Url;

/// Load the config file, or defaults when none is given.
pub fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    match path {
        Some(path) => AgentConfig::from_file(path).map_err(|e| {
            OffkitError::config_with_source(format!("loading config {}", path.display()), e)
        }),
        None => Ok(AgentConfig::default()),
    }
}

/// Load a manifest file for `version`.
pub fn load_manifest(path: &Path, version: &str) -> Result<Manifest> {
    let version = CacheVersion::new(version)?;
    let json = std::fs::read_to_string(path)
        .map_err(|e| OffkitError::manifest(format!("reading manifest {}: {e}", path.display())))?;
    let manifest = Manifest::from_json(version, &json)?;
    info!(version = %manifest.version(), entries = manifest.len(), "Loaded manifest");
    Ok(manifest)
}

pub fn open_store(config: &AgentConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.store_path, config.cache_id.as_str()).map_err(|e| {
        OffkitError::storage_with_source(format!("opening store {}", config.store_path.display()), e)
    })
}

// ==================== install ====================

/// Install `manifest` against the network.
///
/// The store's previously activated version is restored first; the new
/// build activates once no client is held by the old one.
pub async fn install(config: AgentConfig, manifest: Manifest) -> Result<InstallOutcome> {
    let store = Arc::new(open_store(&config)?);
    let fetcher = Arc::new(HttpFetcher::new(LoaderConfig::default())?);
    let (agent, _events) =
        Agent::new(config, manifest.clone(), store, fetcher, Arc::new(LogNotifier))?;
    Ok(agent.install(manifest).await?)
}

// ==================== keys ====================

#[derive(Debug, Serialize)]
pub struct KeysReport {
    pub active_version: Option<CacheVersion>,
    pub keys: Vec<KeyRow>,
}

#[derive(Debug, Serialize)]
pub struct KeyRow {
    pub key: CacheKey,
    pub version: CacheVersion,
}

pub fn keys(store: &dyn PrecacheStore) -> Result<KeysReport> {
    let keys = store
        .keys()?
        .into_iter()
        .map(|stored| KeyRow {
            key: stored.key,
            version: stored.version,
        })
        .collect();
    Ok(KeysReport {
        active_version: store.active_version()?,
        keys,
    })
}

// ==================== classify ====================

#[derive(Debug, Serialize)]
pub struct Classification {
    pub url: String,
    pub decision: &'static str,
    pub key: Option<CacheKey>,
}

/// Report how the agent would answer `url`.
pub fn classify(
    config: &AgentConfig,
    manifest: &Manifest,
    store: &dyn PrecacheStore,
    url: &str,
    method: &str,
    navigate: bool,
) -> Result<Classification> {
    let url = Url::parse(url).map_err(|e| OffkitError::InvalidArgument(format!("url {url}: {e}")))?;
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| OffkitError::InvalidArgument(format!("method {method}")))?;

    let assets = manifest.resolve(&config.scope_url()?)?;
    let router = RequestRouter::new(RouterOptions::from_config(config)?, &assets);

    let (decision, key) = match router.classify(&url, &method, store) {
        RouteDecision::ServeFromPrecache(key) => ("serve_from_precache", Some(key)),
        RouteDecision::BypassToNetwork => ("bypass_to_network", None),
        RouteDecision::NetworkWithFallback if navigate && method == Method::GET => {
            match router.plan_navigation(&url) {
                NavigationPlan::PassThrough => ("pass_through", None),
                NavigationPlan::AppShell(key) => ("app_shell", Some(key)),
                NavigationPlan::NetworkFirst { fallback } => ("network_first", Some(fallback)),
            }
        }
        RouteDecision::NetworkWithFallback => ("network_with_fallback", None),
    };

    Ok(Classification {
        url: url.to_string(),
        decision,
        key,
    })
}

// ==================== push ====================

/// Render the notification a push with `payload` would show.
pub async fn push(config: &AgentConfig, payload: Option<Vec<u8>>) -> Result<Notification> {
    let dispatcher = PushDispatcher::from_config(config, Arc::new(LogNotifier))?;
    Ok(dispatcher.on_push(payload.as_deref()).await)
}
