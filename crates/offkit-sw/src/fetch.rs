//! Fetch interception.
//!
//! Carries out what the router decides: replay precached entries, go to
//! the network, and answer navigations with the app shell.

use bytes::Bytes;
use hashbrown::HashMap;
use http::Method;
use offkit_core::CacheKey;
use offkit_net::{Fetcher, NetError, Request, Response};
use offkit_router::{NavigationPlan, RequestRouter, RouteDecision};
use offkit_store::{CachedResponse, PrecacheStore};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace, warn};

// ==================== Fetch Event ====================

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub request: Request,

    /// Client that issued the request.
    pub client_id: Option<String>,

    /// For navigations, the client the response will create or replace.
    pub resulting_client_id: Option<String>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
            resulting_client_id: None,
        }
    }

    pub fn with_client(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn with_resulting_client(mut self, id: impl Into<String>) -> Self {
        self.resulting_client_id = Some(id.into());
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.request.is_navigation()
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Precache,
    Network,
}

/// Fetch event response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// Status code.
    pub status: u16,

    /// Response headers, lowercase names.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Bytes,

    pub source: ResponseSource,
}

impl FetchResponse {
    /// Create a response from a precache entry.
    pub fn from_cache(entry: CachedResponse) -> Self {
        Self {
            status: entry.status,
            headers: entry.headers,
            body: entry.body,
            source: ResponseSource::Precache,
        }
    }

    /// Create a response from a network response, whatever its status.
    pub fn from_network(response: Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Self {
            status: response.status.as_u16(),
            headers,
            body: response.body,
            source: ResponseSource::Network,
        }
    }

    pub fn is_from_cache(&self) -> bool {
        self.source == ResponseSource::Precache
    }
}

/// A request the agent could not answer.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] NetError),
}

// ==================== Handler ====================

/// Answers intercepted requests for one version.
pub struct FetchHandler<'a> {
    router: &'a RequestRouter,
    store: &'a dyn PrecacheStore,
    fetcher: &'a dyn Fetcher,
}

impl<'a> FetchHandler<'a> {
    pub fn new(router: &'a RequestRouter, store: &'a dyn PrecacheStore, fetcher: &'a dyn Fetcher) -> Self {
        Self {
            router,
            store,
            fetcher,
        }
    }

    /// Answer an intercepted request.
    ///
    /// Precached entries are served without touching the network. A
    /// navigation the precache cannot answer goes to [`Self::handle_navigation`].
    /// Network failures of other requests are returned as errors.
    pub async fn respond(&self, request: Request) -> Result<FetchResponse, FetchError> {
        match self.router.classify(&request.url, &request.method, self.store) {
            RouteDecision::ServeFromPrecache(key) => match self.lookup(&key) {
                Some(response) => Ok(response),
                None => self.network(request).await,
            },
            RouteDecision::BypassToNetwork => self.network(request).await,
            RouteDecision::NetworkWithFallback if request.is_navigation() => {
                self.handle_navigation(request).await
            }
            RouteDecision::NetworkWithFallback => self.network(request).await,
        }
    }

    /// Answer a top-level navigation.
    pub async fn handle_navigation(&self, request: Request) -> Result<FetchResponse, FetchError> {
        if request.method != Method::GET {
            return self.network(request).await;
        }

        match self.router.plan_navigation(&request.url) {
            NavigationPlan::PassThrough => self.network(request).await,
            NavigationPlan::AppShell(shell) => match self.lookup(&shell) {
                Some(response) => {
                    debug!(url = %request.url, shell = %shell, "Serving app shell");
                    Ok(response)
                }
                None => {
                    warn!(url = %request.url, shell = %shell, "App shell not precached, using network");
                    self.network(request).await
                }
            },
            NavigationPlan::NetworkFirst { fallback } => {
                let url = request.url.clone();
                match self.network(request).await {
                    Ok(response) => Ok(response),
                    Err(e) => match self.lookup(&fallback) {
                        Some(shell) => {
                            debug!(url = %url, error = %e, "Network failed, serving app shell");
                            Ok(shell)
                        }
                        None => Err(e),
                    },
                }
            }
        }
    }

    fn lookup(&self, key: &CacheKey) -> Option<FetchResponse> {
        match self.store.get(key) {
            Ok(Some(entry)) => Some(FetchResponse::from_cache(entry)),
            Ok(None) => {
                debug!(key = %key, "Precache entry missing");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Precache read failed");
                None
            }
        }
    }

    async fn network(&self, request: Request) -> Result<FetchResponse, FetchError> {
        trace!(url = %request.url, method = %request.method, "Forwarding to network");
        let response = self.fetcher.fetch(request).await?;
        Ok(FetchResponse::from_network(response))
    }
}
