//! Request classification.

use hashbrown::HashMap;
use http::Method;
use offkit_core::{AgentConfig, CacheKey, ConfigError, NavigationMode, PrecacheAsset};
use offkit_store::PrecacheStore;
use regex::Regex;
use tracing::{debug, trace, warn};
use url::Url;

use crate::pattern::Denylist;

/// Where an intercepted request is answered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Replay the stored entry under this key.
    ServeFromPrecache(CacheKey),
    /// Go to the network; navigations fall back to the app shell.
    NetworkWithFallback,
    /// Go to the network untouched.
    BypassToNetwork,
}

/// Compiled routing configuration.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub scope: Url,
    pub app_shell: Url,
    pub navigation_mode: NavigationMode,
    pub denylist: Denylist,
    pub navigation_allowlist: Denylist,
    pub ignore_url_parameters: Vec<Regex>,
    pub directory_index: Option<String>,
    pub clean_urls: bool,
}

impl RouterOptions {
    /// Compile the routing part of an agent config.
    pub fn from_config(config: &AgentConfig) -> Result<Self, ConfigError> {
        let ignore_url_parameters = config
            .ignore_url_parameters
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| ConfigError::InvalidPattern {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            scope: config.scope_url()?,
            app_shell: config.app_shell_url()?,
            navigation_mode: config.navigation_mode,
            denylist: Denylist::compile(&config.denylist)?,
            navigation_allowlist: Denylist::compile(&config.navigation_allowlist)?,
            ignore_url_parameters,
            directory_index: config.directory_index.clone(),
            clean_urls: config.clean_urls,
        })
    }
}

/// Classifies intercepted requests against one version's manifest.
///
/// Pure apart from reading the precache store; it never writes.
#[derive(Debug, Clone)]
pub struct RequestRouter {
    pub(crate) options: RouterOptions,
    index: HashMap<Url, CacheKey>,
}

impl RequestRouter {
    /// Index the resolved manifest of the version that will serve requests.
    pub fn new(options: RouterOptions, assets: &[PrecacheAsset]) -> Self {
        let index = assets
            .iter()
            .map(|asset| (asset.url.clone(), asset.key.clone()))
            .collect();
        Self { options, index }
    }

    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    /// Cache key the manifest assigns to `url`, if it lists it.
    pub fn key_for(&self, url: &Url) -> Option<&CacheKey> {
        self.index.get(url)
    }

    /// Cache key for the app shell document.
    ///
    /// Falls back to the bare URL when the manifest does not list the shell.
    pub fn app_shell_key(&self) -> CacheKey {
        self.key_for(&self.options.app_shell)
            .cloned()
            .unwrap_or_else(|| CacheKey::bare(&self.options.app_shell))
    }

    /// Whether the denylist claims `url`.
    pub fn is_denied(&self, url: &Url) -> bool {
        self.options.denylist.matches(url)
    }

    /// Decide where a request is answered from.
    ///
    /// Bypass rules are checked before the store so a denylisted URL is
    /// never answered from the precache, whatever it holds.
    pub fn classify(&self, url: &Url, method: &Method, store: &dyn PrecacheStore) -> RouteDecision {
        if method != Method::GET {
            trace!(url = %url, method = %method, "Bypass: not a GET");
            return RouteDecision::BypassToNetwork;
        }

        if let Some(pattern) = self.options.denylist.find(url) {
            debug!(url = %url, pattern = %pattern.pattern, "Bypass: denylisted");
            return RouteDecision::BypassToNetwork;
        }

        for candidate in self.candidates(url) {
            let Some(key) = self.index.get(&candidate) else {
                continue;
            };
            match store.contains(key) {
                Ok(true) => {
                    trace!(url = %url, key = %key, "Precache hit");
                    return RouteDecision::ServeFromPrecache(key.clone());
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(url = %url, key = %key, error = %e, "Precache lookup failed, using network");
                }
            }
        }

        RouteDecision::NetworkWithFallback
    }

    /// URL spellings that may name a precached asset, most specific first.
    pub fn candidates(&self, url: &Url) -> Vec<Url> {
        let mut exact = url.clone();
        exact.set_fragment(None);

        let stripped = self.strip_ignored_params(&exact);
        let mut out = vec![exact];
        push_unique(&mut out, stripped.clone());

        if stripped.path().ends_with('/') {
            if let Some(index) = &self.options.directory_index {
                let mut with_index = stripped.clone();
                with_index.set_path(&format!("{}{}", stripped.path(), index));
                push_unique(&mut out, with_index);
            }
        } else if self.options.clean_urls {
            let mut with_html = stripped.clone();
            with_html.set_path(&format!("{}.html", stripped.path()));
            push_unique(&mut out, with_html);
        }

        out
    }

    fn strip_ignored_params(&self, url: &Url) -> Url {
        if url.query().is_none() || self.options.ignore_url_parameters.is_empty() {
            return url.clone();
        }

        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(name, _)| !self.options.ignore_url_parameters.iter().any(|re| re.is_match(name)))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut stripped = url.clone();
        if kept.is_empty() {
            stripped.set_query(None);
        } else {
            stripped.query_pairs_mut().clear().extend_pairs(kept);
        }
        stripped
    }
}

fn push_unique(urls: &mut Vec<Url>, url: Url) {
    if !urls.contains(&url) {
        urls.push(url);
    }
}
