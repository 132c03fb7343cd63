//! Navigation fallback planning.
//!
//! Every in-scope navigation that the denylist does not claim is answered
//! with the app shell, so client-side routing works for deep links offline.

use offkit_core::{CacheKey, NavigationMode};
use tracing::debug;
use url::Url;

use crate::router::RequestRouter;

/// How a navigation request is answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationPlan {
    /// Hand the request to the network unmodified, with no fallback.
    PassThrough,
    /// Serve the precached app shell under this key.
    AppShell(CacheKey),
    /// Try the network; serve the app shell if it fails.
    NetworkFirst { fallback: CacheKey },
}

impl RequestRouter {
    /// Plan the response to a top-level navigation.
    pub fn plan_navigation(&self, url: &Url) -> NavigationPlan {
        let options = &self.options;

        if !url.as_str().starts_with(options.scope.as_str()) {
            debug!(url = %url, scope = %options.scope, "Navigation outside scope");
            return NavigationPlan::PassThrough;
        }

        if let Some(pattern) = options.denylist.find(url) {
            debug!(url = %url, pattern = %pattern.pattern, "Navigation denylisted");
            return NavigationPlan::PassThrough;
        }

        if !options.navigation_allowlist.is_empty() && !options.navigation_allowlist.matches(url) {
            debug!(url = %url, "Navigation not on allowlist");
            return NavigationPlan::PassThrough;
        }

        let shell = self.app_shell_key();
        match options.navigation_mode {
            NavigationMode::Precache => NavigationPlan::AppShell(shell),
            NavigationMode::NetworkFirst => NavigationPlan::NetworkFirst { fallback: shell },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouterOptions;
    use offkit_core::{AgentConfig, CacheVersion, Manifest, ManifestEntry, PatternSpec};

    fn router(config: AgentConfig) -> RequestRouter {
        let manifest = Manifest::new(
            CacheVersion::new("v1").unwrap(),
            vec![ManifestEntry::new("index.html", Some("s1"))],
        )
        .unwrap();
        let assets = manifest.resolve(&config.scope_url().unwrap()).unwrap();
        RequestRouter::new(RouterOptions::from_config(&config).unwrap(), &assets)
    }

    fn config() -> AgentConfig {
        AgentConfig {
            scope: "https://app.example/".to_string(),
            ..Default::default()
        }
    }

    fn shell() -> CacheKey {
        CacheKey::from_stored("https://app.example/index.html?__rev=s1")
    }

    #[test]
    fn test_deep_paths_get_app_shell() {
        let router = router(config());
        for path in ["/", "/dashboard", "/wizard/step-2", "/roadmap/abc123"] {
            let url = Url::parse("https://app.example/").unwrap().join(path).unwrap();
            assert_eq!(router.plan_navigation(&url), NavigationPlan::AppShell(shell()), "{path}");
        }
    }

    #[test]
    fn test_denylisted_navigation_passes_through() {
        let router = router(config());
        let url = Url::parse("https://app.example/api/auth/callback").unwrap();
        assert_eq!(router.plan_navigation(&url), NavigationPlan::PassThrough);
    }

    #[test]
    fn test_out_of_scope_passes_through() {
        let router = router(config());
        let url = Url::parse("https://elsewhere.example/dashboard").unwrap();
        assert_eq!(router.plan_navigation(&url), NavigationPlan::PassThrough);
    }

    #[test]
    fn test_network_first_mode() {
        let router = router(AgentConfig {
            navigation_mode: NavigationMode::NetworkFirst,
            ..config()
        });
        let url = Url::parse("https://app.example/settings").unwrap();
        assert_eq!(
            router.plan_navigation(&url),
            NavigationPlan::NetworkFirst { fallback: shell() }
        );
    }

    #[test]
    fn test_allowlist_restricts_shell() {
        let router = router(AgentConfig {
            navigation_allowlist: vec![PatternSpec::Prefix("/app/".to_string())],
            ..config()
        });
        let inside = Url::parse("https://app.example/app/home").unwrap();
        let outside = Url::parse("https://app.example/blog/post").unwrap();
        assert_eq!(router.plan_navigation(&inside), NavigationPlan::AppShell(shell()));
        assert_eq!(router.plan_navigation(&outside), NavigationPlan::PassThrough);
    }
}
