//! Agent configuration

use offkit_common::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::ConfigError;

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Origin scope the agent controls; absolute, ends in '/'
    pub scope: String,

    /// Prefix for store names, keeps several agents apart on one origin
    pub cache_id: String,

    /// App shell document served for navigations, scope-relative
    pub app_shell: String,

    /// How navigations are answered
    pub navigation_mode: NavigationMode,

    /// Activate as soon as install finishes, even with clients on the old version
    pub skip_waiting: bool,

    /// Take control of already-open clients on activation
    pub claim_clients: bool,

    /// Requests matching any of these always go to the network
    pub denylist: Vec<PatternSpec>,

    /// When non-empty, only navigations matching one of these get the app shell
    pub navigation_allowlist: Vec<PatternSpec>,

    /// Query parameters (regex on the name) dropped before precache lookup
    pub ignore_url_parameters: Vec<String>,

    /// Appended to directory URLs before precache lookup
    pub directory_index: Option<String>,

    /// Try `<path>.html` when `<path>` misses
    pub clean_urls: bool,

    /// Fallback notification fields
    pub notification: NotificationDefaults,

    /// SQLite file backing the precache store
    pub store_path: PathBuf,

    /// Retry policy for precache downloads
    pub precache_retry: RetryConfig,

    /// Precache downloads in flight at once
    pub precache_concurrency: usize,
}

/// Navigation handling mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationMode {
    /// Always answer with the precached app shell.
    #[default]
    Precache,
    /// Try the network, fall back to the app shell.
    NetworkFirst,
}

/// Serializable URL pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "pattern", rename_all = "snake_case")]
pub enum PatternSpec {
    /// Whole path equals.
    Exact(String),
    /// Path starts with.
    Prefix(String),
    /// Path ends with.
    Suffix(String),
    /// Path or query contains.
    Contains(String),
    /// Regular expression over path and query.
    Regex(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            scope: "http://localhost/".to_string(),
            cache_id: "offkit".to_string(),
            app_shell: "index.html".to_string(),
            navigation_mode: NavigationMode::Precache,
            skip_waiting: false,
            claim_clients: false,
            denylist: vec![
                PatternSpec::Prefix("/api/".to_string()),
                PatternSpec::Suffix(".json".to_string()),
                PatternSpec::Suffix(".txt".to_string()),
            ],
            navigation_allowlist: Vec::new(),
            ignore_url_parameters: vec!["^utm_".to_string(), "^fbclid$".to_string()],
            directory_index: Some("index.html".to_string()),
            clean_urls: true,
            notification: NotificationDefaults::default(),
            store_path: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("offkit")
                .join("precache.sqlite3"),
            precache_retry: RetryConfig::default(),
            precache_concurrency: 6,
        }
    }
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            title: "Offkit".to_string(),
            body: "You have a new reminder.".to_string(),
            icon: "/icons/icon-192x192.png".to_string(),
            badge: None,
        }
    }
}

impl PatternSpec {
    /// The raw pattern text.
    pub fn pattern(&self) -> &str {
        match self {
            PatternSpec::Exact(p)
            | PatternSpec::Prefix(p)
            | PatternSpec::Suffix(p)
            | PatternSpec::Contains(p)
            | PatternSpec::Regex(p) => p,
        }
    }
}

impl AgentConfig {
    /// Load a JSON config file; missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!(path = %path.as_ref().display(), scope = %config.scope, "Loaded agent config");
        Ok(config)
    }

    /// Parsed scope URL.
    pub fn scope_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.scope).map_err(|_| ConfigError::InvalidScope(self.scope.clone()))?;
        if url.cannot_be_a_base() || !url.path().ends_with('/') {
            return Err(ConfigError::InvalidScope(self.scope.clone()));
        }
        Ok(url)
    }

    /// Absolute app shell URL.
    pub fn app_shell_url(&self) -> Result<Url, ConfigError> {
        self.scope_url()?
            .join(&self.app_shell)
            .map_err(|_| ConfigError::InvalidAppShell(self.app_shell.clone()))
    }

    /// Check everything that would otherwise fail later at routing time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.app_shell_url()?;

        let regexes = self
            .denylist
            .iter()
            .chain(&self.navigation_allowlist)
            .filter_map(|p| match p {
                PatternSpec::Regex(r) => Some(r.as_str()),
                _ => None,
            })
            .chain(self.ignore_url_parameters.iter().map(String::as_str));

        for pattern in regexes {
            regex::Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.skip_waiting);
        assert!(!config.claim_clients);
        assert_eq!(
            config.app_shell_url().unwrap().as_str(),
            "http://localhost/index.html"
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AgentConfig = serde_json::from_str(
            r#"{
                "scope": "https://app.example/",
                "skip_waiting": true,
                "denylist": [{"kind": "prefix", "pattern": "/rpc/"}]
            }"#,
        )
        .unwrap();

        assert!(config.skip_waiting);
        assert_eq!(config.denylist, vec![PatternSpec::Prefix("/rpc/".to_string())]);
        assert_eq!(config.navigation_mode, NavigationMode::Precache);
        assert_eq!(config.notification.title, "Offkit");
    }

    #[test]
    fn test_scope_must_be_directory() {
        let config = AgentConfig {
            scope: "https://app.example/app".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidScope(_))));
    }

    #[test]
    fn test_bad_regex_rejected() {
        let config = AgentConfig {
            denylist: vec![PatternSpec::Regex("(unclosed".to_string())],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(&path, r#"{"scope": "https://app.example/", "claim_clients": true}"#)
            .unwrap();

        let config = AgentConfig::from_file(&path).unwrap();
        assert!(config.claim_clients);
        assert_eq!(config.scope_url().unwrap().as_str(), "https://app.example/");
    }
}
