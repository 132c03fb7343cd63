//! URL patterns and the denylist built from them.

use offkit_core::{ConfigError, PatternSpec};
use regex::Regex;
use tracing::trace;
use url::Url;

/// Type of URL pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    /// Path equals.
    Exact,
    /// Path prefix.
    Prefix,
    /// Path suffix (e.g., an extension).
    Suffix,
    /// Path or query contains substring.
    Contains,
    /// Regular expression over path and query.
    Regex,
}

/// URL pattern for matching.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    /// Pattern type.
    pub pattern_type: PatternType,
    /// Pattern string.
    pub pattern: String,
    regex: Option<Regex>,
}

impl UrlPattern {
    /// Create an exact path pattern.
    pub fn exact(path: &str) -> Self {
        Self::plain(PatternType::Exact, path)
    }

    /// Create a path prefix pattern.
    pub fn prefix(prefix: &str) -> Self {
        Self::plain(PatternType::Prefix, prefix)
    }

    /// Create a path suffix pattern.
    pub fn suffix(suffix: &str) -> Self {
        Self::plain(PatternType::Suffix, suffix)
    }

    /// Create a contains pattern.
    pub fn contains(substring: &str) -> Self {
        Self::plain(PatternType::Contains, substring)
    }

    /// Create a regex pattern.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern_type: PatternType::Regex,
            pattern: pattern.to_string(),
            regex: Some(Regex::new(pattern)?),
        })
    }

    fn plain(pattern_type: PatternType, pattern: &str) -> Self {
        Self {
            pattern_type,
            pattern: pattern.to_string(),
            regex: None,
        }
    }

    /// Build from its config form.
    pub fn compile(spec: &PatternSpec) -> Result<Self, ConfigError> {
        Ok(match spec {
            PatternSpec::Exact(p) => Self::exact(p),
            PatternSpec::Prefix(p) => Self::prefix(p),
            PatternSpec::Suffix(p) => Self::suffix(p),
            PatternSpec::Contains(p) => Self::contains(p),
            PatternSpec::Regex(p) => Self::regex(p).map_err(|e| ConfigError::InvalidPattern {
                pattern: p.clone(),
                reason: e.to_string(),
            })?,
        })
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        let path = url.path();
        match self.pattern_type {
            PatternType::Exact => path == self.pattern,
            PatternType::Prefix => path.starts_with(&self.pattern),
            PatternType::Suffix => path.ends_with(&self.pattern),
            PatternType::Contains => path_and_query(url).contains(&self.pattern),
            PatternType::Regex => self
                .regex
                .as_ref()
                .is_some_and(|re| re.is_match(&path_and_query(url))),
        }
    }
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}

/// Set of patterns whose matches always bypass the precache.
#[derive(Debug, Clone, Default)]
pub struct Denylist {
    patterns: Vec<UrlPattern>,
}

impl Denylist {
    pub fn new(patterns: Vec<UrlPattern>) -> Self {
        Self { patterns }
    }

    /// Compile every configured pattern.
    pub fn compile(specs: &[PatternSpec]) -> Result<Self, ConfigError> {
        specs
            .iter()
            .map(UrlPattern::compile)
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }

    /// Add a pattern.
    pub fn push(&mut self, pattern: UrlPattern) {
        self.patterns.push(pattern);
    }

    /// First pattern matching `url`.
    pub fn find(&self, url: &Url) -> Option<&UrlPattern> {
        let hit = self.patterns.iter().find(|p| p.matches(url));
        if let Some(pattern) = hit {
            trace!(url = %url, pattern = %pattern.pattern, "Denylist match");
        }
        hit
    }

    pub fn matches(&self, url: &Url) -> bool {
        self.find(url).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_url_pattern_exact() {
        let pattern = UrlPattern::exact("/health");
        assert!(pattern.matches(&url("https://app.example/health")));
        assert!(!pattern.matches(&url("https://app.example/health/db")));
    }

    #[test]
    fn test_url_pattern_prefix() {
        let pattern = UrlPattern::prefix("/api/");
        assert!(pattern.matches(&url("https://app.example/api/users/7")));
        assert!(!pattern.matches(&url("https://app.example/apiary")));
    }

    #[test]
    fn test_url_pattern_suffix_ignores_query() {
        let pattern = UrlPattern::suffix(".json");
        assert!(pattern.matches(&url("https://app.example/data/stats.json?x=1")));
        assert!(!pattern.matches(&url("https://app.example/stats.js")));
    }

    #[test]
    fn test_url_pattern_contains_sees_query() {
        let pattern = UrlPattern::contains("export=");
        assert!(pattern.matches(&url("https://app.example/report?export=csv")));
    }

    #[test]
    fn test_url_pattern_regex() {
        let pattern = UrlPattern::regex(r"^/users/\d+/avatar$").unwrap();
        assert!(pattern.matches(&url("https://app.example/users/42/avatar")));
        assert!(!pattern.matches(&url("https://app.example/users/me/avatar")));
    }

    #[test]
    fn test_denylist_compile() {
        let denylist = Denylist::compile(&[
            PatternSpec::Prefix("/api/".to_string()),
            PatternSpec::Suffix(".txt".to_string()),
        ])
        .unwrap();

        assert_eq!(denylist.len(), 2);
        assert!(denylist.matches(&url("https://app.example/robots.txt")));
        assert_eq!(
            denylist.find(&url("https://app.example/api/v1/me")).map(|p| p.pattern.as_str()),
            Some("/api/")
        );
        assert!(!denylist.matches(&url("https://app.example/dashboard")));
    }

    #[test]
    fn test_denylist_bad_regex() {
        let err = Denylist::compile(&[PatternSpec::Regex("[".to_string())]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }
}
