//! Pre-emptive rewrites for hosts known to block on the first request.

use std::sync::Arc;

use http::HeaderMap;
use url::Url;

use super::strategies::{lite_search_url, old_reddit_url, query_param};
use crate::modules::fingerprint::{self, ProfileError};
use crate::modules::timing::host_in_domain;

/// Replacement target and headers for the first attempt of a chain.
#[derive(Debug, Clone)]
pub struct Preflight {
    pub label: &'static str,
    pub url: Url,
    /// Merged under the caller's overrides; the caller always wins.
    pub headers: Option<HeaderMap>,
}

pub trait PreflightRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies(&self, host: &str) -> bool;

    fn rewrite(&self, url: &Url) -> Result<Option<Preflight>, ProfileError>;
}

#[derive(Debug, Default)]
pub struct GoogleSearchRule;

impl PreflightRule for GoogleSearchRule {
    fn name(&self) -> &'static str {
        "google-search"
    }

    fn applies(&self, host: &str) -> bool {
        host_in_domain(host, "google.com")
    }

    fn rewrite(&self, url: &Url) -> Result<Option<Preflight>, ProfileError> {
        if !url.path().starts_with("/search") {
            return Ok(None);
        }
        Ok(query_param(url)
            .and_then(|query| lite_search_url(&query))
            .map(|target| Preflight {
                label: self.name(),
                url: target,
                headers: None,
            }))
    }
}

#[derive(Debug, Default)]
pub struct StackOverflowRule;

impl PreflightRule for StackOverflowRule {
    fn name(&self) -> &'static str {
        "stackoverflow-headers"
    }

    fn applies(&self, host: &str) -> bool {
        host_in_domain(host, "stackoverflow.com")
    }

    fn rewrite(&self, url: &Url) -> Result<Option<Preflight>, ProfileError> {
        Ok(Some(Preflight {
            label: self.name(),
            url: url.clone(),
            headers: Some(fingerprint::identity_headers("chrome-desktop")?),
        }))
    }
}

#[derive(Debug, Default)]
pub struct RedditRule;

impl PreflightRule for RedditRule {
    fn name(&self) -> &'static str {
        "reddit-old"
    }

    fn applies(&self, host: &str) -> bool {
        host_in_domain(host, "reddit.com")
    }

    fn rewrite(&self, url: &Url) -> Result<Option<Preflight>, ProfileError> {
        Ok(old_reddit_url(url).map(|target| Preflight {
            label: self.name(),
            url: target,
            headers: None,
        }))
    }
}

/// Host predicate → rewrite registry. The first rule producing a rewrite wins.
#[derive(Clone)]
pub struct PreflightRegistry {
    rules: Vec<Arc<dyn PreflightRule>>,
}

impl std::fmt::Debug for PreflightRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.rules.iter().map(|rule| rule.name()).collect();
        f.debug_struct("PreflightRegistry")
            .field("rules", &names)
            .finish()
    }
}

impl Default for PreflightRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PreflightRegistry {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_defaults() -> Self {
        Self {
            rules: vec![
                Arc::new(GoogleSearchRule),
                Arc::new(StackOverflowRule),
                Arc::new(RedditRule),
            ],
        }
    }

    /// Register a rule ahead of the existing ones.
    pub fn register(&mut self, rule: Arc<dyn PreflightRule>) {
        self.rules.insert(0, rule);
    }

    pub fn apply(&self, url: &Url) -> Option<Preflight> {
        let host = url.host_str()?.to_ascii_lowercase();
        for rule in self.rules.iter().filter(|rule| rule.applies(&host)) {
            match rule.rewrite(url) {
                Ok(Some(preflight)) => return Some(preflight),
                Ok(None) => {}
                Err(err) => log::warn!("preflight rule {} failed: {err}", rule.name()),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(url: &str) -> Option<Preflight> {
        PreflightRegistry::with_defaults().apply(&Url::parse(url).unwrap())
    }

    #[test]
    fn google_search_goes_to_lite_endpoint() {
        let preflight = apply("https://www.google.com/search?q=tokio+select").unwrap();
        assert_eq!(preflight.url.host_str(), Some("lite.duckduckgo.com"));
        assert_eq!(query_param(&preflight.url).as_deref(), Some("tokio select"));
        assert!(preflight.headers.is_none());
    }

    #[test]
    fn google_non_search_is_untouched() {
        assert!(apply("https://www.google.com/maps").is_none());
        assert!(apply("https://www.google.com/search").is_none());
    }

    #[test]
    fn stackoverflow_keeps_url_and_adds_headers() {
        let preflight = apply("https://stackoverflow.com/questions/42").unwrap();
        assert_eq!(preflight.url.as_str(), "https://stackoverflow.com/questions/42");
        let headers = preflight.headers.unwrap();
        assert!(headers["user-agent"].to_str().unwrap().contains("Chrome"));
    }

    #[test]
    fn reddit_moves_to_old_subdomain_once() {
        let preflight = apply("https://www.reddit.com/r/rust/comments").unwrap();
        assert_eq!(preflight.url.as_str(), "https://old.reddit.com/r/rust/comments");
        assert!(apply("https://old.reddit.com/r/rust").is_none());
    }

    #[test]
    fn unrelated_hosts_pass_through() {
        assert!(apply("https://example.com/search?q=x").is_none());
        assert!(apply("https://notreddit.com/").is_none());
    }
}
