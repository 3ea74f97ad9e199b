//! Proxy selection.
//!
//! A request either names its proxy explicitly or, when a process-wide list
//! is configured, goes through a randomly picked entry part of the time.

use rand::Rng;
use rand::seq::SliceRandom;
use thiserror::Error;

/// Environment variable holding a comma separated proxy list.
pub const PROXY_LIST_ENV: &str = "PROXY_LIST";

/// Default share of requests routed through the configured list.
pub const DEFAULT_PROXY_PROBABILITY: f64 = 0.3;

const SUPPORTED_SCHEMES: &[&str] = &["http", "https", "socks4", "socks4a", "socks5", "socks5h"];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unsupported proxy scheme in {0}")]
    UnsupportedScheme(String),
    #[error("invalid proxy {endpoint}: {source}")]
    Invalid {
        endpoint: String,
        source: reqwest::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub endpoints: Vec<String>,
    pub probability: f64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            probability: DEFAULT_PROXY_PROBABILITY,
        }
    }
}

impl ProxyConfig {
    /// Read [`PROXY_LIST_ENV`]. Blank entries are ignored.
    pub fn from_env() -> Self {
        let endpoints = std::env::var(PROXY_LIST_ENV)
            .map(|raw| parse_proxy_list(&raw))
            .unwrap_or_default();
        Self {
            endpoints,
            ..Self::default()
        }
    }
}

pub fn parse_proxy_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Scheme of a proxy URL, lower-cased, if supported.
pub fn proxy_scheme(endpoint: &str) -> Option<String> {
    let (scheme, _) = endpoint.split_once("://")?;
    let scheme = scheme.to_ascii_lowercase();
    SUPPORTED_SCHEMES
        .contains(&scheme.as_str())
        .then_some(scheme)
}

/// Build a reqwest proxy covering every request scheme.
pub fn build_proxy(endpoint: &str) -> Result<reqwest::Proxy, ProxyError> {
    if proxy_scheme(endpoint).is_none() {
        return Err(ProxyError::UnsupportedScheme(endpoint.to_string()));
    }
    reqwest::Proxy::all(endpoint).map_err(|source| ProxyError::Invalid {
        endpoint: endpoint.to_string(),
        source,
    })
}

/// Picks a transport route per attempt.
#[derive(Debug, Clone, Default)]
pub struct ProxyManager {
    config: ProxyConfig,
}

impl ProxyManager {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }

    pub fn has_proxies(&self) -> bool {
        !self.config.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[String] {
        &self.config.endpoints
    }

    /// Any configured proxy, uniformly.
    pub fn random(&self) -> Option<String> {
        self.config
            .endpoints
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    /// Route for one attempt: the explicit proxy if given, else a random
    /// list entry with the configured probability, else direct (`None`).
    pub fn select(&self, explicit: Option<&str>) -> Option<String> {
        if let Some(explicit) = explicit {
            return Some(explicit.to_string());
        }
        if !self.has_proxies() {
            return None;
        }
        let probability = self.config.probability.clamp(0.0, 1.0);
        if rand::thread_rng().gen_bool(probability) {
            self.random()
        } else {
            None
        }
    }
}
