//! Human-like request pacing.
//!
//! Tracks when each host was last contacted and computes how long the next
//! request has to wait so consecutive hits look like a person clicking around.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;

/// Hosts that get paced on every request.
pub const DEFAULT_STRICT_DOMAINS: &[&str] = &[
    "google.com",
    "stackoverflow.com",
    "reddit.com",
    "cloudflare.com",
    "facebook.com",
    "instagram.com",
    "linkedin.com",
    "amazon.com",
    "twitter.com",
    "x.com",
    "recaptcha.net",
    "captcha.com",
];

/// Probability that a request to a non-strict host is paced.
const RELAXED_PACING_PROBABILITY: f64 = 0.7;

/// What the simulated user did before this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ActionType {
    #[default]
    Navigation,
    Click,
    Scroll,
    Form,
    Search,
    Other,
}

impl ActionType {
    /// Minimum spacing drawn for this action.
    pub fn delay_range(self) -> DelayRange {
        match self {
            ActionType::Navigation => DelayRange::millis(2_000, 5_000),
            ActionType::Click => DelayRange::millis(500, 1_500),
            ActionType::Scroll => DelayRange::millis(1_000, 3_000),
            ActionType::Form => DelayRange::millis(1_500, 4_000),
            ActionType::Search | ActionType::Other => DelayRange::millis(1_000, 3_000),
        }
    }
}

/// Inclusive-exclusive delay window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub const fn millis(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_millis(min),
            max: Duration::from_millis(max),
        }
    }

    /// Draw a delay from the window, multiplied by `scale`.
    pub fn sample(&self, scale: f64) -> Duration {
        if scale <= 0.0 {
            return Duration::ZERO;
        }
        let base = if self.max > self.min {
            rand::thread_rng().gen_range(self.min..self.max)
        } else {
            self.min
        };
        base.mul_f64(scale)
    }
}

/// Whether `host` is `domain` or one of its subdomains.
pub fn host_in_domain(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Per-host pacing ledger.
#[derive(Debug)]
pub struct HumanTiming {
    enabled: bool,
    strict_domains: Vec<String>,
    last_request: Mutex<HashMap<String, Instant>>,
}

impl Default for HumanTiming {
    fn default() -> Self {
        Self::new(
            true,
            DEFAULT_STRICT_DOMAINS.iter().map(|domain| domain.to_string()).collect(),
        )
    }
}

impl HumanTiming {
    pub fn new(enabled: bool, strict_domains: Vec<String>) -> Self {
        Self {
            enabled,
            strict_domains,
            last_request: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether `host` belongs to a domain with aggressive bot detection.
    pub fn is_strict(&self, host: &str) -> bool {
        self.strict_domains
            .iter()
            .any(|domain| host_in_domain(host, domain))
    }

    /// Reserve the next slot for `host` and return how long to wait before
    /// sending. The slot is recorded immediately so concurrent chains to the
    /// same host queue up behind each other.
    pub fn reserve(&self, host: &str, action: ActionType) -> Duration {
        let now = Instant::now();
        let mut ledger = self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut wait = Duration::ZERO;
        if self.enabled
            && let Some(last) = ledger.get(host)
        {
            let paced = self.is_strict(host)
                || rand::thread_rng().gen_bool(RELAXED_PACING_PROBABILITY);
            if paced {
                let minimum = action.delay_range().sample(1.0);
                let elapsed = now.saturating_duration_since(*last);
                // `last` may lie in the future when another chain reserved it.
                let outstanding = last.saturating_duration_since(now);
                wait = minimum.saturating_sub(elapsed) + outstanding;
            }
        }

        ledger.insert(host.to_string(), now + wait);
        wait
    }

    /// When `host` was last (or will next be) contacted.
    pub fn last_request(&self, host: &str) -> Option<Instant> {
        self.last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
            .copied()
    }
}

/// Backoff before retrying a failed transport attempt.
pub fn retry_backoff(attempt: u32, scale: f64) -> Duration {
    let exponent = attempt.min(5);
    let base = DelayRange::millis(250, 750).sample(scale);
    base * 2u32.pow(exponent)
}
