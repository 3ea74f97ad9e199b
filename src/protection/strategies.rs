//! Bypass strategies.
//!
//! A strategy never performs I/O. It turns a classified response into a
//! [`BypassPlan`]: an ordered queue of follow-up GET requests. The engine runs
//! the steps one by one and stops at the first response that is no longer
//! blocked.

use std::collections::VecDeque;
use std::sync::Arc;

use http::HeaderMap;
use rand::Rng;
use rand::seq::SliceRandom;
use url::Url;

use super::ProtectionKind;
use crate::modules::fingerprint::{self, BrowserFamily, ProfileError};
use crate::modules::timing::{ActionType, DelayRange, host_in_domain};

const LITE_SEARCH_ENDPOINT: &str = "https://lite.duckduckgo.com/lite/";
const CODE_SEARCH_ENDPOINT: &str = "https://github.com/search";

/// What a strategy knows about the blocked response.
#[derive(Debug, Clone, Copy)]
pub struct BypassContext<'a> {
    pub kind: ProtectionKind,
    pub url: &'a Url,
    pub status: u16,
}

impl BypassContext<'_> {
    fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }
}

/// One follow-up request.
#[derive(Debug, Clone)]
pub struct BypassStep {
    pub label: &'static str,
    pub url: Url,
    /// Sent as caller overrides on top of the host profile.
    pub headers: HeaderMap,
    pub delay: Option<DelayRange>,
    pub action: ActionType,
}

impl BypassStep {
    pub fn new(label: &'static str, url: Url) -> Self {
        Self {
            label,
            url,
            headers: HeaderMap::new(),
            delay: None,
            action: ActionType::Navigation,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn after(mut self, delay: DelayRange) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn as_action(mut self, action: ActionType) -> Self {
        self.action = action;
        self
    }
}

/// Ordered fallback requests produced by a strategy.
#[derive(Debug, Clone)]
pub struct BypassPlan {
    pub strategy: &'static str,
    steps: VecDeque<BypassStep>,
}

impl BypassPlan {
    pub fn new(strategy: &'static str) -> Self {
        Self {
            strategy,
            steps: VecDeque::new(),
        }
    }

    pub fn then(mut self, step: BypassStep) -> Self {
        self.steps.push_back(step);
        self
    }

    pub fn next_step(&mut self) -> Option<BypassStep> {
        self.steps.pop_front()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> impl Iterator<Item = &BypassStep> {
        self.steps.iter()
    }
}

pub trait BypassStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies(&self, ctx: &BypassContext<'_>) -> bool;

    /// `Ok(None)` hands the response to the next registered strategy.
    fn plan(&self, ctx: &BypassContext<'_>) -> Result<Option<BypassPlan>, ProfileError>;
}

/// Lite search endpoint URL for `query`.
pub(crate) fn lite_search_url(query: &str) -> Option<Url> {
    Url::parse_with_params(LITE_SEARCH_ENDPOINT, &[("q", query)]).ok()
}

pub(crate) fn query_param(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, value)| key == "q" && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

/// `old.` variant of a reddit URL, unless it already is one.
pub(crate) fn old_reddit_url(url: &Url) -> Option<Url> {
    let host = url.host_str()?;
    if host.starts_with("old.") || !host_in_domain(host, "reddit.com") {
        return None;
    }
    let bare = host.strip_prefix("www.").unwrap_or(host);
    let mut rewritten = url.clone();
    rewritten.set_host(Some(&format!("old.{bare}"))).ok()?;
    Some(rewritten)
}

fn compact_reddit_url(url: &Url) -> Option<Url> {
    let path = url.path();
    if path.contains(".compact") || path.contains("/compact") {
        return None;
    }
    let mut rewritten = url.clone();
    if path.ends_with('/') {
        rewritten.set_path(&format!("{path}.compact"));
    } else {
        rewritten.set_path(&format!("{path}/.compact"));
    }
    Some(rewritten)
}

/// Mobile identity first, then a search-engine crawler identity.
#[derive(Debug, Default)]
pub struct CloudflareStrategy;

impl BypassStrategy for CloudflareStrategy {
    fn name(&self) -> &'static str {
        "cloudflare"
    }

    fn applies(&self, ctx: &BypassContext<'_>) -> bool {
        ctx.kind == ProtectionKind::Cloudflare
    }

    fn plan(&self, ctx: &BypassContext<'_>) -> Result<Option<BypassPlan>, ProfileError> {
        let plan = BypassPlan::new(self.name())
            .then(
                BypassStep::new("mobile-identity", ctx.url.clone())
                    .with_headers(fingerprint::identity_headers("iphone-safari")?)
                    .after(DelayRange::millis(3_000, 5_000)),
            )
            .then(
                BypassStep::new("crawler-identity", ctx.url.clone())
                    .with_headers(fingerprint::identity_headers("googlebot")?),
            );
        Ok(Some(plan))
    }
}

/// Reissues google searches against the lite search endpoint.
#[derive(Debug, Default)]
pub struct GoogleSearchStrategy;

impl BypassStrategy for GoogleSearchStrategy {
    fn name(&self) -> &'static str {
        "google-search"
    }

    fn applies(&self, ctx: &BypassContext<'_>) -> bool {
        ctx.kind == ProtectionKind::GoogleCaptcha || host_in_domain(ctx.host(), "google.com")
    }

    fn plan(&self, ctx: &BypassContext<'_>) -> Result<Option<BypassPlan>, ProfileError> {
        let Some(target) = query_param(ctx.url).and_then(|query| lite_search_url(&query)) else {
            return Ok(None);
        };
        Ok(Some(BypassPlan::new(self.name()).then(
            BypassStep::new("lite-search", target).as_action(ActionType::Search),
        )))
    }
}

/// Long pause with a Firefox identity; searches fall back to a code-search
/// site when still blocked.
#[derive(Debug, Default)]
pub struct StackOverflowStrategy;

impl BypassStrategy for StackOverflowStrategy {
    fn name(&self) -> &'static str {
        "stackoverflow"
    }

    fn applies(&self, ctx: &BypassContext<'_>) -> bool {
        ctx.kind == ProtectionKind::StackOverflow
            || host_in_domain(ctx.host(), "stackoverflow.com")
    }

    fn plan(&self, ctx: &BypassContext<'_>) -> Result<Option<BypassPlan>, ProfileError> {
        let mut plan = BypassPlan::new(self.name()).then(
            BypassStep::new("firefox-identity", ctx.url.clone())
                .with_headers(fingerprint::identity_headers("firefox-desktop")?)
                .after(DelayRange::millis(8_000, 12_000)),
        );

        if ctx.url.path().contains("/search")
            && let Some(query) = query_param(ctx.url)
            && let Ok(target) = Url::parse_with_params(CODE_SEARCH_ENDPOINT, &[("q", query)])
        {
            plan = plan.then(BypassStep::new("code-search", target).as_action(ActionType::Search));
        }
        Ok(Some(plan))
    }
}

/// `old.` subdomain first, then the `.compact` view with a mobile identity.
#[derive(Debug, Default)]
pub struct RedditStrategy;

impl BypassStrategy for RedditStrategy {
    fn name(&self) -> &'static str {
        "reddit"
    }

    fn applies(&self, ctx: &BypassContext<'_>) -> bool {
        ctx.kind == ProtectionKind::Reddit || host_in_domain(ctx.host(), "reddit.com")
    }

    fn plan(&self, ctx: &BypassContext<'_>) -> Result<Option<BypassPlan>, ProfileError> {
        let mut plan = BypassPlan::new(self.name());
        if let Some(old) = old_reddit_url(ctx.url) {
            plan = plan.then(
                BypassStep::new("old-interface", old).after(DelayRange::millis(2_000, 4_000)),
            );
        }
        if let Some(compact) = compact_reddit_url(ctx.url) {
            plan = plan.then(
                BypassStep::new("compact-interface", compact)
                    .with_headers(fingerprint::identity_headers("iphone-compact")?),
            );
        }
        Ok((!plan.is_empty()).then_some(plan))
    }
}

/// Random desktop identity with small header perturbations.
#[derive(Debug, Default)]
pub struct GenericStrategy;

impl GenericStrategy {
    fn perturbed_headers() -> Result<HeaderMap, ProfileError> {
        let mut rng = rand::thread_rng();
        let family = *BrowserFamily::DESKTOP
            .choose(&mut rng)
            .unwrap_or(&BrowserFamily::Chrome);
        let mut headers = fingerprint::family_headers(family)?;

        if rng.gen_bool(0.5) {
            fingerprint::insert(&mut headers, "DNT", "1")?;
        }
        if rng.gen_bool(0.3) {
            fingerprint::insert(&mut headers, "Permissions-Policy", "interest-cohort=()")?;
        }
        if rng.gen_bool(0.3)
            && let Some(accept) = headers.get("accept").and_then(|value| value.to_str().ok())
        {
            let weight = if rng.gen_bool(0.5) { "q=0.8" } else { "q=0.9" };
            let tweaked = accept.replacen("q=0.9", weight, 1);
            fingerprint::insert(&mut headers, "Accept", &tweaked)?;
        }
        Ok(headers)
    }
}

impl BypassStrategy for GenericStrategy {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn applies(&self, _ctx: &BypassContext<'_>) -> bool {
        true
    }

    fn plan(&self, ctx: &BypassContext<'_>) -> Result<Option<BypassPlan>, ProfileError> {
        Ok(Some(BypassPlan::new(self.name()).then(
            BypassStep::new("rotated-identity", ctx.url.clone())
                .with_headers(Self::perturbed_headers()?)
                .after(DelayRange::millis(2_000, 5_000)),
        )))
    }
}

/// Ordered registry of strategies; the first one that applies and produces a
/// plan wins.
#[derive(Clone)]
pub struct BypassDispatcher {
    strategies: Vec<Arc<dyn BypassStrategy>>,
}

impl std::fmt::Debug for BypassDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.strategies.iter().map(|s| s.name()).collect();
        f.debug_struct("BypassDispatcher")
            .field("strategies", &names)
            .finish()
    }
}

impl Default for BypassDispatcher {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl BypassDispatcher {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Built-in strategies, generic fallback last.
    pub fn with_defaults() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.strategies = vec![
            Arc::new(CloudflareStrategy),
            Arc::new(GoogleSearchStrategy),
            Arc::new(StackOverflowStrategy),
            Arc::new(RedditStrategy),
            Arc::new(GenericStrategy),
        ];
        dispatcher
    }

    /// Register a strategy ahead of the existing ones.
    pub fn register(&mut self, strategy: Arc<dyn BypassStrategy>) {
        self.strategies.insert(0, strategy);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|strategy| strategy.name()).collect()
    }

    pub fn dispatch(&self, ctx: &BypassContext<'_>) -> Option<BypassPlan> {
        for strategy in &self.strategies {
            if !strategy.applies(ctx) {
                continue;
            }
            match strategy.plan(ctx) {
                Ok(Some(plan)) if !plan.is_empty() => return Some(plan),
                Ok(_) => continue,
                Err(err) => {
                    log::warn!("{} strategy could not build a plan: {err}", strategy.name());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_for(kind: ProtectionKind, url: &str) -> BypassPlan {
        let url = Url::parse(url).unwrap();
        let ctx = BypassContext {
            kind,
            url: &url,
            status: 403,
        };
        BypassDispatcher::with_defaults()
            .dispatch(&ctx)
            .expect("plan")
    }

    #[test]
    fn cloudflare_plan_tries_mobile_then_crawler() {
        let mut plan = plan_for(ProtectionKind::Cloudflare, "https://example.com/page");
        assert_eq!(plan.strategy, "cloudflare");
        assert_eq!(plan.len(), 2);

        let first = plan.next_step().unwrap();
        assert!(first.headers["user-agent"].to_str().unwrap().contains("iPhone"));
        assert_eq!(first.delay, Some(DelayRange::millis(3_000, 5_000)));

        let second = plan.next_step().unwrap();
        assert!(second.headers["user-agent"].to_str().unwrap().contains("Googlebot"));
        assert!(plan.next_step().is_none());
    }

    #[test]
    fn google_search_moves_to_lite_endpoint() {
        let mut plan = plan_for(ProtectionKind::GoogleCaptcha, "https://www.google.com/search?q=rust+async");
        let step = plan.next_step().unwrap();
        assert_eq!(step.url.host_str(), Some("lite.duckduckgo.com"));
        assert_eq!(query_param(&step.url).as_deref(), Some("rust async"));
        assert_eq!(step.action, ActionType::Search);
    }

    #[test]
    fn google_captcha_without_query_falls_back_to_generic() {
        let plan = plan_for(ProtectionKind::GoogleCaptcha, "https://www.google.com/maps");
        assert_eq!(plan.strategy, "generic");
    }

    #[test]
    fn stackoverflow_search_adds_code_search_step() {
        let mut plan = plan_for(ProtectionKind::StackOverflow, "https://stackoverflow.com/search?q=borrow");
        assert_eq!(plan.len(), 2);
        let first = plan.next_step().unwrap();
        assert_eq!(first.delay, Some(DelayRange::millis(8_000, 12_000)));
        assert!(first.headers["user-agent"].to_str().unwrap().contains("Firefox"));
        let second = plan.next_step().unwrap();
        assert_eq!(second.url.host_str(), Some("github.com"));

        let question = plan_for(ProtectionKind::StackOverflow, "https://stackoverflow.com/questions/1");
        assert_eq!(question.len(), 1);
    }

    #[test]
    fn reddit_plan_uses_old_then_compact() {
        let mut plan = plan_for(ProtectionKind::Reddit, "https://www.reddit.com/r/rust");
        assert_eq!(
            plan.next_step().unwrap().url.as_str(),
            "https://old.reddit.com/r/rust"
        );
        assert_eq!(
            plan.next_step().unwrap().url.as_str(),
            "https://www.reddit.com/r/rust/.compact"
        );
    }

    #[test]
    fn generic_plan_uses_desktop_identity() {
        let mut plan = plan_for(ProtectionKind::Generic, "https://example.org/");
        let step = plan.next_step().unwrap();
        let ua = step.headers["user-agent"].to_str().unwrap().to_string();
        assert_ne!(fingerprint::detect_browser_family(&ua), BrowserFamily::Mobile);
        assert_eq!(step.delay, Some(DelayRange::millis(2_000, 5_000)));
    }

    #[test]
    fn registered_strategies_take_priority() {
        struct Noop;
        impl BypassStrategy for Noop {
            fn name(&self) -> &'static str {
                "noop"
            }
            fn applies(&self, _ctx: &BypassContext<'_>) -> bool {
                true
            }
            fn plan(&self, ctx: &BypassContext<'_>) -> Result<Option<BypassPlan>, ProfileError> {
                Ok(Some(BypassPlan::new("noop").then(BypassStep::new("same", ctx.url.clone()))))
            }
        }

        let mut dispatcher = BypassDispatcher::with_defaults();
        dispatcher.register(Arc::new(Noop));
        assert_eq!(dispatcher.names()[0], "noop");

        let url = Url::parse("https://example.com/").unwrap();
        let ctx = BypassContext {
            kind: ProtectionKind::Cloudflare,
            url: &url,
            status: 503,
        };
        assert_eq!(dispatcher.dispatch(&ctx).unwrap().strategy, "noop");
    }
}
