//! Request orchestration.
//!
//! The [`Engine`] runs one logical fetch as an explicit loop of attempts. Each
//! attempt either finishes the chain or hands back the next attempt to run:
//! a redirect target, a transport retry, a decompression fallback or a
//! pre-emptive rewrite for a strict host. Blocked responses are handed to the
//! bypass dispatcher whose plan is run step by step through the same
//! machinery.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use http::header::{
	ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, COOKIE, HeaderValue, LOCATION, SET_COOKIE,
};
use http::{HeaderMap, Method};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::sleep;
use url::Url;

use crate::cancel::CancelToken;
use crate::modules::cookies::CookieJar;
use crate::modules::decoding::{
	self, ContentCoding, DecodeError, StreamDecoder, base_content_type, file_extension_for,
	is_binary_content_type,
};
use crate::modules::events::{
	BypassEvent, EngineEvent, ErrorEvent, EventDispatcher, EventHandler, LoggingHandler,
	PostResponseEvent, PreRequestEvent, RedirectEvent, RetryEvent,
};
use crate::modules::fingerprint::{ProfileError, ProfileManager, RefererSource};
use crate::modules::proxy::{ProxyConfig, ProxyError, ProxyManager, build_proxy};
use crate::modules::timing::{ActionType, DEFAULT_STRICT_DOMAINS, HumanTiming, retry_backoff};
use crate::protection::{
	BypassContext, BypassDispatcher, BypassStep, BypassStrategy, PreflightRegistry,
	PreflightRule, ProtectionDetector, ProtectionKind, ProtectionProbe,
};
use crate::request::{BodyError, RequestBody, RequestOptions, prepare_body};

/// Result alias used across the orchestration layer.
pub type EngineResult<T> = Result<T, EngineError>;

const VISITED_PER_HOST: usize = 50;

/// Error surfaced by [`Engine::execute`].
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("invalid url {url}: {reason}")]
	InvalidUrl { url: String, reason: String },
	#[error("request to {url} timed out")]
	Timeout { url: Url },
	#[error("network error for {url}: {source}")]
	Network { url: Url, source: reqwest::Error },
	#[error("too many redirects ({count}) while fetching {url}")]
	TooManyRedirects { url: Url, count: u32 },
	#[error("maximum retries ({max}) exceeded for {url}")]
	MaxRetriesExceeded { max: u32, url: Url },
	#[error("failed to decode body from {url}: {source}")]
	Decompression { url: Url, source: DecodeError },
	#[error("request cancelled")]
	Cancelled,
	#[error("header conversion failed: {0}")]
	InvalidHeader(String),
	#[error("http client error: {0}")]
	Client(reqwest::Error),
	#[error(transparent)]
	Profile(#[from] ProfileError),
	#[error(transparent)]
	Body(#[from] BodyError),
	#[error(transparent)]
	Proxy(#[from] ProxyError),
}

/// Response body: decoded text, or raw bytes for binary content.
#[derive(Debug, Clone)]
pub enum Body {
	Text(String),
	Binary(Bytes),
}

/// Final response of a request chain.
#[derive(Debug, Clone)]
pub struct Response {
	status: u16,
	headers: HeaderMap,
	body: Body,
	content_type: String,
	file_extension: String,
	url: Url,
	request_headers: HeaderMap,
	suspected_protection: ProtectionKind,
}

impl Response {
	pub fn status(&self) -> u16 {
		self.status
	}

	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	pub fn body(&self) -> &Body {
		&self.body
	}

	pub fn into_body(self) -> Body {
		self.body
	}

	pub fn is_binary(&self) -> bool {
		matches!(self.body, Body::Binary(_))
	}

	/// Media type without parameters; `text/plain` when the server sent none.
	pub fn content_type(&self) -> &str {
		&self.content_type
	}

	pub fn file_extension(&self) -> &str {
		&self.file_extension
	}

	/// URL of the response that ended the chain.
	pub fn url(&self) -> &Url {
		&self.url
	}

	/// Headers actually sent on the final attempt.
	pub fn request_headers(&self) -> &HeaderMap {
		&self.request_headers
	}

	/// Classification of the final response; `None` when it looked clean.
	pub fn suspected_protection(&self) -> ProtectionKind {
		self.suspected_protection
	}

	/// Decoded text, `None` for binary bodies.
	pub fn text(&self) -> Option<&str> {
		match &self.body {
			Body::Text(text) => Some(text),
			Body::Binary(_) => None,
		}
	}

	pub fn bytes(&self) -> Bytes {
		match &self.body {
			Body::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
			Body::Binary(bytes) => bytes.clone(),
		}
	}
}

/// Where cookies are kept.
#[derive(Debug, Clone, Default)]
pub enum CookieStore {
	/// `$HOME/.adaptive_fetch_cookies.json`, falling back to memory.
	#[default]
	Home,
	File(PathBuf),
	InMemory,
}

impl CookieStore {
	fn open(&self) -> CookieJar {
		match self {
			CookieStore::Home => CookieJar::default_path()
				.map(CookieJar::open)
				.unwrap_or_else(CookieJar::in_memory),
			CookieStore::File(path) => CookieJar::open(path.clone()),
			CookieStore::InMemory => CookieJar::in_memory(),
		}
	}
}

/// Engine configuration used by the builder.
#[derive(Clone)]
pub struct EngineConfig {
	pub max_retries: u32,
	pub max_redirects: u32,
	pub connect_timeout: Duration,
	pub read_timeout: Duration,
	pub proxy: ProxyConfig,
	pub strict_domains: Vec<String>,
	pub human_timing: bool,
	/// Multiplier for bypass step waits and retry backoff.
	pub delay_scale: f64,
	pub cookie_store: CookieStore,
	/// Retry plain transport failures with backoff instead of failing.
	pub retry_network_errors: bool,
	pub enable_preflight: bool,
	pub enable_bypass: bool,
	pub bypass_strategies: Vec<Arc<dyn BypassStrategy>>,
	pub preflight_rules: Vec<Arc<dyn PreflightRule>>,
	pub event_handlers: Vec<Arc<dyn EventHandler>>,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			max_retries: 5,
			max_redirects: 10,
			connect_timeout: Duration::from_secs(30),
			read_timeout: Duration::from_secs(60),
			proxy: ProxyConfig::default(),
			strict_domains: DEFAULT_STRICT_DOMAINS
				.iter()
				.map(|domain| domain.to_string())
				.collect(),
			human_timing: true,
			delay_scale: 1.0,
			cookie_store: CookieStore::default(),
			retry_network_errors: false,
			enable_preflight: true,
			enable_bypass: true,
			bypass_strategies: Vec::new(),
			preflight_rules: Vec::new(),
			event_handlers: Vec::new(),
		}
	}
}

impl EngineConfig {
	/// Defaults plus the proxy list from `PROXY_LIST`.
	pub fn from_env() -> Self {
		Self {
			proxy: ProxyConfig::from_env(),
			..Self::default()
		}
	}
}

/// Fluent builder for [`Engine`].
pub struct EngineBuilder {
	config: EngineConfig,
}

impl EngineBuilder {
	pub fn new() -> Self {
		Self {
			config: EngineConfig::default(),
		}
	}

	pub fn with_config(config: EngineConfig) -> Self {
		Self { config }
	}

	pub fn with_max_retries(mut self, max_retries: u32) -> Self {
		self.config.max_retries = max_retries.max(1);
		self
	}

	pub fn with_max_redirects(mut self, max_redirects: u32) -> Self {
		self.config.max_redirects = max_redirects;
		self
	}

	pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
		self.config.read_timeout = timeout;
		self
	}

	pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
		self.config.connect_timeout = timeout;
		self
	}

	pub fn with_proxies<I, S>(mut self, proxies: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.proxy.endpoints = proxies.into_iter().map(Into::into).collect();
		self
	}

	pub fn with_proxy_probability(mut self, probability: f64) -> Self {
		self.config.proxy.probability = probability.clamp(0.0, 1.0);
		self
	}

	/// Take the proxy list from `PROXY_LIST`.
	pub fn with_env_proxies(mut self) -> Self {
		self.config.proxy.endpoints = ProxyConfig::from_env().endpoints;
		self
	}

	pub fn with_strict_domains<I, S>(mut self, domains: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.strict_domains = domains.into_iter().map(Into::into).collect();
		self
	}

	pub fn with_delay_scale(mut self, scale: f64) -> Self {
		self.config.delay_scale = scale.max(0.0);
		self
	}

	pub fn with_cookie_file(mut self, path: impl Into<PathBuf>) -> Self {
		self.config.cookie_store = CookieStore::File(path.into());
		self
	}

	pub fn with_in_memory_cookies(mut self) -> Self {
		self.config.cookie_store = CookieStore::InMemory;
		self
	}

	pub fn with_network_retries(mut self) -> Self {
		self.config.retry_network_errors = true;
		self
	}

	pub fn with_bypass_strategy(mut self, strategy: Arc<dyn BypassStrategy>) -> Self {
		self.config.bypass_strategies.push(strategy);
		self
	}

	pub fn with_preflight_rule(mut self, rule: Arc<dyn PreflightRule>) -> Self {
		self.config.preflight_rules.push(rule);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.config.event_handlers.push(handler);
		self
	}

	pub fn disable_human_timing(mut self) -> Self {
		self.config.human_timing = false;
		self
	}

	pub fn disable_preflight(mut self) -> Self {
		self.config.enable_preflight = false;
		self
	}

	pub fn disable_bypass(mut self) -> Self {
		self.config.enable_bypass = false;
		self
	}

	pub fn build(self) -> EngineResult<Engine> {
		Engine::with_config(self.config)
	}
}

impl Default for EngineBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Reqwest client pool keyed by proxy endpoint.
struct ClientPool {
	connect_timeout: Duration,
	read_timeout: Duration,
	clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl ClientPool {
	fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
		Self {
			connect_timeout,
			read_timeout,
			clients: Mutex::new(HashMap::new()),
		}
	}

	async fn client(&self, proxy: Option<&str>) -> EngineResult<reqwest::Client> {
		let mut guard = self.clients.lock().await;
		let key = proxy.map(|p| p.to_string());
		if let Some(client) = guard.get(&key) {
			return Ok(client.clone());
		}

		let mut builder = reqwest::Client::builder()
			.redirect(reqwest::redirect::Policy::none())
			.connect_timeout(self.connect_timeout)
			.read_timeout(self.read_timeout);

		builder = match proxy {
			Some(endpoint) => builder.proxy(build_proxy(endpoint)?),
			None => builder.no_proxy(),
		};

		let client = builder.build().map_err(EngineError::Client)?;
		guard.insert(key, client.clone());
		Ok(client)
	}
}

/// One pending attempt of a chain.
#[derive(Debug, Clone)]
struct Attempt {
	method: Method,
	url: Url,
	body: Option<RequestBody>,
	options: RequestOptions,
}

impl Attempt {
	/// Follow-up GET for a bypass step. The retry budget carries over; the
	/// step's headers win over the caller's.
	fn for_bypass_step(step: BypassStep, base: &RequestOptions) -> Self {
		let mut headers = base.headers.clone();
		for name in step.headers.keys() {
			headers.remove(name);
		}
		for (name, value) in &step.headers {
			headers.append(name.clone(), value.clone());
		}

		Self {
			method: Method::GET,
			url: step.url,
			body: None,
			options: RequestOptions {
				max_retries: base.max_retries,
				retry_count: base.retry_count,
				bypass_attempted: true,
				preflight_applied: true,
				proxy_url: base.proxy_url.clone(),
				previous_action: step.action,
				headers,
				cancel: base.cancel.clone(),
				..RequestOptions::default()
			},
		}
	}
}

enum Step {
	Continue(Attempt),
	Done(Response),
	Blocked(Response, Attempt),
}

enum Outcome {
	Finished(Response),
	Blocked(Response, Attempt),
}

/// Adaptive fetch engine.
pub struct Engine {
	config: EngineConfig,
	clients: ClientPool,
	profiles: ProfileManager,
	cookies: CookieJar,
	timing: HumanTiming,
	proxies: ProxyManager,
	detector: ProtectionDetector,
	bypass: BypassDispatcher,
	preflight: PreflightRegistry,
	visited: std::sync::Mutex<HashMap<String, Vec<String>>>,
	domain_locks: DomainLocks,
	events: Arc<EventDispatcher>,
}

impl std::fmt::Debug for Engine {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Engine")
			.field("profiles", &self.profiles.len())
			.field("cookies", &self.cookies.path())
			.field("bypass", &self.bypass)
			.field("preflight", &self.preflight)
			.finish()
	}
}

type DomainLocks = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// Held per-host lock. Dropping it releases the host and forgets the entry
/// once nobody else is waiting on it.
struct DomainGuard<'a> {
	locks: &'a DomainLocks,
	host: String,
	guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DomainGuard<'_> {
	fn drop(&mut self) {
		self.guard.take();
		let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
		if locks
			.get(&self.host)
			.is_some_and(|lock| Arc::strong_count(lock) == 1)
		{
			locks.remove(&self.host);
		}
	}
}

impl Engine {
	/// Engine with default configuration and `PROXY_LIST` applied.
	pub fn new() -> EngineResult<Self> {
		Engine::with_config(EngineConfig::from_env())
	}

	/// Obtain a builder to customise the engine.
	pub fn builder() -> EngineBuilder {
		EngineBuilder::new()
	}

	pub fn with_config(config: EngineConfig) -> EngineResult<Self> {
		for endpoint in &config.proxy.endpoints {
			build_proxy(endpoint)?;
		}

		let mut bypass = BypassDispatcher::with_defaults();
		for strategy in config.bypass_strategies.iter().rev() {
			bypass.register(Arc::clone(strategy));
		}
		let mut preflight = PreflightRegistry::with_defaults();
		for rule in config.preflight_rules.iter().rev() {
			preflight.register(Arc::clone(rule));
		}

		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		for handler in &config.event_handlers {
			events.register_handler(Arc::clone(handler));
		}

		Ok(Self {
			clients: ClientPool::new(config.connect_timeout, config.read_timeout),
			profiles: ProfileManager::new(),
			cookies: config.cookie_store.open(),
			timing: HumanTiming::new(config.human_timing, config.strict_domains.clone()),
			proxies: ProxyManager::new(config.proxy.clone()),
			detector: ProtectionDetector::new(),
			bypass,
			preflight,
			visited: std::sync::Mutex::new(HashMap::new()),
			domain_locks: std::sync::Mutex::new(HashMap::new()),
			events: Arc::new(events),
			config,
		})
	}

	pub fn config(&self) -> &EngineConfig {
		&self.config
	}

	pub fn cookies(&self) -> &CookieJar {
		&self.cookies
	}

	pub fn profiles(&self) -> &ProfileManager {
		&self.profiles
	}

	/// URLs fetched from `host`, oldest first.
	pub fn visited_sites(&self, host: &str) -> Vec<String> {
		self.visited
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.get(host)
			.cloned()
			.unwrap_or_default()
	}

	pub async fn get(&self, url: &str) -> EngineResult<Response> {
		self.execute(Method::GET, url, None, RequestOptions::default()).await
	}

	pub async fn post(&self, url: &str, body: impl Into<RequestBody>) -> EngineResult<Response> {
		self.execute(Method::POST, url, Some(body.into()), RequestOptions::default())
			.await
	}

	pub async fn put(&self, url: &str, body: impl Into<RequestBody>) -> EngineResult<Response> {
		self.execute(Method::PUT, url, Some(body.into()), RequestOptions::default())
			.await
	}

	pub async fn patch(&self, url: &str, body: impl Into<RequestBody>) -> EngineResult<Response> {
		self.execute(Method::PATCH, url, Some(body.into()), RequestOptions::default())
			.await
	}

	pub async fn delete(&self, url: &str) -> EngineResult<Response> {
		self.execute(Method::DELETE, url, None, RequestOptions::default())
			.await
	}

	pub async fn head(&self, url: &str) -> EngineResult<Response> {
		self.execute(Method::HEAD, url, None, RequestOptions::default()).await
	}

	pub async fn options(&self, url: &str) -> EngineResult<Response> {
		self.execute(Method::OPTIONS, url, None, RequestOptions::default())
			.await
	}

	/// Run one logical fetch: redirects, retries and at most one bypass plan.
	pub async fn execute(
		&self,
		method: Method,
		url: &str,
		body: Option<RequestBody>,
		options: RequestOptions,
	) -> EngineResult<Response> {
		let url = parse_target(url)?;
		let cancel = options.cancel_token();
		let attempt = Attempt {
			method,
			url,
			body,
			options,
		};

		let (blocked_response, blocked) = match self.run_chain(attempt, &cancel).await? {
			Outcome::Finished(response) => return Ok(response),
			Outcome::Blocked(response, attempt) => (response, attempt),
		};
		if blocked.options.bypass_attempted {
			return Ok(blocked_response);
		}

		let ctx = BypassContext {
			kind: blocked_response.suspected_protection,
			url: &blocked.url,
			status: blocked_response.status,
		};
		let Some(mut plan) = self.bypass.dispatch(&ctx) else {
			log::debug!("no bypass strategy for {} on {}", ctx.kind, blocked.url);
			return Ok(blocked_response);
		};

		self.events.dispatch(EngineEvent::Bypass(BypassEvent {
			url: blocked.url.clone(),
			protection: ctx.kind,
			strategy: plan.strategy,
			steps: plan.len(),
			timestamp: chrono::Utc::now(),
		}));

		let mut fallback = blocked_response;
		while let Some(step) = plan.next_step() {
			if let Some(delay) = step.delay {
				let wait = delay.sample(self.config.delay_scale);
				if !wait.is_zero() {
					log::debug!("{}: waiting {:.2}s before {}", plan.strategy, wait.as_secs_f64(), step.label);
					cancel
						.guard(sleep(wait))
						.await
						.ok_or(EngineError::Cancelled)?;
				}
			}

			let label = step.label;
			let attempt = Attempt::for_bypass_step(step, &blocked.options);
			match self.run_chain(attempt, &cancel).await {
				Ok(Outcome::Finished(response)) => return Ok(response),
				Ok(Outcome::Blocked(response, _)) => {
					log::debug!("{} step {label} still blocked ({})", plan.strategy, response.status);
					fallback = response;
				}
				Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
				Err(err) => {
					self.report_error(&blocked.url, &format!("{} step {label}: {err}", plan.strategy));
				}
			}
		}
		Ok(fallback)
	}

	async fn run_chain(&self, mut attempt: Attempt, cancel: &CancelToken) -> EngineResult<Outcome> {
		loop {
			match self.attempt_once(attempt, cancel).await? {
				Step::Continue(next) => attempt = next,
				Step::Done(response) => return Ok(Outcome::Finished(response)),
				Step::Blocked(response, attempt) => return Ok(Outcome::Blocked(response, attempt)),
			}
		}
	}

	async fn attempt_once(&self, attempt: Attempt, cancel: &CancelToken) -> EngineResult<Step> {
		if cancel.is_cancelled() {
			return Err(EngineError::Cancelled);
		}

		let max_retries = attempt.options.max_retries.unwrap_or(self.config.max_retries);
		if attempt.options.retry_count >= max_retries {
			self.report_error(&attempt.url, "retry budget exhausted");
			return Err(EngineError::MaxRetriesExceeded {
				max: max_retries,
				url: attempt.url,
			});
		}

		let host = host_of(&attempt.url)?;
		if let Some(next) = self.apply_preflight(&attempt, &host) {
			return Ok(Step::Continue(next));
		}

		let wait = self.timing.reserve(&host, attempt.options.previous_action);
		if !wait.is_zero() {
			log::debug!("pacing {host} for {:.2}s", wait.as_secs_f64());
			cancel
				.guard(sleep(wait))
				.await
				.ok_or(EngineError::Cancelled)?;
		}

		let visited = self.last_visited(&host);
		let referer = match (&attempt.options.previous_url, &visited) {
			(Some(previous), _) => Some(RefererSource::Previous(previous)),
			(None, Some(last)) => Some(RefererSource::Visited(last)),
			(None, None) => None,
		};
		let mut headers = self
			.profiles
			.headers_for(&attempt.url, &attempt.method, referer)?;

		let prepared = prepare_body(&attempt.method, attempt.body.as_ref(), attempt.options.json)?;
		if let Some(ref body) = prepared {
			let value = HeaderValue::from_str(&body.content_type)
				.map_err(|_| EngineError::InvalidHeader(body.content_type.clone()))?;
			headers.insert(CONTENT_TYPE, value);
		}

		let domain_guard = self.lock_domain(&host, cancel).await?;

		if let Some(cookie) = self.cookies.cookie_header(&attempt.url) {
			match HeaderValue::from_str(&cookie) {
				Ok(value) => {
					headers.insert(COOKIE, value);
				}
				Err(_) => log::warn!("skipping unencodable cookie header for {host}"),
			}
		}
		apply_overrides(&mut headers, &attempt.options.headers);
		if attempt.options.skip_compression {
			headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
		}

		let proxy = self.proxies.select(attempt.options.proxy_url.as_deref());
		self.events.dispatch(EngineEvent::PreRequest(PreRequestEvent {
			url: attempt.url.clone(),
			method: attempt.method.clone(),
			headers: headers.clone(),
			proxy: proxy.clone(),
			timestamp: chrono::Utc::now(),
		}));

		let client = self.clients.client(proxy.as_deref()).await?;
		let mut request = client
			.request(attempt.method.clone(), attempt.url.clone())
			.headers(headers.clone());
		if let Some(body) = prepared {
			request = request.body(body.bytes);
		}

		let started = Instant::now();
		let sent = cancel
			.guard(request.send())
			.await
			.ok_or(EngineError::Cancelled)?;
		let response = match sent {
			Ok(response) => response,
			Err(err) => {
				drop(domain_guard);
				return self.transport_failure(attempt, &host, err, cancel).await;
			}
		};

		let status = response.status().as_u16();
		let response_headers = response.headers().clone();
		let stored = self.cookies.ingest(
			&attempt.url,
			response_headers
				.get_all(SET_COOKIE)
				.iter()
				.filter_map(|value| value.to_str().ok()),
		);
		drop(domain_guard);
		if stored > 0 {
			log::debug!("stored {stored} cookies from {host}");
		}

		self.events.dispatch(EngineEvent::PostResponse(PostResponseEvent {
			url: attempt.url.clone(),
			method: attempt.method.clone(),
			status,
			latency: started.elapsed(),
			timestamp: chrono::Utc::now(),
		}));

		if let Some(next) = self.follow_redirect(&attempt, status, &response_headers)? {
			return Ok(Step::Continue(next));
		}

		let content_type_header = response_headers
			.get(CONTENT_TYPE)
			.and_then(|value| value.to_str().ok())
			.unwrap_or_default()
			.to_string();
		let is_binary = is_binary_content_type(&content_type_header);

		let raw = if attempt.method == Method::HEAD {
			Vec::new()
		} else {
			let coding = if is_binary {
				None
			} else {
				response_headers
					.get(CONTENT_ENCODING)
					.and_then(|value| value.to_str().ok())
					.and_then(ContentCoding::from_header)
			};
			match read_body(response, &attempt.url, coding, cancel).await? {
				Ok(raw) => raw,
				Err(source) => return self.decompression_fallback(attempt, max_retries, source),
			}
		};

		let body = if is_binary {
			Body::Binary(Bytes::from(raw))
		} else {
			Body::Text(decoding::decode_body(&raw, &content_type_header))
		};

		if attempt.method != Method::HEAD {
			self.record_visit(&host, &attempt.url);
		}

		let suspected_protection = self.detector.classify(&ProtectionProbe {
			url: &attempt.url,
			status,
			headers: &response_headers,
			content_type: &content_type_header,
			body: match &body {
				Body::Text(text) => Some(text.as_str()),
				Body::Binary(_) => None,
			},
		});

		let base_type = base_content_type(&content_type_header);
		let response = Response {
			status,
			headers: response_headers,
			body,
			content_type: if base_type.is_empty() {
				"text/plain".to_string()
			} else {
				base_type
			},
			file_extension: file_extension_for(&content_type_header),
			url: attempt.url.clone(),
			request_headers: headers,
			suspected_protection,
		};

		if suspected_protection.is_blocked() {
			log::info!("{} looks blocked ({suspected_protection}, status {status})", attempt.url);
			if self.config.enable_bypass {
				return Ok(Step::Blocked(response, attempt));
			}
		}
		Ok(Step::Done(response))
	}

	/// Rewrite the first attempt of a chain to a strict host.
	fn apply_preflight(&self, attempt: &Attempt, host: &str) -> Option<Attempt> {
		if !self.config.enable_preflight
			|| attempt.options.preflight_applied
			|| attempt.options.bypass_attempted
			|| !self.timing.is_strict(host)
		{
			return None;
		}

		let preflight = self.preflight.apply(&attempt.url)?;
		log::debug!("preflight {}: {} -> {}", preflight.label, attempt.url, preflight.url);

		let mut next = attempt.clone();
		next.options.preflight_applied = true;
		next.url = preflight.url;
		for (name, value) in preflight.headers.iter().flatten() {
			if !next.options.headers.contains_key(name) {
				next.options.headers.insert(name.clone(), value.clone());
			}
		}
		Some(next)
	}

	fn follow_redirect(
		&self,
		attempt: &Attempt,
		status: u16,
		headers: &HeaderMap,
	) -> EngineResult<Option<Attempt>> {
		if !matches!(status, 301 | 302 | 303 | 307 | 308) {
			return Ok(None);
		}
		let Some(location) = headers.get(LOCATION).and_then(|value| value.to_str().ok()) else {
			return Ok(None);
		};

		let target = attempt
			.url
			.join(location)
			.map_err(|err| EngineError::InvalidUrl {
				url: location.to_string(),
				reason: err.to_string(),
			})?;
		validate_target(&target)?;

		if attempt.options.redirect_count >= self.config.max_redirects {
			self.report_error(&attempt.url, "too many redirects");
			return Err(EngineError::TooManyRedirects {
				url: target,
				count: attempt.options.redirect_count + 1,
			});
		}

		let mut next = attempt.clone();
		let becomes_get = status == 303
			|| (matches!(status, 301 | 302) && attempt.method == Method::POST);
		if becomes_get && attempt.method != Method::HEAD {
			next.method = Method::GET;
			next.body = None;
		}
		next.options.redirect_count += 1;
		next.options.previous_url = Some(attempt.url.clone());
		next.options.previous_action = ActionType::Navigation;
		next.url = target;

		self.events.dispatch(EngineEvent::Redirect(RedirectEvent {
			from: attempt.url.clone(),
			to: next.url.clone(),
			count: next.options.redirect_count,
			timestamp: chrono::Utc::now(),
		}));
		Ok(Some(next))
	}

	async fn transport_failure(
		&self,
		attempt: Attempt,
		host: &str,
		err: reqwest::Error,
		cancel: &CancelToken,
	) -> EngineResult<Step> {
		self.report_error(&attempt.url, &err.to_string());
		if err.is_timeout() {
			return Err(EngineError::Timeout { url: attempt.url });
		}

		if self.proxies.has_proxies()
			&& !attempt.options.proxy_retry
			&& let Some(proxy) = self.proxies.random()
		{
			let mut next = attempt;
			next.options.proxy_url = Some(proxy);
			next.options.proxy_retry = true;
			next.options.retry_count += 1;
			self.report_retry(host, next.options.retry_count, "transport failure, switching proxy", Duration::ZERO);
			return Ok(Step::Continue(next));
		}

		if self.config.retry_network_errors {
			let mut next = attempt;
			next.options.retry_count += 1;
			let backoff = retry_backoff(next.options.retry_count, self.config.delay_scale);
			self.report_retry(host, next.options.retry_count, "transport failure", backoff);
			if !backoff.is_zero() {
				cancel
					.guard(sleep(backoff))
					.await
					.ok_or(EngineError::Cancelled)?;
			}
			return Ok(Step::Continue(next));
		}

		Err(EngineError::Network {
			url: attempt.url,
			source: err,
		})
	}

	/// One retry with `Accept-Encoding: identity` after a corrupt body.
	fn decompression_fallback(
		&self,
		attempt: Attempt,
		max_retries: u32,
		source: DecodeError,
	) -> EngineResult<Step> {
		if attempt.options.skip_compression || attempt.options.retry_count + 1 >= max_retries {
			self.report_error(&attempt.url, &source.to_string());
			return Err(EngineError::Decompression {
				url: attempt.url,
				source,
			});
		}

		let mut next = attempt;
		next.options.skip_compression = true;
		next.options.retry_count += 1;
		let host = next.url.host_str().unwrap_or_default().to_string();
		self.report_retry(&host, next.options.retry_count, &source.to_string(), Duration::ZERO);
		Ok(Step::Continue(next))
	}

	/// Serializes cookie read, send and Set-Cookie ingest for one host.
	async fn lock_domain(&self, host: &str, cancel: &CancelToken) -> EngineResult<DomainGuard<'_>> {
		let lock = Arc::clone(
			self.domain_locks
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.entry(host.to_string())
				.or_default(),
		);
		let guard = cancel.guard(lock.lock_owned()).await;
		let guard = DomainGuard {
			locks: &self.domain_locks,
			host: host.to_string(),
			guard,
		};
		if guard.guard.is_none() {
			return Err(EngineError::Cancelled);
		}
		Ok(guard)
	}

	fn last_visited(&self, host: &str) -> Option<String> {
		self.visited
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.get(host)
			.and_then(|urls| urls.last().cloned())
	}

	fn record_visit(&self, host: &str, url: &Url) {
		let mut visited = self.visited.lock().unwrap_or_else(PoisonError::into_inner);
		let urls = visited.entry(host.to_string()).or_default();
		urls.push(url.to_string());
		if urls.len() > VISITED_PER_HOST {
			let excess = urls.len() - VISITED_PER_HOST;
			urls.drain(..excess);
		}
	}

	fn report_error(&self, url: &Url, error: &str) {
		self.events.dispatch(EngineEvent::Error(ErrorEvent {
			domain: url.host_str().unwrap_or_default().to_string(),
			error: error.to_string(),
			timestamp: chrono::Utc::now(),
		}));
	}

	fn report_retry(&self, host: &str, attempt: u32, reason: &str, scheduled_after: Duration) {
		self.events.dispatch(EngineEvent::Retry(RetryEvent {
			domain: host.to_string(),
			attempt,
			reason: reason.to_string(),
			scheduled_after,
			timestamp: chrono::Utc::now(),
		}));
	}
}

/// Stream the body, decompressing on the fly when `coding` is set. The inner
/// error reports a corrupt compressed stream.
async fn read_body(
	response: reqwest::Response,
	url: &Url,
	coding: Option<ContentCoding>,
	cancel: &CancelToken,
) -> EngineResult<Result<Vec<u8>, DecodeError>> {
	let mut stream = response.bytes_stream();
	let mut decoder = coding.map(StreamDecoder::new);
	let mut raw = Vec::new();

	while let Some(chunk) = cancel
		.guard(stream.next())
		.await
		.ok_or(EngineError::Cancelled)?
	{
		let chunk = chunk.map_err(|err| body_error(url, err))?;
		match decoder.as_mut() {
			Some(decoder) => {
				if let Err(err) = decoder.feed(&chunk) {
					return Ok(Err(err));
				}
			}
			None => raw.extend_from_slice(&chunk),
		}
	}

	Ok(match decoder {
		Some(decoder) => decoder.finish(),
		None => Ok(raw),
	})
}

fn body_error(url: &Url, err: reqwest::Error) -> EngineError {
	if err.is_timeout() {
		EngineError::Timeout { url: url.clone() }
	} else {
		EngineError::Network {
			url: url.clone(),
			source: err,
		}
	}
}

fn apply_overrides(headers: &mut HeaderMap, overrides: &HeaderMap) {
	for name in overrides.keys() {
		headers.remove(name);
	}
	for (name, value) in overrides {
		headers.append(name.clone(), value.clone());
	}
}

fn parse_target(raw: &str) -> EngineResult<Url> {
	let url = Url::parse(raw).map_err(|err| EngineError::InvalidUrl {
		url: raw.to_string(),
		reason: err.to_string(),
	})?;
	validate_target(&url)?;
	Ok(url)
}

fn validate_target(url: &Url) -> EngineResult<()> {
	if !matches!(url.scheme(), "http" | "https") {
		return Err(EngineError::InvalidUrl {
			url: url.to_string(),
			reason: format!("unsupported scheme {}", url.scheme()),
		});
	}
	host_of(url).map(|_| ())
}

fn host_of(url: &Url) -> EngineResult<String> {
	url.host_str()
		.filter(|host| !host.is_empty())
		.map(str::to_ascii_lowercase)
		.ok_or_else(|| EngineError::InvalidUrl {
			url: url.to_string(),
			reason: "missing host".into(),
		})
}
