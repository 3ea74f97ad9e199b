//! # adaptive-fetch
//!
//! An adaptive HTTP fetch engine. Every host gets one consistent simulated
//! browser, requests are paced like a person would pace them, cookies persist
//! across runs, and responses that look like bot checks are retried through
//! per-protection fallback strategies.
//!
//! ## Features
//!
//! - Redirect, retry and decompression fallback handled in one explicit loop
//! - Per-host browser fingerprints with matching client hints
//! - Persistent cookie jar with domain, path and expiry matching
//! - Protection detection (Cloudflare, Google, StackOverflow, Reddit, generic)
//! - Charset sniffing and streamed gzip/deflate/brotli decoding
//! - Multipart uploads and optional proxy rotation
//!
//! ## Example
//!
//! ```no_run
//! use adaptive_fetch::Engine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new()?;
//!     let response = engine.get("https://example.com").await?;
//!     println!("{}: {}", response.status(), response.text().unwrap_or_default());
//!     Ok(())
//! }
//! ```

mod engine;

pub mod cancel;
pub mod modules;
pub mod protection;
pub mod request;

pub use crate::engine::{
    Body,
    CookieStore,
    Engine,
    EngineBuilder,
    EngineConfig,
    EngineError,
    EngineResult,
    Response,
};

pub use crate::cancel::{CancelHandle, CancelToken, cancel_pair};

pub use crate::protection::{
    BypassContext,
    BypassDispatcher,
    BypassPlan,
    BypassStep,
    BypassStrategy,
    Preflight,
    PreflightRegistry,
    PreflightRule,
    ProtectionDetector,
    ProtectionKind,
};

pub use crate::request::{BodyError, FormData, PreparedBody, RequestBody, RequestOptions};

pub use crate::modules::{
    ActionType,
    BrowserFamily,
    BrowserProfile,
    CookieJar,
    EngineEvent,
    EventHandler,
    ProxyConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
