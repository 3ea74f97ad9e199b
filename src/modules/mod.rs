//! Supporting services for the engine.
//!
//! Fingerprints, cookies, pacing, proxies, content decoding, multipart
//! encoding and lifecycle events.

pub mod cookies;
pub mod decoding;
pub mod events;
pub mod fingerprint;
pub mod multipart;
pub mod proxy;
pub mod timing;

// Re-export commonly used types
pub use cookies::{CookieAttributes, CookieError, CookieJar, CookieRecord};
pub use decoding::{ContentCoding, DecodeError, StreamDecoder};
pub use events::{
    BypassEvent, EngineEvent, ErrorEvent, EventDispatcher, EventHandler, LoggingHandler,
    PostResponseEvent, PreRequestEvent, RedirectEvent, RetryEvent,
};
pub use fingerprint::{BrowserFamily, BrowserProfile, ProfileError, ProfileManager};
pub use multipart::{MultipartBody, MultipartError};
pub use proxy::{ProxyConfig, ProxyError, ProxyManager};
pub use timing::{ActionType, DelayRange, HumanTiming};
