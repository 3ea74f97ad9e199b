//! Anti-automation protection handling.
//!
//! Three pieces cooperate here:
//! - [`ProtectionDetector`] classifies a finished response;
//! - [`BypassDispatcher`] turns a classification into a [`BypassPlan`] of
//!   follow-up requests the engine runs in its own loop;
//! - [`PreflightRegistry`] rewrites requests to known-strict hosts before
//!   they are ever sent.

pub mod detector;
pub mod preflight;
pub mod strategies;

use http::HeaderMap;
use url::Url;

pub use detector::ProtectionDetector;
pub use preflight::{Preflight, PreflightRegistry, PreflightRule};
pub use strategies::{BypassContext, BypassDispatcher, BypassPlan, BypassStep, BypassStrategy};

/// Classification of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtectionKind {
    Cloudflare,
    GoogleCaptcha,
    StackOverflow,
    Reddit,
    Generic,
    #[default]
    None,
}

impl ProtectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtectionKind::Cloudflare => "cloudflare",
            ProtectionKind::GoogleCaptcha => "google-captcha",
            ProtectionKind::StackOverflow => "stackoverflow",
            ProtectionKind::Reddit => "reddit",
            ProtectionKind::Generic => "generic",
            ProtectionKind::None => "none",
        }
    }

    pub fn is_blocked(self) -> bool {
        self != ProtectionKind::None
    }
}

impl std::fmt::Display for ProtectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parts of a response the detector looks at. `body` is `None` for
/// binary payloads and HEAD requests.
#[derive(Debug, Clone, Copy)]
pub struct ProtectionProbe<'a> {
    pub url: &'a Url,
    pub status: u16,
    pub headers: &'a HeaderMap,
    pub content_type: &'a str,
    pub body: Option<&'a str>,
}
