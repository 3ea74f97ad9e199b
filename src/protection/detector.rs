//! Response classification.
//!
//! Detection runs in two stages. A cheap gate looks for any sign of trouble
//! (rate-limit status or header, an HTML 403/503, or bot-check wording in the
//! body). Only gated responses are matched against the ordered signature
//! table, where the first hit wins.

use super::{ProtectionKind, ProtectionProbe};
use crate::modules::timing::host_in_domain;

type Matcher = fn(&ProtectionProbe<'_>, &str, &str) -> bool;

/// Ordered signature entry. The matcher receives the probe, the lower-cased
/// host and the lower-cased body.
#[derive(Clone)]
struct Signature {
    kind: ProtectionKind,
    matches: Matcher,
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signature").field("kind", &self.kind).finish()
    }
}

fn contains_any(body: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| body.contains(needle))
}

fn cloudflare(_: &ProtectionProbe<'_>, _: &str, body: &str) -> bool {
    body.contains("cloudflare")
        && contains_any(
            body,
            &[
                "checking your browser",
                "security challenge",
                "just a moment",
                "attention required",
            ],
        )
}

fn google_captcha(_: &ProtectionProbe<'_>, _: &str, body: &str) -> bool {
    contains_any(
        body,
        &[
            "our systems have detected unusual traffic",
            "please solve this captcha",
            "unusual traffic from your computer",
        ],
    ) || (body.contains("automatic query") && body.contains("blocked"))
}

fn stackoverflow(probe: &ProtectionProbe<'_>, host: &str, body: &str) -> bool {
    host_in_domain(host, "stackoverflow.com")
        && (matches!(probe.status, 403 | 429)
            || contains_any(body, &["human verification", "too many requests"]))
}

fn reddit(probe: &ProtectionProbe<'_>, host: &str, body: &str) -> bool {
    host_in_domain(host, "reddit.com")
        && !probe.url.as_str().contains(".compact")
        && (probe.status == 403
            || contains_any(body, &["our cdn was unable to reach our servers", "blocked"])
            || (body.contains("robots") && body.contains("detection")))
}

fn generic(probe: &ProtectionProbe<'_>, _: &str, body: &str) -> bool {
    matches!(probe.status, 403 | 429)
        || contains_any(
            body,
            &[
                "captcha",
                "robot",
                "automated",
                "bot detection",
                "human verification",
                "please verify you are human",
            ],
        )
}

/// Classifies responses into [`ProtectionKind`]s.
#[derive(Debug, Clone)]
pub struct ProtectionDetector {
    signatures: Vec<Signature>,
}

impl Default for ProtectionDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtectionDetector {
    pub fn new() -> Self {
        let signatures = vec![
            Signature {
                kind: ProtectionKind::Cloudflare,
                matches: cloudflare,
            },
            Signature {
                kind: ProtectionKind::GoogleCaptcha,
                matches: google_captcha,
            },
            Signature {
                kind: ProtectionKind::StackOverflow,
                matches: stackoverflow,
            },
            Signature {
                kind: ProtectionKind::Reddit,
                matches: reddit,
            },
            Signature {
                kind: ProtectionKind::Generic,
                matches: generic,
            },
        ];
        Self { signatures }
    }

    /// Status/header signals that a response may be a block page.
    pub fn transport_signals(probe: &ProtectionProbe<'_>) -> bool {
        let rate_limited = probe.status == 429
            || probe
                .headers
                .get("x-ratelimit-remaining")
                .and_then(|value| value.to_str().ok())
                .is_some_and(|remaining| remaining.trim() == "0");
        let challenge_page =
            probe.content_type.contains("text/html") && matches!(probe.status, 403 | 503);
        rate_limited || challenge_page
    }

    fn body_signals(body: &str) -> bool {
        body.contains("captcha")
            || (body.contains("robot") && body.contains("detected"))
            || body.contains("unusual traffic")
            || (body.contains("automated") && body.contains("script"))
            || (body.contains("cloudflare") && body.contains("checking your browser"))
    }

    pub fn classify(&self, probe: &ProtectionProbe<'_>) -> ProtectionKind {
        let lowered = probe.body.map(str::to_lowercase);
        let suspicious = Self::transport_signals(probe)
            || lowered.as_deref().is_some_and(Self::body_signals);
        if !suspicious {
            return ProtectionKind::None;
        }

        // Nothing to inspect: treat any transport signal as a generic block.
        let Some(body) = lowered else {
            return ProtectionKind::Generic;
        };
        let host = probe
            .url
            .host_str()
            .unwrap_or_default()
            .to_ascii_lowercase();

        self.signatures
            .iter()
            .find(|signature| (signature.matches)(probe, &host, &body))
            .map(|signature| signature.kind)
            .unwrap_or(ProtectionKind::None)
    }
}
