//! Browser fingerprint profiles.
//!
//! Every hostname gets one simulated browser identity the first time it is
//! contacted. The identity is cached for the lifetime of the engine so that a
//! site never sees the user agent, language or platform change mid-session.
//! Header templates and user agents are embedded from `browsers.json`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use once_cell::sync::Lazy;
use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

const CLIENT_HINT_FULL_VERSION: &str = "\"122.0.6261.69\"";
const CLIENT_HINT_VERSION_LIST: &str =
    "\"Not A(Brand\";v=\"99\", \"Google Chrome\";v=\"122\", \"Chromium\";v=\"122\"";

const DESKTOP_RESOLUTIONS: &[(u16, u16)] = &[(1920, 1080), (1366, 768), (2560, 1440), (1280, 800)];
const MOBILE_RESOLUTIONS: &[(u16, u16)] = &[(375, 812), (414, 896), (390, 844)];
const TIMEZONES: &[&str] = &["UTC", "America/New_York", "Europe/London", "Asia/Tokyo"];
const COLOR_DEPTHS: &[u8] = &[24, 30, 48];
const PIXEL_RATIOS: &[f32] = &[1.0, 1.5, 2.0, 3.0];

/// Browser family a profile imitates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserFamily {
    Chrome,
    Firefox,
    Safari,
    Edge,
    Mobile,
}

impl BrowserFamily {
    pub const ALL: [BrowserFamily; 5] = [
        BrowserFamily::Chrome,
        BrowserFamily::Firefox,
        BrowserFamily::Safari,
        BrowserFamily::Edge,
        BrowserFamily::Mobile,
    ];

    pub const DESKTOP: [BrowserFamily; 4] = [
        BrowserFamily::Chrome,
        BrowserFamily::Firefox,
        BrowserFamily::Safari,
        BrowserFamily::Edge,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BrowserFamily::Chrome => "desktop-chrome",
            BrowserFamily::Firefox => "desktop-firefox",
            BrowserFamily::Safari => "desktop-safari",
            BrowserFamily::Edge => "desktop-edge",
            BrowserFamily::Mobile => "mobile",
        }
    }

    pub fn is_mobile(self) -> bool {
        matches!(self, BrowserFamily::Mobile)
    }
}

impl std::fmt::Display for BrowserFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Simulated browser identity bound to one hostname.
#[derive(Debug, Clone, PartialEq)]
pub struct BrowserProfile {
    pub family: BrowserFamily,
    pub user_agent: String,
    pub language: String,
    pub platform: String,
    pub color_depth: u8,
    pub pixel_ratio: f32,
    pub timezone: String,
    pub screen_resolution: (u16, u16),
    pub session_id: String,
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("embedded browser catalog is invalid: {0}")]
    Catalog(String),
    #[error("browser catalog has no template for {0}")]
    MissingFamily(BrowserFamily),
    #[error("browser catalog has no identity named {0}")]
    MissingIdentity(String),
    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },
}

#[derive(Debug, Deserialize)]
struct Catalog {
    families: HashMap<BrowserFamily, FamilyTemplate>,
    identities: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct FamilyTemplate {
    headers: HashMap<String, String>,
    user_agents: Vec<String>,
}

static CATALOG: Lazy<Result<Catalog, String>> = Lazy::new(|| {
    serde_json::from_str(include_str!("browsers.json")).map_err(|err| err.to_string())
});

fn catalog() -> Result<&'static Catalog, ProfileError> {
    CATALOG
        .as_ref()
        .map_err(|err| ProfileError::Catalog(err.clone()))
}

fn template(family: BrowserFamily) -> Result<&'static FamilyTemplate, ProfileError> {
    catalog()?
        .families
        .get(&family)
        .ok_or(ProfileError::MissingFamily(family))
}

/// Classify a caller-supplied user agent. Defaults to Chrome.
pub fn detect_browser_family(user_agent: &str) -> BrowserFamily {
    let ua = user_agent.to_ascii_lowercase();
    if ua.contains("firefox") {
        BrowserFamily::Firefox
    } else if ua.contains("safari") && !ua.contains("chrome") && !ua.contains("mobile") {
        BrowserFamily::Safari
    } else if ua.contains("edg/") || ua.contains("edge/") {
        BrowserFamily::Edge
    } else if ["mobile", "android", "iphone", "ipad"]
        .iter()
        .any(|marker| ua.contains(marker))
    {
        BrowserFamily::Mobile
    } else {
        BrowserFamily::Chrome
    }
}

/// Random user agent from the family's pool.
pub fn random_user_agent(family: BrowserFamily) -> Result<String, ProfileError> {
    template(family)?
        .user_agents
        .choose(&mut rand::thread_rng())
        .cloned()
        .ok_or(ProfileError::MissingFamily(family))
}

/// Template headers for a family with a random user agent from its pool.
pub fn family_headers(family: BrowserFamily) -> Result<HeaderMap, ProfileError> {
    let mut headers = to_header_map(&template(family)?.headers)?;
    insert(&mut headers, "User-Agent", &random_user_agent(family)?)?;
    Ok(headers)
}

/// Fixed header set for a named identity (crawler, mobile fallback, ...).
pub fn identity_headers(name: &str) -> Result<HeaderMap, ProfileError> {
    let identity = catalog()?
        .identities
        .get(name)
        .ok_or_else(|| ProfileError::MissingIdentity(name.to_string()))?;
    to_header_map(identity)
}

fn to_header_map(source: &HashMap<String, String>) -> Result<HeaderMap, ProfileError> {
    let mut headers = HeaderMap::with_capacity(source.len());
    for (name, value) in source {
        insert(&mut headers, name, value)?;
    }
    Ok(headers)
}

pub(crate) fn insert(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), ProfileError> {
    let header_name =
        HeaderName::from_bytes(name.as_bytes()).map_err(|err| ProfileError::InvalidHeader {
            name: name.to_string(),
            reason: err.to_string(),
        })?;
    let header_value = HeaderValue::from_str(value).map_err(|err| ProfileError::InvalidHeader {
        name: name.to_string(),
        reason: err.to_string(),
    })?;
    headers.insert(header_name, header_value);
    Ok(())
}

fn platform_for(user_agent: &str) -> &'static str {
    if user_agent.contains("Windows") {
        "Windows"
    } else if user_agent.contains("Android") {
        "Android"
    } else if user_agent.contains("iPhone") || user_agent.contains("iPad") {
        "iOS"
    } else if user_agent.contains("Macintosh") {
        "macOS"
    } else {
        "Linux"
    }
}

/// Where the `Referer` for a request comes from.
#[derive(Debug, Clone, Copy)]
pub enum RefererSource<'a> {
    /// The page the caller navigated from.
    Previous(&'a Url),
    /// The last URL fetched from the same host.
    Visited(&'a str),
}

fn fetch_site(target: &Url, referer: &Url) -> &'static str {
    let (host, previous) = match (target.host_str(), referer.host_str()) {
        (Some(host), Some(previous)) => (host, previous),
        _ => return "cross-site",
    };
    if host == previous {
        "same-origin"
    } else if host.ends_with(previous) || previous.ends_with(host) {
        "same-site"
    } else {
        "cross-site"
    }
}

/// Caches one [`BrowserProfile`] per hostname.
#[derive(Debug, Default)]
pub struct ProfileManager {
    profiles: Mutex<HashMap<String, Arc<BrowserProfile>>>,
}

impl ProfileManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Profile for `hostname`, drawn on first use and reused afterwards.
    pub fn profile_for(&self, hostname: &str) -> Result<Arc<BrowserProfile>, ProfileError> {
        let mut profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(profile) = profiles.get(hostname) {
            return Ok(Arc::clone(profile));
        }

        let profile = Arc::new(Self::draw_profile()?);
        log::debug!(
            "assigned {} profile to {hostname}",
            profile.family.as_str()
        );
        profiles.insert(hostname.to_string(), Arc::clone(&profile));
        Ok(profile)
    }

    /// Number of hosts with an assigned profile.
    pub fn len(&self) -> usize {
        self.profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn draw_profile() -> Result<BrowserProfile, ProfileError> {
        let mut rng = rand::thread_rng();
        let family = *BrowserFamily::ALL
            .choose(&mut rng)
            .unwrap_or(&BrowserFamily::Chrome);
        let user_agent = random_user_agent(family)?;
        let language = if rng.gen_bool(0.2) {
            "en-GB,en;q=0.9"
        } else {
            "en-US,en;q=0.9"
        };
        let resolutions = if family.is_mobile() {
            MOBILE_RESOLUTIONS
        } else {
            DESKTOP_RESOLUTIONS
        };
        let session_id: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(13)
            .map(|byte| char::from(byte).to_ascii_lowercase())
            .collect();

        Ok(BrowserProfile {
            family,
            platform: platform_for(&user_agent).to_string(),
            user_agent,
            language: language.to_string(),
            color_depth: *COLOR_DEPTHS.choose(&mut rng).unwrap_or(&24),
            pixel_ratio: *PIXEL_RATIOS.choose(&mut rng).unwrap_or(&1.0),
            timezone: TIMEZONES.choose(&mut rng).unwrap_or(&"UTC").to_string(),
            screen_resolution: *resolutions.choose(&mut rng).unwrap_or(&(1920, 1080)),
            session_id,
        })
    }

    /// Headers a real browser with this host's profile would send.
    pub fn headers_for(
        &self,
        target: &Url,
        method: &Method,
        referer: Option<RefererSource<'_>>,
    ) -> Result<HeaderMap, ProfileError> {
        let host = target.host_str().unwrap_or_default();
        let profile = self.profile_for(host)?;
        let mut headers = to_header_map(&template(profile.family)?.headers)?;
        let mut rng = rand::thread_rng();

        insert(&mut headers, "User-Agent", &profile.user_agent)?;
        insert(&mut headers, "Accept-Language", &profile.language)?;
        if headers.contains_key("sec-ch-ua-platform") {
            insert(
                &mut headers,
                "Sec-Ch-Ua-Platform",
                &format!("\"{}\"", profile.platform),
            )?;
        }
        if headers.contains_key("sec-ch-ua-mobile") {
            let mobile = if profile.family.is_mobile() { "?1" } else { "?0" };
            insert(&mut headers, "Sec-Ch-Ua-Mobile", mobile)?;
        }

        if rng.gen_bool(0.5) {
            let (width, height) = profile.screen_resolution;
            insert(&mut headers, "Viewport-Width", &width.to_string())?;
            insert(&mut headers, "Viewport-Height", &height.to_string())?;
        }

        if rng.gen_bool(0.3) {
            let arch = if profile.platform == "Windows" {
                "\"x86\""
            } else {
                "\"arm\""
            };
            insert(&mut headers, "Sec-Ch-Ua-Arch", arch)?;
            insert(&mut headers, "Sec-Ch-Ua-Bitness", "\"64\"")?;
            insert(&mut headers, "Sec-Ch-Ua-Full-Version", CLIENT_HINT_FULL_VERSION)?;
            insert(
                &mut headers,
                "Sec-Ch-Ua-Full-Version-List",
                CLIENT_HINT_VERSION_LIST,
            )?;
        }

        match referer {
            Some(RefererSource::Previous(previous)) => {
                insert(&mut headers, "Referer", previous.as_str())?;
                insert(&mut headers, "Sec-Fetch-Site", fetch_site(target, previous))?;
            }
            Some(RefererSource::Visited(previous)) => {
                insert(&mut headers, "Referer", previous)?;
                insert(&mut headers, "Sec-Fetch-Site", "same-origin")?;
            }
            None => {}
        }

        if method == Method::POST {
            insert(&mut headers, "Sec-Fetch-Mode", "cors")?;
            insert(&mut headers, "Origin", &target.origin().ascii_serialization())?;
        }

        Ok(headers)
    }
}
