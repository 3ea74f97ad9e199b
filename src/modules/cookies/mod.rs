//! Persistent cookie jar.
//!
//! Cookies are kept as `domain -> name -> record` and written back to disk as a
//! whole on every mutation. Lookups apply domain, path, `Secure` and expiry
//! rules; expired records are dropped lazily.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// File name of the jar inside the home directory.
pub const COOKIE_FILE_NAME: &str = ".adaptive_fetch_cookies.json";

const OPPORTUNISTIC_PURGE_RATE: f64 = 0.1;

// Browsers cap cookie lifetimes at 400 days.
const MAX_AGE_CAP_SECS: i64 = 400 * 24 * 60 * 60;

const EXPIRES_FORMATS: &[&str] = &[
    "%a, %d %b %Y %H:%M:%S GMT",
    "%a, %d-%b-%Y %H:%M:%S GMT",
    "%A, %d-%b-%y %H:%M:%S GMT",
    "%a, %d-%b-%y %H:%M:%S GMT",
    "%a %b %e %H:%M:%S %Y",
];

type DomainCookies = HashMap<String, CookieRecord>;
type JarMap = HashMap<String, DomainCookies>;

#[derive(Debug, Error)]
pub enum CookieError {
    #[error("failed to write cookie jar {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize cookie jar: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One stored cookie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieRecord {
    pub value: String,
    pub expires: Option<DateTime<Utc>>,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
    pub created_at: i64,
}

impl CookieRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }
}

/// Attributes accepted by [`CookieJar::set`].
#[derive(Debug, Clone, Default)]
pub struct CookieAttributes {
    pub path: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
}

/// Result of parsing one `Set-Cookie` header.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCookie {
    pub domain: String,
    pub name: String,
    pub value: String,
    pub path: String,
    pub expires: Option<DateTime<Utc>>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
}

/// Parse a `Set-Cookie` value. Unknown or malformed attributes are skipped
/// on their own; a missing `name=value` pair rejects the header.
pub fn parse_set_cookie(header: &str, default_domain: &str) -> Option<ParsedCookie> {
    let mut parts = header.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let now = Utc::now();
    let mut cookie = ParsedCookie {
        domain: default_domain.to_ascii_lowercase(),
        name: name.to_string(),
        value: value.trim().to_string(),
        path: "/".to_string(),
        expires: None,
        secure: false,
        http_only: false,
        same_site: None,
    };
    let mut max_age: Option<DateTime<Utc>> = None;

    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (attr, attr_value) = match part.split_once('=') {
            Some((attr, attr_value)) => (attr.trim().to_ascii_lowercase(), attr_value.trim()),
            None => (part.to_ascii_lowercase(), ""),
        };

        match attr.as_str() {
            "secure" => cookie.secure = true,
            "httponly" => cookie.http_only = true,
            "domain" => {
                let domain = attr_value.trim_start_matches('.');
                if !domain.is_empty() {
                    cookie.domain = domain.to_ascii_lowercase();
                }
            }
            "path" => {
                cookie.path = if attr_value.is_empty() {
                    "/".to_string()
                } else {
                    attr_value.to_string()
                };
            }
            "expires" => match parse_expires(attr_value) {
                Some(expires) => cookie.expires = Some(expires),
                None => log::debug!("ignoring unparsable Expires {attr_value:?} on {name}"),
            },
            "max-age" => match attr_value.parse::<i64>() {
                Ok(seconds) => {
                    let offset = ChronoDuration::try_seconds(seconds.clamp(0, MAX_AGE_CAP_SECS))
                        .unwrap_or_else(ChronoDuration::zero);
                    max_age = Some(now.checked_add_signed(offset).unwrap_or(now));
                }
                Err(_) => log::debug!("ignoring malformed Max-Age {attr_value:?} on {name}"),
            },
            "samesite" if !attr_value.is_empty() => {
                cookie.same_site = Some(attr_value.to_ascii_lowercase());
            }
            _ => {}
        }
    }

    if max_age.is_some() {
        cookie.expires = max_age;
    }
    Some(cookie)
}

fn parse_expires(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    EXPIRES_FORMATS.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(value, format)
            .ok()
            .map(|naive| naive.and_utc())
    })
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Whether a cookie stored under `domain` applies to requests for `host`.
pub fn domain_matches(domain: &str, host: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
        || host.strip_prefix("www.") == Some(domain)
        || domain.strip_prefix("www.") == Some(host)
}

/// Cookie store shared by every request chain of an engine.
#[derive(Debug)]
pub struct CookieJar {
    store: Mutex<JarMap>,
    path: Option<PathBuf>,
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl CookieJar {
    /// Jar that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
            path: None,
        }
    }

    /// `$HOME/.adaptive_fetch_cookies.json`, if a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .filter(|home| !home.is_empty())
            .map(|home| PathBuf::from(home).join(COOKIE_FILE_NAME))
    }

    /// Load the jar stored at `path`. A missing or corrupt file yields an
    /// empty jar; expired entries are purged on load.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let store = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<JarMap>(&contents) {
                Ok(store) => store,
                Err(err) => {
                    log::warn!("cookie jar {} is corrupt, starting empty: {err}", path.display());
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                log::warn!("failed to read cookie jar {}: {err}", path.display());
                HashMap::new()
            }
        };

        let jar = Self {
            store: Mutex::new(store),
            path: Some(path),
        };
        let purged = jar.purge_expired();
        log::debug!(
            "loaded cookies for {} domains ({purged} expired dropped)",
            jar.domains().len()
        );
        jar
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, JarMap> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, store: &JarMap) {
        if let Err(err) = self.write(store) {
            log::warn!("{err}");
        }
    }

    fn write(&self, store: &JarMap) -> Result<(), CookieError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let serialized = serde_json::to_string_pretty(store)?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| CookieError::Io {
                path: path.clone(),
                source,
            })?;
        }
        // Readers only ever see a complete file.
        let staging = staging_path(path);
        fs::write(&staging, serialized)
            .and_then(|()| fs::rename(&staging, path))
            .map_err(|source| {
                let _ = fs::remove_file(&staging);
                CookieError::Io {
                    path: path.clone(),
                    source,
                }
            })
    }

    fn store_cookie(store: &mut JarMap, cookie: ParsedCookie, now: DateTime<Utc>) {
        if cookie.expires.is_some_and(|expires| expires <= now) {
            if let Some(cookies) = store.get_mut(&cookie.domain) {
                cookies.remove(&cookie.name);
                if cookies.is_empty() {
                    store.remove(&cookie.domain);
                }
            }
            return;
        }

        store.entry(cookie.domain).or_default().insert(
            cookie.name,
            CookieRecord {
                value: cookie.value,
                expires: cookie.expires,
                path: cookie.path,
                secure: cookie.secure,
                http_only: cookie.http_only,
                same_site: cookie.same_site,
                created_at: now.timestamp_millis(),
            },
        );
    }

    /// Store a cookie directly.
    pub fn set(&self, domain: &str, name: &str, value: &str, attrs: CookieAttributes) {
        let cookie = ParsedCookie {
            domain: domain.trim_start_matches('.').to_ascii_lowercase(),
            name: name.to_string(),
            value: value.to_string(),
            path: attrs.path.unwrap_or_else(|| "/".to_string()),
            expires: attrs.expires,
            secure: attrs.secure,
            http_only: attrs.http_only,
            same_site: attrs.same_site,
        };
        let mut store = self.lock();
        Self::store_cookie(&mut store, cookie, Utc::now());
        self.persist(&store);
    }

    /// Ingest every `Set-Cookie` value received from `url`.
    pub fn ingest<'a, I>(&self, url: &Url, headers: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let Some(host) = url.host_str() else {
            return 0;
        };
        let host = host.to_ascii_lowercase();
        let parsed: Vec<ParsedCookie> = headers
            .into_iter()
            .filter_map(|header| parse_set_cookie(header, &host))
            .filter(|cookie| {
                let allowed = domain_matches(&cookie.domain, &host);
                if !allowed {
                    log::debug!("ignoring cookie {} for foreign domain {}", cookie.name, cookie.domain);
                }
                allowed
            })
            .collect();
        if parsed.is_empty() {
            return 0;
        }

        let count = parsed.len();
        let now = Utc::now();
        let mut store = self.lock();
        for cookie in parsed {
            Self::store_cookie(&mut store, cookie, now);
        }
        self.persist(&store);
        count
    }

    /// `name=value` pairs applicable to `url`, at most one per name.
    pub fn cookies_for(&self, url: &Url) -> Vec<String> {
        let Some(host) = url.host_str() else {
            return Vec::new();
        };
        let host = host.to_ascii_lowercase();
        let request_path = if url.path().is_empty() { "/" } else { url.path() };
        let secure_request = url.scheme() == "https";
        let now = Utc::now();

        if rand::thread_rng().gen_bool(OPPORTUNISTIC_PURGE_RATE) {
            self.purge_expired();
        }

        let mut store = self.lock();
        let mut domains: Vec<String> = store
            .keys()
            .filter(|domain| domain_matches(domain, &host))
            .cloned()
            .collect();
        // Most specific domain first so its values win on name collisions.
        domains.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let mut seen = std::collections::HashSet::new();
        let mut pairs = Vec::new();
        let mut purged = false;

        for domain in domains {
            let Some(cookies) = store.get_mut(&domain) else {
                continue;
            };
            let before = cookies.len();
            cookies.retain(|_, record| !record.is_expired(now));
            purged |= cookies.len() != before;

            let mut names: Vec<&String> = cookies.keys().collect();
            names.sort();
            for name in names {
                let record = &cookies[name];
                if seen.contains(name)
                    || !request_path.starts_with(record.path.as_str())
                    || (record.secure && !secure_request)
                {
                    continue;
                }
                seen.insert(name.clone());
                pairs.push(format!("{name}={}", record.value));
            }
        }

        if purged {
            store.retain(|_, cookies| !cookies.is_empty());
            self.persist(&store);
        }
        pairs
    }

    /// Joined `Cookie` header value for `url`, if any cookie applies.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        let pairs = self.cookies_for(url);
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut store = self.lock();
        let mut removed = 0;
        for cookies in store.values_mut() {
            let before = cookies.len();
            cookies.retain(|_, record| !record.is_expired(now));
            removed += before - cookies.len();
        }
        store.retain(|_, cookies| !cookies.is_empty());
        if removed > 0 {
            self.persist(&store);
        }
        removed
    }

    pub fn clear_all(&self) {
        let mut store = self.lock();
        store.clear();
        self.persist(&store);
    }

    /// Remove every cookie stored under `domain`. Returns whether any existed.
    pub fn clear_domain(&self, domain: &str) -> bool {
        let mut store = self.lock();
        let removed = store.remove(domain.trim_start_matches('.')).is_some();
        if removed {
            self.persist(&store);
        }
        removed
    }

    /// Domains with at least one stored cookie, sorted.
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.lock().keys().cloned().collect();
        domains.sort();
        domains
    }

    /// Stored cookie count per domain.
    pub fn cookie_counts(&self) -> HashMap<String, usize> {
        self.lock()
            .iter()
            .map(|(domain, cookies)| (domain.clone(), cookies.len()))
            .collect()
    }

    /// Stored record, expired or not.
    pub fn get(&self, domain: &str, name: &str) -> Option<CookieRecord> {
        self.lock().get(domain)?.get(name).cloned()
    }
}
