//! Request descriptors and body preparation.

use std::path::PathBuf;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use thiserror::Error;
use url::Url;
use url::form_urlencoded;

use crate::cancel::CancelToken;
use crate::modules::multipart::{self, MultipartError};
use crate::modules::timing::ActionType;

/// Per-call options plus the continuation state of a request chain.
///
/// Callers normally only touch the builder methods. The counters are carried
/// from one attempt to the next by the engine and may be preset to resume a
/// chain.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Attempt budget; the engine default applies when unset.
    pub max_retries: Option<u32>,
    pub retry_count: u32,
    pub redirect_count: u32,
    pub bypass_attempted: bool,
    /// Always used when set.
    pub proxy_url: Option<String>,
    /// Encode bodies as JSON instead of URL-encoded forms.
    pub json: bool,
    /// Page the caller navigated from; becomes the `Referer`.
    pub previous_url: Option<Url>,
    pub previous_action: ActionType,
    /// Win over profile and cookie headers.
    pub headers: HeaderMap,
    pub cancel: Option<CancelToken>,
    pub(crate) skip_compression: bool,
    pub(crate) proxy_retry: bool,
    pub(crate) preflight_applied: bool,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy_url = Some(proxy.into());
        self
    }

    pub fn as_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_previous(mut self, url: Url, action: ActionType) -> Self {
        self.previous_url = Some(url);
        self.previous_action = action;
        self
    }

    pub fn with_action(mut self, action: ActionType) -> Self {
        self.previous_action = action;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Whether a bypass plan already ran in this chain.
    pub fn bypass_attempted(&self) -> bool {
        self.bypass_attempted
    }

    pub(crate) fn cancel_token(&self) -> CancelToken {
        self.cancel.clone().unwrap_or_default()
    }
}

/// Form fields and files to upload.
#[derive(Debug, Clone, Default)]
pub struct FormData {
    pub fields: Vec<(String, String)>,
    pub files: Vec<(String, PathBuf)>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn file(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.files.push((name.into(), path.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    /// Sent verbatim.
    Raw(String),
    Form(FormData),
    Json(serde_json::Value),
}

impl From<FormData> for RequestBody {
    fn from(form: FormData) -> Self {
        RequestBody::Form(form)
    }
}

impl From<serde_json::Value> for RequestBody {
    fn from(value: serde_json::Value) -> Self {
        RequestBody::Json(value)
    }
}

impl From<String> for RequestBody {
    fn from(raw: String) -> Self {
        RequestBody::Raw(raw)
    }
}

impl From<&str> for RequestBody {
    fn from(raw: &str) -> Self {
        RequestBody::Raw(raw.to_string())
    }
}

#[derive(Debug, Error)]
pub enum BodyError {
    #[error(transparent)]
    Multipart(#[from] MultipartError),
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encoded body ready for the wire.
#[derive(Debug, Clone)]
pub struct PreparedBody {
    pub content_type: String,
    pub bytes: Bytes,
}

pub(crate) fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Encode `body` for `method`.
///
/// Only POST, PUT and PATCH carry a body. File fields force multipart; JSON
/// is chosen by the `json` flag or a [`RequestBody::Json`] value; everything
/// else is URL-encoded.
pub fn prepare_body(
    method: &Method,
    body: Option<&RequestBody>,
    json: bool,
) -> Result<Option<PreparedBody>, BodyError> {
    let Some(body) = body else {
        return Ok(None);
    };
    if !carries_body(method) {
        log::debug!("ignoring body on {method} request");
        return Ok(None);
    }

    let prepared = match body {
        RequestBody::Form(form) if !form.files.is_empty() => {
            let encoded = multipart::encode(&form.fields, &form.files)?;
            PreparedBody {
                content_type: encoded.content_type(),
                bytes: encoded.bytes,
            }
        }
        RequestBody::Form(form) if json => {
            let object: serde_json::Map<String, serde_json::Value> = form
                .fields
                .iter()
                .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
                .collect();
            json_body(&serde_json::Value::Object(object))?
        }
        RequestBody::Form(form) => {
            let encoded = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(form.fields.iter())
                .finish();
            PreparedBody {
                content_type: "application/x-www-form-urlencoded".into(),
                bytes: Bytes::from(encoded),
            }
        }
        RequestBody::Json(value) => json_body(value)?,
        RequestBody::Raw(raw) => PreparedBody {
            content_type: if json {
                "application/json".into()
            } else {
                "application/x-www-form-urlencoded".into()
            },
            bytes: Bytes::from(raw.clone()),
        },
    };
    Ok(Some(prepared))
}

fn json_body(value: &serde_json::Value) -> Result<PreparedBody, BodyError> {
    Ok(PreparedBody {
        content_type: "application/json".into(),
        bytes: Bytes::from(serde_json::to_vec(value)?),
    })
}
