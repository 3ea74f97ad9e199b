//! Response body decoding.
//!
//! Covers the three steps between raw socket bytes and caller-visible text:
//! classifying binary payloads, undoing `Content-Encoding` while the body is
//! still streaming, and turning the resulting buffer into a `String` using the
//! declared (or sniffed) charset with a fallback chain.

use std::borrow::Cow;
use std::io::{Cursor, Read, Write};

use encoding_rs::{EUC_JP, EUC_KR, Encoding, GBK, ISO_8859_15, SHIFT_JIS, UTF_8, WINDOWS_1252};
use flate2::write::{DeflateDecoder, GzDecoder, ZlibDecoder};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use thiserror::Error;

/// Charsets tried, in order, when the declared charset cannot decode a body.
pub const FALLBACK_CHARSETS: &[&str] = &[
    "utf-8",
    "windows-1252",
    "iso-8859-1",
    "iso-8859-15",
    "gbk",
    "gb2312",
    "shift-jis",
    "euc-jp",
    "euc-kr",
];

const DEFAULT_CHARSET: &str = "utf-8";

// Meta declarations live in <head>; no need to scan a whole document.
const SNIFF_LIMIT: usize = 16 * 1024;

const BINARY_TYPE_MARKERS: &[&str] = &[
    "image/",
    "audio/",
    "video/",
    "font/",
    "application/octet-stream",
    "application/pdf",
    "application/zip",
    "application/x-rar-compressed",
    "application/vnd.ms-",
    "application/msword",
    "application/vnd.openxmlformats-officedocument",
    "application/x-msdownload",
    "application/x-binary",
    "application/xlsx",
    "application/x-font",
];

const EXTENSION_TABLE: &[(&str, &str)] = &[
    ("image/jpeg", "jpg"),
    ("image/jpg", "jpg"),
    ("image/png", "png"),
    ("image/gif", "gif"),
    ("image/svg+xml", "svg"),
    ("image/webp", "webp"),
    ("image/bmp", "bmp"),
    ("image/tiff", "tiff"),
    ("image/x-icon", "ico"),
    ("audio/mpeg", "mp3"),
    ("audio/mp3", "mp3"),
    ("audio/wav", "wav"),
    ("audio/ogg", "ogg"),
    ("audio/aac", "aac"),
    ("audio/flac", "flac"),
    ("video/mp4", "mp4"),
    ("video/mpeg", "mpeg"),
    ("video/webm", "webm"),
    ("video/quicktime", "mov"),
    ("video/x-msvideo", "avi"),
    ("video/x-matroska", "mkv"),
    ("application/pdf", "pdf"),
    ("application/zip", "zip"),
    ("application/x-rar-compressed", "rar"),
    ("application/x-tar", "tar"),
    ("application/gzip", "gz"),
    ("application/msword", "doc"),
    (
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "docx",
    ),
    ("application/vnd.ms-excel", "xls"),
    (
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "xlsx",
    ),
    ("application/vnd.ms-powerpoint", "ppt"),
    (
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "pptx",
    ),
];

static HEADER_CHARSET_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"charset\s*=\s*([^;]+)"#)
        .case_insensitive(true)
        .build()
        .expect("invalid charset regex")
});

static META_CHARSET_RE: Lazy<regex::bytes::Regex> = Lazy::new(|| {
    regex::bytes::RegexBuilder::new(r#"<meta[^>]+charset\s*=\s*["']?([^"'>\s;/]+)"#)
        .case_insensitive(true)
        .build()
        .expect("invalid meta charset regex")
});

/// Failures raised while undoing a `Content-Encoding`.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{coding} stream error: {source}")]
    Stream {
        coding: ContentCoding,
        source: std::io::Error,
    },
}

/// Map a charset label onto one of [`FALLBACK_CHARSETS`].
pub fn normalize_charset(label: &str) -> Option<&'static str> {
    let label = label
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .to_ascii_lowercase();
    let name = match label.as_str() {
        "utf-8" | "utf8" | "unicode-1-1-utf-8" => "utf-8",
        "windows-1252" | "cp1252" | "x-cp1252" => "windows-1252",
        "iso-8859-1" | "iso8859-1" | "iso_8859-1" | "latin1" | "latin-1" | "l1" | "ascii"
        | "us-ascii" => "iso-8859-1",
        "iso-8859-15" | "iso8859-15" | "iso_8859-15" | "latin9" | "latin-9" | "l9" => {
            "iso-8859-15"
        }
        "gbk" | "cp936" | "x-gbk" => "gbk",
        "gb2312" | "gb_2312" | "gb_2312-80" | "csgb2312" => "gb2312",
        "shift-jis" | "shift_jis" | "sjis" | "ms_kanji" | "x-sjis" | "windows-31j"
        | "csshiftjis" => "shift-jis",
        "euc-jp" | "eucjp" | "x-euc-jp" => "euc-jp",
        "euc-kr" | "euckr" | "ks_c_5601-1987" | "windows-949" => "euc-kr",
        _ => return None,
    };
    Some(name)
}

/// Charset declared by a `Content-Type` header, if any and if supported.
pub fn declared_charset(content_type: &str) -> Option<&'static str> {
    let caps = HEADER_CHARSET_RE.captures(content_type)?;
    normalize_charset(caps.get(1)?.as_str())
}

/// Charset to decode a body with, from its `Content-Type` alone.
pub fn detect_charset(content_type: &str) -> &'static str {
    declared_charset(content_type).unwrap_or(DEFAULT_CHARSET)
}

/// Scan the head of an HTML document for `<meta charset=...>` or an
/// `http-equiv` content-type declaration. Works on raw bytes.
pub fn sniff_html_charset(buffer: &[u8]) -> Option<&'static str> {
    let window = &buffer[..buffer.len().min(SNIFF_LIMIT)];
    let caps = META_CHARSET_RE.captures(window)?;
    let label = std::str::from_utf8(caps.get(1)?.as_bytes()).ok()?;
    normalize_charset(label)
}

fn encoding_for(name: &str) -> Option<&'static Encoding> {
    match name {
        "utf-8" => Some(UTF_8),
        // WHATWG decodes latin1 labels as windows-1252.
        "windows-1252" | "iso-8859-1" => Some(WINDOWS_1252),
        "iso-8859-15" => Some(ISO_8859_15),
        "gbk" | "gb2312" => Some(GBK),
        "shift-jis" => Some(SHIFT_JIS),
        "euc-jp" => Some(EUC_JP),
        "euc-kr" => Some(EUC_KR),
        _ => None,
    }
}

fn decode_strict(buffer: &[u8], name: &str) -> Option<String> {
    let encoding = encoding_for(name)?;
    let bytes = if encoding == UTF_8 {
        buffer.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(buffer)
    } else {
        buffer
    };
    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(Cow::into_owned)
}

/// Decode `buffer` as `charset`, walking [`FALLBACK_CHARSETS`] when the
/// charset is unsupported or the bytes are malformed for it.
pub fn decode(buffer: &[u8], charset: &str) -> String {
    if buffer.is_empty() {
        return String::new();
    }

    let requested = normalize_charset(charset);
    if let Some(text) = requested.and_then(|name| decode_strict(buffer, name)) {
        return text;
    }

    log::debug!("charset {charset} could not decode body, trying fallbacks");
    for candidate in FALLBACK_CHARSETS {
        if requested == Some(*candidate) {
            continue;
        }
        if let Some(text) = decode_strict(buffer, candidate) {
            log::debug!("decoded body with fallback charset {candidate}");
            return text;
        }
    }

    String::from_utf8_lossy(buffer).into_owned()
}

/// Decode a text body using its `Content-Type`, sniffing HTML meta tags when
/// the header does not declare a charset.
pub fn decode_body(buffer: &[u8], content_type: &str) -> String {
    let charset = match declared_charset(content_type) {
        Some(charset) => charset,
        None if content_type.is_empty() || content_type.contains("html") => {
            sniff_html_charset(buffer).unwrap_or(DEFAULT_CHARSET)
        }
        None => DEFAULT_CHARSET,
    };
    decode(buffer, charset)
}

/// Media type without parameters, lower-cased.
pub fn base_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Whether a `Content-Type` describes content that must not be text-decoded.
pub fn is_binary_content_type(content_type: &str) -> bool {
    if content_type.is_empty() {
        return false;
    }
    let lowered = content_type.to_ascii_lowercase();
    BINARY_TYPE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Suggested file extension for a downloaded body.
pub fn file_extension_for(content_type: &str) -> String {
    let base = base_content_type(content_type);
    if base.is_empty() {
        return String::new();
    }
    if let Some((_, ext)) = EXTENSION_TABLE.iter().find(|(mime, _)| *mime == base) {
        return (*ext).to_string();
    }
    match base.split_once('/') {
        Some((_, subtype)) if !subtype.is_empty() => subtype.to_string(),
        _ => String::new(),
    }
}

/// Supported `Content-Encoding` schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Gzip,
    Deflate,
    Brotli,
}

impl ContentCoding {
    /// Pick a decoder for a `Content-Encoding` value; `None` means unknown.
    ///
    /// Only a single coding is understood. Stacked codings such as
    /// `gzip, br` count as unknown so the body is kept as received.
    pub fn from_header(value: &str) -> Option<Self> {
        let mut codings = value
            .split(',')
            .map(|token| token.trim().to_ascii_lowercase())
            .filter(|token| !token.is_empty() && token != "identity");
        let coding = match codings.next()?.as_str() {
            "gzip" | "x-gzip" => Self::Gzip,
            "deflate" => Self::Deflate,
            "br" => Self::Brotli,
            _ => return None,
        };
        if codings.next().is_some() {
            return None;
        }
        Some(coding)
    }
}

impl std::fmt::Display for ContentCoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContentCoding::Gzip => "gzip",
            ContentCoding::Deflate => "deflate",
            ContentCoding::Brotli => "br",
        };
        f.write_str(name)
    }
}

enum DecoderState {
    Gzip(GzDecoder<Vec<u8>>),
    // zlib-wrapped vs raw deflate is decided from the first bytes.
    DeflatePending(Vec<u8>),
    Zlib(ZlibDecoder<Vec<u8>>),
    RawDeflate(DeflateDecoder<Vec<u8>>),
    Brotli(Vec<u8>),
}

/// Incremental decompressor fed with body chunks as they arrive.
pub struct StreamDecoder {
    coding: ContentCoding,
    state: DecoderState,
}

impl StreamDecoder {
    pub fn new(coding: ContentCoding) -> Self {
        let state = match coding {
            ContentCoding::Gzip => DecoderState::Gzip(GzDecoder::new(Vec::new())),
            ContentCoding::Deflate => DecoderState::DeflatePending(Vec::new()),
            ContentCoding::Brotli => DecoderState::Brotli(Vec::new()),
        };
        Self { coding, state }
    }

    pub fn coding(&self) -> ContentCoding {
        self.coding
    }

    /// Push the next compressed chunk through the decoder.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), DecodeError> {
        let coding = self.coding;
        let wrap = |source| DecodeError::Stream { coding, source };

        match &mut self.state {
            DecoderState::Gzip(decoder) => decoder.write_all(chunk).map_err(wrap),
            DecoderState::Zlib(decoder) => decoder.write_all(chunk).map_err(wrap),
            DecoderState::RawDeflate(decoder) => decoder.write_all(chunk).map_err(wrap),
            DecoderState::Brotli(buffer) => {
                buffer.extend_from_slice(chunk);
                Ok(())
            }
            DecoderState::DeflatePending(head) => {
                head.extend_from_slice(chunk);
                if head.len() < 2 {
                    return Ok(());
                }
                let buffered = std::mem::take(head);
                self.state = if looks_like_zlib(&buffered) {
                    DecoderState::Zlib(ZlibDecoder::new(Vec::new()))
                } else {
                    DecoderState::RawDeflate(DeflateDecoder::new(Vec::new()))
                };
                self.feed(&buffered)
            }
        }
    }

    /// Flush the decoder and return the decompressed bytes.
    pub fn finish(self) -> Result<Vec<u8>, DecodeError> {
        let coding = self.coding;
        let wrap = |source| DecodeError::Stream { coding, source };

        match self.state {
            DecoderState::Gzip(decoder) => decoder.finish().map_err(wrap),
            DecoderState::Zlib(decoder) => decoder.finish().map_err(wrap),
            DecoderState::RawDeflate(decoder) => decoder.finish().map_err(wrap),
            DecoderState::DeflatePending(head) => {
                if head.is_empty() {
                    return Ok(Vec::new());
                }
                let mut decoder = DeflateDecoder::new(Vec::new());
                decoder.write_all(&head).map_err(wrap)?;
                decoder.finish().map_err(wrap)
            }
            DecoderState::Brotli(buffer) => {
                let mut decoder = brotli::Decompressor::new(Cursor::new(buffer), 4096);
                let mut decoded = Vec::new();
                decoder.read_to_end(&mut decoded).map_err(wrap)?;
                Ok(decoded)
            }
        }
    }
}

fn looks_like_zlib(head: &[u8]) -> bool {
    match head {
        [cmf, flg, ..] => cmf & 0x0F == 8 && ((u16::from(*cmf) << 8) | u16::from(*flg)) % 31 == 0,
        _ => false,
    }
}
