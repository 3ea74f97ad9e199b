//! `multipart/form-data` encoding for uploads.

use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use rand::Rng;
use rand::distributions::Alphanumeric;
use thiserror::Error;

const CRLF: &[u8] = b"\r\n";
const BOUNDARY_PREFIX: &str = "----WebKitFormBoundary";

const MIME_TABLE: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
    ("pdf", "application/pdf"),
    ("txt", "text/plain"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("zip", "application/zip"),
    ("doc", "application/msword"),
    (
        "docx",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    ),
    ("xls", "application/vnd.ms-excel"),
    (
        "xlsx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    ),
    ("ppt", "application/vnd.ms-powerpoint"),
    (
        "pptx",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    ),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
    ("wav", "audio/wav"),
    ("ogg", "audio/ogg"),
    ("webm", "video/webm"),
];

#[derive(Debug, Error)]
pub enum MultipartError {
    #[error("failed to read upload {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Encoded form ready to be sent.
#[derive(Debug, Clone)]
pub struct MultipartBody {
    pub boundary: String,
    pub bytes: Bytes,
}

impl MultipartBody {
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }
}

/// MIME type for an upload, by file extension.
pub fn mime_for_path(path: &Path) -> &'static str {
    let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
        return "application/octet-stream";
    };
    let ext = ext.to_ascii_lowercase();
    MIME_TABLE
        .iter()
        .find(|(candidate, _)| *candidate == ext)
        .map(|(_, mime)| *mime)
        .unwrap_or("application/octet-stream")
}

fn generate_boundary() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("{BOUNDARY_PREFIX}{suffix}")
}

fn escape_quotes(value: &str) -> String {
    value.replace('"', "\\\"")
}

/// Encode text fields followed by file fields. Files are read fully.
pub fn encode(
    fields: &[(String, String)],
    files: &[(String, PathBuf)],
) -> Result<MultipartBody, MultipartError> {
    let boundary = generate_boundary();
    let mut output = Vec::new();

    for (name, value) in fields {
        open_part(&mut output, &boundary);
        output.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"",
                escape_quotes(name)
            )
            .as_bytes(),
        );
        output.extend_from_slice(CRLF);
        output.extend_from_slice(CRLF);
        output.extend_from_slice(value.as_bytes());
        output.extend_from_slice(CRLF);
    }

    for (name, path) in files {
        let content = fs::read(path).map_err(|source| MultipartError::Read {
            path: path.clone(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        open_part(&mut output, &boundary);
        output.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"",
                escape_quotes(name),
                escape_quotes(&file_name)
            )
            .as_bytes(),
        );
        output.extend_from_slice(CRLF);
        output.extend_from_slice(format!("Content-Type: {}", mime_for_path(path)).as_bytes());
        output.extend_from_slice(CRLF);
        output.extend_from_slice(CRLF);
        output.extend_from_slice(&content);
        output.extend_from_slice(CRLF);
    }

    output.extend_from_slice(b"--");
    output.extend_from_slice(boundary.as_bytes());
    output.extend_from_slice(b"--");
    output.extend_from_slice(CRLF);

    Ok(MultipartBody {
        boundary,
        bytes: Bytes::from(output),
    })
}

fn open_part(output: &mut Vec<u8>, boundary: &str) {
    output.extend_from_slice(b"--");
    output.extend_from_slice(boundary.as_bytes());
    output.extend_from_slice(CRLF);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_fields_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("report.pdf");
        std::fs::write(&report, b"%PDF-1.4 body").unwrap();

        let body = encode(
            &[("title".to_string(), "Quarterly".to_string())],
            &[("upload".to_string(), report)],
        )
        .unwrap();
        let text = String::from_utf8_lossy(&body.bytes);
        let boundary = &body.boundary;

        assert!(boundary.starts_with("----WebKitFormBoundary"));
        assert!(text.starts_with(&format!("--{boundary}\r\n")));
        assert!(text.contains(
            "Content-Disposition: form-data; name=\"title\"\r\n\r\nQuarterly\r\n"
        ));
        assert!(text.contains(
            "Content-Disposition: form-data; name=\"upload\"; filename=\"report.pdf\"\r\nContent-Type: application/pdf\r\n\r\n%PDF-1.4 body\r\n"
        ));
        assert!(text.ends_with(&format!("--{boundary}--\r\n")));
        assert_eq!(text.matches(&format!("--{boundary}\r\n")).count(), 2);
    }

    #[test]
    fn boundaries_are_random() {
        let first = encode(&[], &[]).unwrap();
        let second = encode(&[], &[]).unwrap();
        assert_ne!(first.boundary, second.boundary);
        assert_eq!(
            first.content_type(),
            format!("multipart/form-data; boundary={}", first.boundary)
        );
    }

    #[test]
    fn unknown_extensions_default_to_octet_stream() {
        assert_eq!(mime_for_path(Path::new("a/b.bin")), "application/octet-stream");
        assert_eq!(mime_for_path(Path::new("noext")), "application/octet-stream");
        assert_eq!(mime_for_path(Path::new("photo.JPG")), "image/jpeg");
    }

    #[test]
    fn missing_file_is_reported() {
        let err = encode(&[], &[("f".into(), PathBuf::from("/definitely/missing.txt"))])
            .unwrap_err();
        assert!(matches!(err, MultipartError::Read { .. }));
    }
}
