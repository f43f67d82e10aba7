use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

use crate::client::MediaPayload;
use crate::error::{SessionError, require_non_empty};

/// Phone numbers become chat ids by appending this suffix.
pub const CHAT_SUFFIX: &str = "@c.us";

const DEFAULT_INLINE_MIME: &str = "image/jpeg";
const DEFAULT_INLINE_FILENAME: &str = "image.jpg";
const FALLBACK_MIME: &str = "application/octet-stream";

/// Upper bound for media the gateway loads itself (URL and file sources).
pub const DEFAULT_MAX_MEDIA_BYTES: usize = 64 * 1024 * 1024;

pub fn chat_id(phone: &str) -> String {
    format!("{phone}{CHAT_SUFFIX}")
}

pub fn mime_for_path(path: impl AsRef<Path>) -> &'static str {
    let ext = path
        .as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("mp4") => "video/mp4",
        Some("mp3") => "audio/mpeg",
        _ => FALLBACK_MIME,
    }
}

/// A media send as callers describe it. Exactly one source is used, picked
/// in the order `base64`, `url`, `file_path`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaRequest {
    pub phone: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub base64: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "filePath")]
    pub file_path: Option<String>,
    #[serde(default, alias = "mimeType")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Inline(MediaPayload),
    Url(String),
    File(PathBuf),
}

impl MediaRequest {
    /// Picks and checks the source without touching the network or disk.
    pub fn source(&self) -> Result<MediaSource, SessionError> {
        if let Some(encoded) = present(&self.base64) {
            let (data_url_mime, body) = split_data_url(encoded);
            let data = STANDARD
                .decode(body.split_whitespace().collect::<String>())
                .map_err(|err| SessionError::Validation(format!("invalid base64 media: {err}")))?;
            let mime_type = present(&self.mime_type)
                .or(data_url_mime)
                .unwrap_or(DEFAULT_INLINE_MIME)
                .to_string();
            let filename = present(&self.filename)
                .unwrap_or(DEFAULT_INLINE_FILENAME)
                .to_string();
            return Ok(MediaSource::Inline(MediaPayload {
                mime_type,
                data,
                filename: Some(filename),
            }));
        }
        if let Some(url) = present(&self.url) {
            let parsed = reqwest::Url::parse(url)
                .map_err(|err| SessionError::Validation(format!("invalid media url: {err}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(SessionError::Validation(format!(
                    "unsupported media url scheme: {}",
                    parsed.scheme()
                )));
            }
            return Ok(MediaSource::Url(url.to_string()));
        }
        if let Some(path) = present(&self.file_path) {
            return Ok(MediaSource::File(PathBuf::from(path)));
        }
        Err(SessionError::MissingMediaSource)
    }

    pub fn validate(&self) -> Result<MediaSource, SessionError> {
        require_non_empty("phone", &self.phone)?;
        self.source()
    }
}

/// Loads the bytes behind a source, refusing anything over `max_bytes`.
/// Failures here count as send failures.
pub async fn resolve(
    source: MediaSource,
    http: &reqwest::Client,
    max_bytes: usize,
) -> Result<MediaPayload, SessionError> {
    match source {
        MediaSource::Inline(payload) => Ok(payload),
        MediaSource::Url(url) => download(&url, http, max_bytes).await,
        MediaSource::File(path) => {
            let read_failed = |err: std::io::Error| {
                SessionError::SendFailure(format!("reading {}: {err}", path.display()))
            };
            let size = tokio::fs::metadata(&path).await.map_err(read_failed)?.len();
            if size > max_bytes as u64 {
                return Err(too_large(&path.display().to_string(), max_bytes));
            }
            let data = tokio::fs::read(&path).await.map_err(read_failed)?;
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
            Ok(MediaPayload {
                mime_type: mime_for_path(&path).to_string(),
                data,
                filename,
            })
        }
    }
}

async fn download(
    url: &str,
    http: &reqwest::Client,
    max_bytes: usize,
) -> Result<MediaPayload, SessionError> {
    let fail = |err: reqwest::Error| SessionError::SendFailure(format!("fetching {url}: {err}"));
    let mut response = http
        .get(url)
        .send()
        .await
        .and_then(|res| res.error_for_status())
        .map_err(fail)?;
    let filename = response
        .url()
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(str::to_string);
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    if response
        .content_length()
        .is_some_and(|len| len > max_bytes as u64)
    {
        return Err(too_large(url, max_bytes));
    }
    // Content-Length may be absent or wrong; count what actually arrives.
    let mut data = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(fail)? {
        if data.len() + chunk.len() > max_bytes {
            return Err(too_large(url, max_bytes));
        }
        data.extend_from_slice(&chunk);
    }
    let mime_type = content_type.unwrap_or_else(|| {
        filename
            .as_deref()
            .map(mime_for_path)
            .unwrap_or(FALLBACK_MIME)
            .to_string()
    });
    Ok(MediaPayload {
        mime_type,
        data,
        filename,
    })
}

fn too_large(source: &str, max_bytes: usize) -> SessionError {
    SessionError::SendFailure(format!("{source} exceeds the {max_bytes} byte media limit"))
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Drops everything up to the first comma. The declared mime is only read
/// from a `data:<mime>;base64,` header.
fn split_data_url(value: &str) -> (Option<&str>, &str) {
    let Some((header, body)) = value.split_once(',') else {
        return (None, value);
    };
    let mime = header
        .strip_prefix("data:")
        .and_then(|rest| rest.split(';').next())
        .filter(|m| !m.is_empty());
    (mime, body)
}
