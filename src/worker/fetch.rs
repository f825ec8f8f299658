//! Downloading source files into the staging directory.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use regex::Regex;
use reqwest::header::{CONTENT_DISPOSITION, USER_AGENT};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

const SHARE_HOST_MARKER: &str = "drive.google.com";
const DIRECT_DOWNLOAD_PATH: &str = "/uc";
const BROWSER_USER_AGENT: &str = "Mozilla/5.0";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Download from {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Download from {url} failed with status {status}")]
    Status { url: String, status: StatusCode },

    #[error("Download from {url} was interrupted: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to write staging file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of a completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSource {
    /// Filename suggested by the response, or derived from the URL path.
    pub filename: Option<String>,
    pub bytes_written: u64,
}

/// Downloads an already-resolved URL into a local file.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<FetchedSource, FetchError>;
}

fn share_link_patterns() -> &'static [Regex; 2] {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"/d/([A-Za-z0-9_-]+)").expect("valid path id pattern"),
            Regex::new(r"[?&]id=([A-Za-z0-9_-]+)").expect("valid query id pattern"),
        ]
    })
}

/// Rewrite cloud-storage share links to their direct-download form.
///
/// A Google Drive link carrying a file id in its path (`/file/d/{id}/view`)
/// or query (`open?id={id}`) becomes `uc?export=download&id={id}`. Anything
/// else is returned unchanged.
pub fn direct_download_url(url: &str) -> Cow<'_, str> {
    if !url.contains(SHARE_HOST_MARKER) {
        return Cow::Borrowed(url);
    }

    share_link_patterns()
        .iter()
        .find_map(|pattern| pattern.captures(url))
        .and_then(|captures| captures.get(1))
        .map(|file_id| {
            Cow::Owned(format!(
                "https://{}{}?export=download&id={}",
                SHARE_HOST_MARKER,
                DIRECT_DOWNLOAD_PATH,
                file_id.as_str()
            ))
        })
        .unwrap_or(Cow::Borrowed(url))
}

fn disposition_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?i)filename\*=UTF-8''([^;]+)|filename="?([^";]+)"?"#)
            .expect("valid content-disposition pattern")
    })
}

/// Extract the filename from a `Content-Disposition` header value.
pub fn filename_from_disposition(header: &str) -> Option<String> {
    let captures = disposition_pattern().captures(header)?;
    let raw = captures.get(1).or_else(|| captures.get(2))?.as_str().trim();
    if raw.is_empty() {
        return None;
    }

    let decoded = urlencoding::decode(raw)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| raw.to_string());
    Some(decoded)
}

/// Last non-empty path segment of `url`, percent-decoded.
///
/// The Drive direct-download endpoint names no file, so it yields `None`.
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if parsed.host_str() == Some(SHARE_HOST_MARKER) && parsed.path() == DIRECT_DOWNLOAD_PATH {
        return None;
    }
    let segment = parsed.path_segments()?.rev().find(|s| !s.is_empty())?;
    let decoded = urlencoding::decode(segment)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| segment.to_string());
    Some(decoded)
}

/// [`RemoteFetcher`] over plain HTTP(S), streaming the body straight to disk.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(connect_timeout: Option<Duration>) -> Result<Self, reqwest::Error> {
        let mut builder = Client::builder();
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<FetchedSource, FetchError> {
        debug!("Requesting {}", url);

        let response = self
            .client
            .get(url)
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }

        let filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(filename_from_disposition)
            .or_else(|| filename_from_url(url));

        let io_error = |source| FetchError::Io {
            path: destination.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(io_error)?;

        let mut bytes_written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| FetchError::Body {
                url: url.to_string(),
                source,
            })?;
            file.write_all(&chunk).await.map_err(io_error)?;
            bytes_written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_error)?;

        info!(
            "Downloaded {} bytes from {} to {}",
            bytes_written,
            url,
            destination.display()
        );

        Ok(FetchedSource {
            filename,
            bytes_written,
        })
    }
}
