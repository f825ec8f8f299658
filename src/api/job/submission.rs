//! Batch shape checks run before any job exists.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::api::job::models::UploadItem;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("items must be a non-empty array.")]
    Empty,

    #[error("You can upload up to {max} items in one request.")]
    TooMany { max: usize, got: usize },

    #[error("Each item needs a valid sourceUrl.")]
    MissingSourceUrl { index: usize },

    #[error("Invalid URL: {url}")]
    InvalidUrl { index: usize, url: String },
}

impl SubmissionError {
    /// Position of the offending item, when the error is about one item.
    pub fn index(&self) -> Option<usize> {
        match self {
            SubmissionError::MissingSourceUrl { index } | SubmissionError::InvalidUrl { index, .. } => {
                Some(*index)
            }
            SubmissionError::Empty | SubmissionError::TooMany { .. } => None,
        }
    }
}

/// Scheme plus a non-empty host. The rest of the URL is left to the fetcher.
fn http_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)^https?://[^\s/?#]+").expect("valid url pattern"))
}

/// Check a raw batch, stopping at the first violation, and read its items.
///
/// Order of checks: `items` is a non-empty array, it holds at most
/// `max_batch` entries, then each entry has a string `sourceUrl` that is an
/// http(s) URL, in submission order. Other item fields are never checked.
pub fn validate_items(items: &Value, max_batch: usize) -> Result<Vec<UploadItem>, SubmissionError> {
    let items = match items.as_array() {
        Some(items) if !items.is_empty() => items,
        _ => return Err(SubmissionError::Empty),
    };
    if items.len() > max_batch {
        return Err(SubmissionError::TooMany {
            max: max_batch,
            got: items.len(),
        });
    }

    for (index, item) in items.iter().enumerate() {
        let url = item
            .get("sourceUrl")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or(SubmissionError::MissingSourceUrl { index })?;

        if !http_url_pattern().is_match(url) {
            return Err(SubmissionError::InvalidUrl {
                index,
                url: url.to_string(),
            });
        }
    }

    Ok(items.iter().map(UploadItem::from_json).collect())
}
