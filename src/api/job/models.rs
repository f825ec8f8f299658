use serde::Deserialize;
use serde_json::Value;
use validator::Validate;

use crate::store::{JobSpec, PrivacyStatus};

/// One entry of an upload batch, read from the browser's JSON after the
/// batch passed validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadItem {
    pub source_url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub privacy_status: Option<PrivacyStatus>,
}

fn text(item: &Value, key: &str) -> Option<String> {
    item.get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

impl UploadItem {
    /// Read the browser field names. Optional fields of the wrong type count as absent.
    pub fn from_json(item: &Value) -> Self {
        Self {
            source_url: text(item, "sourceUrl")
                .map(|url| url.trim().to_string())
                .unwrap_or_default(),
            title: text(item, "title"),
            description: text(item, "description"),
            tags: item
                .get("tags")
                .and_then(Value::as_array)
                .map(|tags| {
                    tags.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            privacy_status: text(item, "privacyStatus").map(PrivacyStatus::new),
        }
    }

    pub fn into_spec(self) -> JobSpec {
        JobSpec {
            source_url: self.source_url,
            title: self.title,
            description: self.description,
            tags: self.tags,
            privacy_status: self.privacy_status.unwrap_or_default(),
        }
    }
}

/// Body of `POST /api/upload`
///
/// `items` stays raw JSON so batch checks run in order (shape, size, then
/// each item) before any item is interpreted.
#[derive(Deserialize, Debug, Validate)]
pub struct UploadRequest {
    #[serde(default)]
    pub items: Value,
}
