use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::store::{CredentialBundle, PrivacyStatus, RedirectContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub privacy_status: PrivacyStatus,
}

/// Everything the platform needs for one upload.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub credential: CredentialBundle,
    pub redirect: RedirectContext,
    pub metadata: VideoMetadata,
    pub media_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub external_id: String,
}

#[derive(Debug, Error)]
pub enum PublishError {
    /// The platform answered with an error. `message` is the platform's own
    /// text when it sent one, otherwise a generic description.
    #[error("{message}")]
    Rejected {
        status: u16,
        reason: Option<String>,
        message: String,
    },

    #[error("Upload request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to read staged media {}: {source}", path.display())]
    Media {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected response from the video platform: {0}")]
    InvalidResponse(String),
}

/// External video platform.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Display name used in job progress messages.
    fn platform(&self) -> &str;

    /// Upload once. No retries.
    async fn publish(&self, request: PublishRequest) -> Result<Published, PublishError>;

    /// Public URL for an uploaded item.
    fn canonical_url(&self, external_id: &str) -> String;
}
