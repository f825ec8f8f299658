//! YouTube Data API v3 upload client.

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Body, Client, Response};
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::worker::publish::{PublishError, PublishRequest, Published, Publisher};

const UPLOAD_ENDPOINT: &str = "https://www.googleapis.com/upload/youtube/v3/videos";
const MEDIA_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: Option<ApiErrorBody>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
    #[serde(default)]
    errors: Vec<ApiErrorItem>,
}

#[derive(Deserialize)]
struct ApiErrorItem {
    reason: Option<String>,
}

#[derive(Deserialize)]
struct VideoResource {
    id: String,
}

/// Turn an error response body into a [`PublishError::Rejected`].
///
/// Google APIs answer `{"error": {"code", "message", "errors": [{"reason"}]}}`;
/// any part of that may be missing.
pub fn rejection_from_body(status: u16, body: &str) -> PublishError {
    let error = serde_json::from_str::<ApiErrorEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.error);

    let reason = error
        .as_ref()
        .and_then(|e| e.errors.first())
        .and_then(|item| item.reason.clone());
    let message = error
        .and_then(|e| e.message)
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| format!("Upload rejected by YouTube (HTTP {})", status));

    PublishError::Rejected {
        status,
        reason,
        message,
    }
}

async fn ensure_success(response: Response) -> Result<Response, PublishError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(rejection_from_body(status.as_u16(), &body))
}

/// [`Publisher`] using the resumable upload protocol: one request opens an
/// upload session with the video metadata, a second streams the file to it.
pub struct YouTubePublisher {
    client: Client,
    endpoint: String,
}

impl YouTubePublisher {
    pub fn new(client: Client) -> Self {
        Self::with_endpoint(client, UPLOAD_ENDPOINT)
    }

    pub fn with_endpoint(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Publisher for YouTubePublisher {
    fn platform(&self) -> &str {
        "YouTube"
    }

    async fn publish(&self, request: PublishRequest) -> Result<Published, PublishError> {
        let PublishRequest {
            credential,
            redirect,
            metadata,
            media_path,
        } = request;

        let media_error = |source| PublishError::Media {
            path: media_path.clone(),
            source,
        };
        let file = tokio::fs::File::open(&media_path).await.map_err(media_error)?;
        let length = file.metadata().await.map_err(media_error)?.len();

        debug!(
            "Opening upload session for {} ({} bytes, redirect {})",
            media_path.display(),
            length,
            redirect.redirect_uri
        );

        let resource = json!({
            "snippet": {
                "title": metadata.title,
                "description": metadata.description,
                "tags": metadata.tags,
            },
            "status": {
                "privacyStatus": metadata.privacy_status,
            },
        });

        let session = self
            .client
            .post(&self.endpoint)
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .bearer_auth(&credential.access_token)
            .header("X-Upload-Content-Type", MEDIA_CONTENT_TYPE)
            .header("X-Upload-Content-Length", length)
            .json(&resource)
            .send()
            .await?;
        let session = ensure_success(session).await?;

        let location = session
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                PublishError::InvalidResponse("upload session has no Location header".to_string())
            })?
            .to_string();

        let response = self
            .client
            .put(&location)
            .bearer_auth(&credential.access_token)
            .header(CONTENT_TYPE, MEDIA_CONTENT_TYPE)
            .header(CONTENT_LENGTH, length)
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let video: VideoResource = response
            .json()
            .await
            .map_err(|e| PublishError::InvalidResponse(e.to_string()))?;

        info!("YouTube accepted upload as video {}", video.id);
        Ok(Published {
            external_id: video.id,
        })
    }

    fn canonical_url(&self, external_id: &str) -> String {
        format!("https://www.youtube.com/watch?v={}", external_id)
    }
}
