use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

/// Lifecycle state of an upload job.
///
/// Transitions only move forward: `Queued -> Running -> {Done, Failed}`.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// Whether `next` is a legal successor of this status.
    pub fn can_become(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

/// Visibility requested for the published video.
///
/// Passed to the platform as submitted; the platform decides what is valid.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct PrivacyStatus(String);

impl PrivacyStatus {
    pub const PRIVATE: &'static str = "private";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PrivacyStatus {
    fn default() -> Self {
        Self::new(Self::PRIVATE)
    }
}

/// Opaque token set captured from the signed-in session.
///
/// Copied into every job at submission time and never refreshed.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CredentialBundle {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Where the platform's OAuth flow returns to, as seen when the batch was submitted.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RedirectContext {
    pub redirect_uri: String,
}

/// Submitted metadata for a single job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub source_url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub privacy_status: PrivacyStatus,
}

/// One source-to-publish unit of work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub message: String,
    pub source_url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub privacy_status: PrivacyStatus,
    pub credential: CredentialBundle,
    pub redirect: RedirectContext,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
}

/// Per-status job counts.
#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct JobCounts {
    pub queued: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}
