use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::{Job, JobId, JobStatus};

/// Response for a batch submission
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_ids: Vec<JobId>,
}

/// Public view of a job. Credentials never leave the server.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    pub status: JobStatus,
    pub message: String,
    pub source_url: String,
    pub title: Option<String>,
    pub video_id: Option<String>,
    pub video_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            message: job.message,
            source_url: job.source_url,
            title: job.title,
            video_id: job.external_id,
            video_url: job.external_url,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// Response for the status listing
#[derive(Serialize, Debug)]
pub struct JobListResponse {
    pub jobs: Vec<JobView>,
}

/// Settings the browser needs before signing in
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub redirect_uri: String,
    pub max_concurrent_uploads: usize,
    pub max_bulk_items: usize,
}
