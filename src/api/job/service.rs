use std::fmt;
use std::sync::Arc;

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use tracing::{info, warn};

use super::dto::JobView;
use super::models::UploadItem;
use super::submission::{validate_items, SubmissionError};
use crate::api::validation::ErrorResponse;
use crate::store::{CredentialBundle, JobId, JobStore, RedirectContext, StoreError};
use crate::worker::Scheduler;

/// Service-level errors
#[derive(Debug)]
pub enum ServiceError {
    /// The batch was rejected before any job was created
    Validation(SubmissionError),

    /// Job not found
    NotFound(JobId),

    /// The scheduler no longer dispatches work
    ShuttingDown,
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Validation(e) => write!(f, "{}", e),
            ServiceError::NotFound(id) => write!(f, "Job not found: {}", id),
            ServiceError::ShuttingDown => write!(f, "Server is shutting down"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<SubmissionError> for ServiceError {
    fn from(e: SubmissionError) -> Self {
        ServiceError::Validation(e)
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) | StoreError::InvalidTransition { id, .. } => {
                ServiceError::NotFound(id)
            }
        }
    }
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            ServiceError::Validation(e) => {
                warn!("Rejected upload batch: {}", e);
                HttpResponse::BadRequest().json(ErrorResponse {
                    error: e.to_string(),
                    fields: match e.index() {
                        Some(index) => serde_json::json!({"item": index}),
                        None => serde_json::json!({}),
                    },
                })
            }
            ServiceError::NotFound(id) => {
                warn!("Job not found: {}", id);
                HttpResponse::NotFound().json(ErrorResponse {
                    error: "Not found".to_string(),
                    fields: serde_json::json!({"message": format!("Job with id {} not found", id)}),
                })
            }
            ServiceError::ShuttingDown => HttpResponse::ServiceUnavailable().json(ErrorResponse {
                error: "Server is shutting down".to_string(),
                fields: serde_json::json!({"message": "New uploads are not accepted right now"}),
            }),
        }
    }
}

/// Job service containing the submission and status logic
pub struct JobService {
    store: Arc<JobStore>,
    scheduler: Arc<Scheduler>,
    max_batch: usize,
    status_limit: usize,
}

impl JobService {
    pub fn new(
        store: Arc<JobStore>,
        scheduler: Arc<Scheduler>,
        max_batch: usize,
        status_limit: usize,
    ) -> Self {
        Self {
            store,
            scheduler,
            max_batch,
            status_limit,
        }
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    pub fn max_concurrent(&self) -> usize {
        self.scheduler.stats().capacity
    }

    /// Validate a batch, create one job per item and hand them to the scheduler
    ///
    /// # Business Logic
    /// - Nothing is created when validation fails
    /// - Every job gets its own copy of `credential` and `redirect`
    /// - Job ids come back in submission order, which is also dispatch order
    pub fn submit(
        &self,
        items: &serde_json::Value,
        credential: &CredentialBundle,
        redirect: &RedirectContext,
    ) -> Result<Vec<JobId>, ServiceError> {
        let items = validate_items(items, self.max_batch)?;
        if !self.scheduler.stats().accepting {
            return Err(ServiceError::ShuttingDown);
        }

        let specs = items.into_iter().map(UploadItem::into_spec).collect();
        let job_ids: Vec<JobId> = self
            .store
            .create_batch(specs, credential, redirect)
            .into_iter()
            .map(|job| job.id)
            .collect();

        info!("Service: Accepted {} upload jobs", job_ids.len());
        self.scheduler.enqueue_all(job_ids.iter().copied());
        Ok(job_ids)
    }

    /// Most recently created jobs, newest first
    pub fn recent(&self) -> Vec<JobView> {
        self.store
            .list_recent(self.status_limit)
            .into_iter()
            .map(JobView::from)
            .collect()
    }

    pub fn get(&self, id: JobId) -> Result<JobView, ServiceError> {
        Ok(self.store.get(id)?.into())
    }
}
