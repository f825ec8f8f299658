use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::models::{
    CredentialBundle, Job, JobCounts, JobId, JobSpec, JobStatus, RedirectContext,
};

pub const QUEUED_MESSAGE: &str = "Queued for processing";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

#[derive(Default)]
struct StoreInner {
    jobs: HashMap<JobId, Job>,
    /// Ids in creation order, oldest first.
    order: VecDeque<JobId>,
}

/// In-memory record of every job for the lifetime of the process.
///
/// Every read hands out a clone taken under the lock, so callers always see a
/// job as it was between two transitions. Jobs are kept forever unless a
/// retention cap is configured, in which case the oldest finished jobs are
/// evicted first.
pub struct JobStore {
    inner: RwLock<StoreInner>,
    retention: Option<usize>,
}

impl JobStore {
    pub fn new(retention: Option<usize>) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            retention,
        }
    }

    /// Create a single queued job from submitted metadata.
    pub fn create(
        &self,
        spec: JobSpec,
        credential: &CredentialBundle,
        redirect: &RedirectContext,
    ) -> Job {
        let mut inner = self.inner.write();
        let job = Self::insert(&mut inner, spec, credential, redirect);
        self.enforce_retention(&mut inner);
        job
    }

    /// Create one queued job per spec under a single write lock.
    ///
    /// The returned jobs keep the order of `specs`.
    pub fn create_batch(
        &self,
        specs: Vec<JobSpec>,
        credential: &CredentialBundle,
        redirect: &RedirectContext,
    ) -> Vec<Job> {
        let mut inner = self.inner.write();
        let created = specs
            .into_iter()
            .map(|spec| Self::insert(&mut inner, spec, credential, redirect))
            .collect();
        self.enforce_retention(&mut inner);
        created
    }

    fn insert(
        inner: &mut StoreInner,
        spec: JobSpec,
        credential: &CredentialBundle,
        redirect: &RedirectContext,
    ) -> Job {
        let mut id = Uuid::new_v4();
        while inner.jobs.contains_key(&id) {
            id = Uuid::new_v4();
        }

        let job = Job {
            id,
            status: JobStatus::Queued,
            message: QUEUED_MESSAGE.to_string(),
            source_url: spec.source_url,
            title: spec.title,
            description: spec.description,
            tags: spec.tags,
            privacy_status: spec.privacy_status,
            credential: credential.clone(),
            redirect: redirect.clone(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            external_id: None,
            external_url: None,
        };

        debug!(job_id = %id, source_url = %job.source_url, "Job created");
        inner.jobs.insert(id, job.clone());
        inner.order.push_back(id);
        job
    }

    pub fn get(&self, id: JobId) -> Result<Job, StoreError> {
        self.inner
            .read()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    /// Up to `limit` jobs, most recently created first.
    pub fn list_recent(&self, limit: usize) -> Vec<Job> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.jobs.get(id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().jobs.len()
    }

    pub fn counts(&self) -> JobCounts {
        let inner = self.inner.read();
        inner
            .jobs
            .values()
            .fold(JobCounts::default(), |mut counts, job| {
                match job.status {
                    JobStatus::Queued => counts.queued += 1,
                    JobStatus::Running => counts.running += 1,
                    JobStatus::Done => counts.done += 1,
                    JobStatus::Failed => counts.failed += 1,
                }
                counts
            })
    }

    /// Queued -> Running. Stamps `started_at`.
    pub fn mark_running(&self, id: JobId, message: &str) -> Result<Job, StoreError> {
        self.transition(id, JobStatus::Running, |job| {
            job.started_at = Some(Utc::now());
            job.message = message.to_string();
        })
    }

    /// Replace the progress message of a running job.
    pub fn set_message(&self, id: JobId, message: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.status != JobStatus::Running {
            return Err(StoreError::InvalidTransition {
                id,
                from: job.status,
                to: JobStatus::Running,
            });
        }
        job.message = message.to_string();
        Ok(())
    }

    /// Running -> Done. Records the platform's identifiers and stamps `completed_at`.
    pub fn mark_done(
        &self,
        id: JobId,
        external_id: String,
        external_url: String,
        message: &str,
    ) -> Result<Job, StoreError> {
        self.transition(id, JobStatus::Done, |job| {
            job.external_id = Some(external_id);
            job.external_url = Some(external_url);
            job.message = message.to_string();
            job.completed_at = Some(Utc::now());
        })
    }

    /// Running -> Failed. Stamps `completed_at`.
    pub fn mark_failed(&self, id: JobId, message: &str) -> Result<Job, StoreError> {
        self.transition(id, JobStatus::Failed, |job| {
            job.message = message.to_string();
            job.completed_at = Some(Utc::now());
        })
    }

    fn transition(
        &self,
        id: JobId,
        to: JobStatus,
        apply: impl FnOnce(&mut Job),
    ) -> Result<Job, StoreError> {
        let mut inner = self.inner.write();
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !job.status.can_become(to) {
            return Err(StoreError::InvalidTransition {
                id,
                from: job.status,
                to,
            });
        }
        job.status = to;
        apply(job);
        Ok(job.clone())
    }

    fn enforce_retention(&self, inner: &mut StoreInner) {
        let Some(cap) = self.retention else {
            return;
        };
        let mut excess = inner.jobs.len().saturating_sub(cap);
        if excess == 0 {
            return;
        }

        let StoreInner { jobs, order } = inner;
        order.retain(|id| {
            if excess == 0 {
                return true;
            }
            let finished = jobs.get(id).is_some_and(|job| job.status.is_terminal());
            if finished {
                jobs.remove(id);
                excess -= 1;
            }
            !finished
        });

        if excess > 0 {
            warn!(
                "Job store holds {} unfinished jobs beyond the retention cap of {}",
                excess, cap
            );
        }
    }
}
