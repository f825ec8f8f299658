pub mod job_store;
pub mod models;

pub use job_store::{JobStore, StoreError};
pub use models::{CredentialBundle, Job, JobCounts, JobId, JobSpec, JobStatus, PrivacyStatus, RedirectContext};
