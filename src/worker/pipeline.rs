use std::any::Any;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{self, BoxFuture, FutureExt};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::store::{Job, JobId, JobStore, StoreError};
use crate::worker::fetch::{direct_download_url, FetchError, RemoteFetcher};
use crate::worker::publish::{PublishError, PublishRequest, Published, Publisher, VideoMetadata};
use crate::worker::scheduler::JobRunner;

pub const DOWNLOADING_MESSAGE: &str = "Downloading source file...";
pub const COMPLETED_MESSAGE: &str = "Upload completed successfully.";
pub const FAILED_MESSAGE: &str = "Upload failed.";
const STAGING_EXTENSION: &str = "bin";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Download(#[from] FetchError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("{step} timed out after {after:?}")]
    TimedOut { step: &'static str, after: Duration },

    #[error("Internal error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Directory holding one staging file per running job.
    pub staging_dir: PathBuf,
    pub fetch_timeout: Option<Duration>,
    pub publish_timeout: Option<Duration>,
}

/// Runs jobs through download, upload and cleanup.
pub struct Pipeline {
    store: Arc<JobStore>,
    fetcher: Arc<dyn RemoteFetcher>,
    publisher: Arc<dyn Publisher>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Arc<JobStore>,
        fetcher: Arc<dyn RemoteFetcher>,
        publisher: Arc<dyn Publisher>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            fetcher,
            publisher,
            settings,
        }
    }

    /// Staging file for a job. Named by job id so concurrent jobs never collide.
    pub fn staging_path(&self, job_id: JobId) -> PathBuf {
        self.settings.staging_dir.join(format!("{}.{}", job_id, STAGING_EXTENSION))
    }

    /// Remove staging files left behind by a previous process.
    ///
    /// Only call before the first job is dispatched.
    pub async fn sweep_staging_dir(&self) -> io::Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.settings.staging_dir).await?;
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == STAGING_EXTENSION)
                && entry.file_type().await?.is_file()
            {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl JobRunner for Pipeline {
    fn start(&self, job_id: JobId) -> BoxFuture<'static, ()> {
        let job = match self.store.mark_running(job_id, DOWNLOADING_MESSAGE) {
            Ok(job) => job,
            Err(e) => {
                error!(job_id = %job_id, "Could not start job: {}", e);
                return future::ready(()).boxed();
            }
        };
        info!(job_id = %job_id, source_url = %job.source_url, "Job started");

        let worker = PipelineWorker {
            staging_path: self.staging_path(job_id),
            job,
            store: Arc::clone(&self.store),
            fetcher: Arc::clone(&self.fetcher),
            publisher: Arc::clone(&self.publisher),
            fetch_timeout: self.settings.fetch_timeout,
            publish_timeout: self.settings.publish_timeout,
        };
        worker.run().boxed()
    }
}

/// Sole writer of one job from dispatch until its terminal state.
struct PipelineWorker {
    job: Job,
    staging_path: PathBuf,
    store: Arc<JobStore>,
    fetcher: Arc<dyn RemoteFetcher>,
    publisher: Arc<dyn Publisher>,
    fetch_timeout: Option<Duration>,
    publish_timeout: Option<Duration>,
}

impl PipelineWorker {
    async fn run(self) {
        let outcome = match AssertUnwindSafe(self.execute()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(PipelineError::Internal(panic_message(panic.as_ref()))),
        };

        // The staging file is gone before the terminal state becomes visible.
        self.remove_staging_file().await;
        self.finish(outcome);
    }

    async fn execute(&self) -> Result<Published, PipelineError> {
        let job_id = self.job.id;

        let resolved = direct_download_url(&self.job.source_url);
        if resolved != self.job.source_url.as_str() {
            info!(job_id = %job_id, "Resolved share link to {}", resolved);
        }

        let fetched = bounded(
            "Download",
            self.fetch_timeout,
            self.fetcher.fetch(&resolved, &self.staging_path),
        )
        .await?;
        debug!(job_id = %job_id, "Staged {} bytes", fetched.bytes_written);

        self.store.set_message(
            job_id,
            &format!("Uploading to {}...", self.publisher.platform()),
        )?;

        let title = self
            .job
            .title
            .clone()
            .filter(|title| !title.trim().is_empty())
            .or(fetched.filename)
            .unwrap_or_else(|| format!("Upload {}", job_id));

        let request = PublishRequest {
            credential: self.job.credential.clone(),
            redirect: self.job.redirect.clone(),
            metadata: VideoMetadata {
                title,
                description: self.job.description.clone().unwrap_or_default(),
                tags: self.job.tags.clone(),
                privacy_status: self.job.privacy_status.clone(),
            },
            media_path: self.staging_path.clone(),
        };

        bounded(
            "Upload",
            self.publish_timeout,
            self.publisher.publish(request),
        )
        .await
    }

    async fn remove_staging_file(&self) {
        match tokio::fs::remove_file(&self.staging_path).await {
            Ok(()) => debug!(
                job_id = %self.job.id,
                "Removed staging file {}",
                self.staging_path.display()
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                job_id = %self.job.id,
                "Failed to remove staging file {}: {}",
                self.staging_path.display(),
                e
            ),
        }
    }

    fn finish(&self, outcome: Result<Published, PipelineError>) {
        let job_id = self.job.id;
        let recorded = match outcome {
            Ok(published) => {
                let url = self.publisher.canonical_url(&published.external_id);
                info!(job_id = %job_id, "Job done: {}", url);
                self.store
                    .mark_done(job_id, published.external_id, url, COMPLETED_MESSAGE)
            }
            Err(e) => {
                if let PipelineError::Publish(PublishError::Rejected { status, reason, .. }) = &e {
                    warn!(job_id = %job_id, status, reason = ?reason, "Platform rejected upload");
                }
                warn!(job_id = %job_id, "Job failed: {}", e);
                let mut message = e.to_string();
                if message.trim().is_empty() {
                    message = FAILED_MESSAGE.to_string();
                }
                self.store.mark_failed(job_id, &message)
            }
        };

        if let Err(e) = recorded {
            error!(job_id = %job_id, "Could not record job outcome: {}", e);
        }
    }
}

/// Await `work`, failing with [`PipelineError::TimedOut`] once `limit` passes.
async fn bounded<T, E>(
    step: &'static str,
    limit: Option<Duration>,
    work: impl Future<Output = Result<T, E>>,
) -> Result<T, PipelineError>
where
    PipelineError: From<E>,
{
    let result = match limit {
        Some(after) => tokio::time::timeout(after, work)
            .await
            .map_err(|_| PipelineError::TimedOut { step, after })?,
        None => work.await,
    };
    Ok(result?)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use reqwest::StatusCode;
    use tempfile::TempDir;
    use tokio::runtime::Handle;
    use tokio::sync::oneshot;

    use super::*;
    use crate::store::{CredentialBundle, JobSpec, JobStatus, PrivacyStatus, RedirectContext};
    use crate::worker::fetch::{FetchedSource, HttpFetcher};
    use crate::worker::scheduler::Scheduler;

    #[derive(Default)]
    struct FakeFetcher {
        requested: Mutex<Vec<String>>,
        gates: Mutex<HashMap<String, oneshot::Receiver<()>>>,
        filename: Option<String>,
        fail: bool,
        panic: bool,
    }

    impl FakeFetcher {
        fn gate(&self, url: &str) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().insert(url.to_string(), rx);
            tx
        }
    }

    #[async_trait]
    impl RemoteFetcher for FakeFetcher {
        async fn fetch(&self, url: &str, destination: &Path) -> Result<FetchedSource, FetchError> {
            self.requested.lock().push(url.to_string());
            let gate = self.gates.lock().remove(url);
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            if self.panic {
                panic!("fetcher bug");
            }

            tokio::fs::write(destination, b"video")
                .await
                .map_err(|source| FetchError::Io {
                    path: destination.to_path_buf(),
                    source,
                })?;
            if self.fail {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: StatusCode::BAD_GATEWAY,
                });
            }
            Ok(FetchedSource {
                filename: self.filename.clone(),
                bytes_written: 5,
            })
        }
    }

    #[derive(Default)]
    struct FakePublisher {
        requests: Mutex<Vec<PublishRequest>>,
        media_present: Mutex<Vec<bool>>,
        reject_with: Option<String>,
    }

    #[async_trait]
    impl Publisher for FakePublisher {
        fn platform(&self) -> &str {
            "TestTube"
        }

        async fn publish(&self, request: PublishRequest) -> Result<Published, PublishError> {
            self.media_present.lock().push(request.media_path.exists());
            let count = {
                let mut requests = self.requests.lock();
                requests.push(request);
                requests.len()
            };
            match &self.reject_with {
                Some(message) => Err(PublishError::Rejected {
                    status: 403,
                    reason: Some("quotaExceeded".to_string()),
                    message: message.clone(),
                }),
                None => Ok(Published {
                    external_id: format!("vid-{}", count),
                }),
            }
        }

        fn canonical_url(&self, external_id: &str) -> String {
            format!("https://videos.example/watch/{}", external_id)
        }
    }

    struct Harness {
        store: Arc<JobStore>,
        scheduler: Arc<Scheduler>,
        pipeline: Arc<Pipeline>,
        fetcher: Arc<FakeFetcher>,
        publisher: Arc<FakePublisher>,
        staging: TempDir,
    }

    fn credential() -> CredentialBundle {
        CredentialBundle {
            access_token: "access-token".to_string(),
            refresh_token: Some("refresh-token".to_string()),
            expires_at: None,
            scope: Some("https://www.googleapis.com/auth/youtube.upload".to_string()),
        }
    }

    fn redirect() -> RedirectContext {
        RedirectContext {
            redirect_uri: "https://uploader.example/auth/google/callback".to_string(),
        }
    }

    fn harness_with(
        capacity: usize,
        fetcher: Arc<dyn RemoteFetcher>,
        fake_fetcher: Arc<FakeFetcher>,
        publisher: FakePublisher,
        fetch_timeout: Option<Duration>,
    ) -> Harness {
        let staging = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::new(None));
        let publisher = Arc::new(publisher);
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            fetcher,
            publisher.clone(),
            PipelineSettings {
                staging_dir: staging.path().to_path_buf(),
                fetch_timeout,
                publish_timeout: None,
            },
        ));
        let scheduler = Scheduler::new(capacity, pipeline.clone(), Handle::current());
        Harness {
            store,
            scheduler,
            pipeline,
            fetcher: fake_fetcher,
            publisher,
            staging,
        }
    }

    fn harness(capacity: usize, fetcher: FakeFetcher, publisher: FakePublisher) -> Harness {
        let fetcher = Arc::new(fetcher);
        harness_with(capacity, fetcher.clone(), fetcher, publisher, None)
    }

    impl Harness {
        fn submit(&self, url: &str, title: Option<&str>) -> JobId {
            let job = self.store.create(
                JobSpec {
                    source_url: url.to_string(),
                    title: title.map(str::to_string),
                    description: Some("desc".to_string()),
                    tags: vec!["tag".to_string()],
                    privacy_status: PrivacyStatus::new("unlisted"),
                },
                &credential(),
                &redirect(),
            );
            self.scheduler.enqueue(job.id);
            job.id
        }

        fn status(&self, id: JobId) -> JobStatus {
            self.store.get(id).unwrap().status
        }

        async fn wait_for(&self, what: &str, condition: impl Fn() -> bool) {
            let waited = tokio::time::timeout(Duration::from_secs(5), async {
                while !condition() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await;
            assert!(waited.is_ok(), "timed out waiting for {}", what);
        }

        async fn finished(&self, id: JobId) -> Job {
            self.wait_for("terminal state", || self.status(id).is_terminal()).await;
            self.scheduler.wait_idle().await;
            self.store.get(id).unwrap()
        }
    }

    #[tokio::test]
    async fn successful_job_is_published_and_cleaned_up() {
        let h = harness(
            2,
            FakeFetcher {
                filename: Some("holiday.mp4".to_string()),
                ..Default::default()
            },
            FakePublisher::default(),
        );

        let id = h.submit("https://example.com/holiday.mp4", None);
        let job = h.finished(id).await;

        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.message, COMPLETED_MESSAGE);
        assert_eq!(job.external_id.as_deref(), Some("vid-1"));
        assert_eq!(job.external_url.as_deref(), Some("https://videos.example/watch/vid-1"));
        assert!(job.started_at.is_some());
        assert!(job.completed_at >= job.started_at);

        let requests = h.publisher.requests.lock();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.metadata.title, "holiday.mp4");
        assert_eq!(request.metadata.description, "desc");
        assert_eq!(request.metadata.tags, vec!["tag"]);
        assert_eq!(request.metadata.privacy_status.as_str(), "unlisted");
        assert_eq!(request.credential, credential());
        assert_eq!(request.redirect, redirect());
        assert_eq!(request.media_path, h.pipeline.staging_path(id));
        assert_eq!(*h.publisher.media_present.lock(), vec![true]);

        assert!(!h.pipeline.staging_path(id).exists());
        assert_eq!(h.scheduler.stats().running, 0);
    }

    #[tokio::test]
    async fn submitted_title_wins_and_synthetic_title_is_last_resort() {
        let h = harness(1, FakeFetcher::default(), FakePublisher::default());

        let titled = h.submit("https://example.com/a", Some("My clip"));
        let untitled = h.submit("https://example.com/b", Some("   "));
        h.finished(titled).await;
        h.finished(untitled).await;

        let requests = h.publisher.requests.lock();
        assert_eq!(requests[0].metadata.title, "My clip");
        assert_eq!(requests[1].metadata.title, format!("Upload {}", untitled));
    }

    #[tokio::test]
    async fn download_failure_skips_publish() {
        let h = harness(
            1,
            FakeFetcher {
                fail: true,
                ..Default::default()
            },
            FakePublisher::default(),
        );

        let id = h.submit("https://example.com/broken.mp4", Some("x"));
        let job = h.finished(id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.message.contains("502"), "message: {}", job.message);
        assert!(job.external_id.is_none());
        assert!(job.completed_at.is_some());
        assert!(h.publisher.requests.lock().is_empty());
        assert!(!h.pipeline.staging_path(id).exists(), "partial download removed");
        assert_eq!(h.scheduler.stats().running, 0);
    }

    #[tokio::test]
    async fn platform_rejection_text_becomes_message() {
        let h = harness(
            1,
            FakeFetcher::default(),
            FakePublisher {
                reject_with: Some("The user has exceeded the number of videos they may upload.".to_string()),
                ..Default::default()
            },
        );

        let id = h.submit("https://example.com/a.mp4", None);
        let job = h.finished(id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.message, "The user has exceeded the number of videos they may upload.");
        assert!(job.external_url.is_none());
        assert!(!h.pipeline.staging_path(id).exists());
    }

    #[tokio::test]
    async fn share_links_are_fetched_in_direct_form() {
        let h = harness(1, FakeFetcher::default(), FakePublisher::default());

        let share = "https://drive.google.com/file/d/1a2B3c_-X/view?usp=sharing";
        let id = h.submit(share, None);
        let job = h.finished(id).await;

        assert_eq!(
            *h.fetcher.requested.lock(),
            vec!["https://drive.google.com/uc?export=download&id=1a2B3c_-X".to_string()]
        );
        assert_eq!(job.source_url, share, "submitted url is kept as-is");
    }

    #[tokio::test]
    async fn panic_inside_a_step_fails_the_job_only() {
        let h = harness(
            1,
            FakeFetcher {
                panic: true,
                ..Default::default()
            },
            FakePublisher::default(),
        );

        let first = h.submit("https://example.com/1", None);
        let second = h.submit("https://example.com/2", None);
        let first = h.finished(first).await;
        let second = h.finished(second).await;

        assert_eq!(first.status, JobStatus::Failed);
        assert_eq!(first.message, "Internal error: fetcher bug");
        assert_eq!(second.status, JobStatus::Failed, "queue keeps moving");
        assert_eq!(h.scheduler.stats().running, 0);
    }

    #[tokio::test]
    async fn queued_job_starts_when_a_slot_frees() {
        let fetcher = FakeFetcher::default();
        let gate_a = fetcher.gate("https://example.com/a");
        let gate_b = fetcher.gate("https://example.com/b");
        let gate_c = fetcher.gate("https://example.com/c");
        let h = harness(2, fetcher, FakePublisher::default());

        let a = h.submit("https://example.com/a", None);
        let b = h.submit("https://example.com/b", None);
        let c = h.submit("https://example.com/c", None);

        assert_eq!(h.status(a), JobStatus::Running);
        assert_eq!(h.status(b), JobStatus::Running);
        assert_eq!(h.status(c), JobStatus::Queued);
        assert_eq!(h.store.get(c).unwrap().message, "Queued for processing");
        assert_eq!(h.store.get(a).unwrap().message, DOWNLOADING_MESSAGE);

        let _ = gate_b.send(());
        h.wait_for("c to start", || h.status(c) == JobStatus::Running).await;
        assert_eq!(h.status(b), JobStatus::Done);
        assert_eq!(h.status(a), JobStatus::Running);

        let _ = gate_a.send(());
        let _ = gate_c.send(());
        h.finished(a).await;
        h.finished(c).await;
        assert_eq!(h.scheduler.stats().running, 0);
    }

    #[tokio::test]
    async fn slow_download_times_out() {
        let fake = FakeFetcher::default();
        let _gate = fake.gate("https://example.com/slow");
        let fake = Arc::new(fake);
        let h = harness_with(
            1,
            fake.clone(),
            fake,
            FakePublisher::default(),
            Some(Duration::from_millis(50)),
        );

        let id = h.submit("https://example.com/slow", None);
        let job = h.finished(id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.message, "Download timed out after 50ms");
        assert!(h.publisher.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn sweep_removes_only_staging_files() {
        let h = harness(1, FakeFetcher::default(), FakePublisher::default());
        let dir = h.staging.path();
        std::fs::write(dir.join("leftover.bin"), b"x").unwrap();
        std::fs::write(dir.join("notes.txt"), b"keep").unwrap();
        std::fs::create_dir(dir.join("nested.bin")).unwrap();

        assert_eq!(h.pipeline.sweep_staging_dir().await.unwrap(), 1);
        assert!(!dir.join("leftover.bin").exists());
        assert!(dir.join("notes.txt").exists());
        assert!(dir.join("nested.bin").is_dir());
    }

    #[tokio::test]
    async fn unreachable_source_fails_and_releases_slot() {
        let http = Arc::new(HttpFetcher::new(Some(Duration::from_secs(2))).unwrap());
        let h = harness_with(
            1,
            http,
            Arc::new(FakeFetcher::default()),
            FakePublisher::default(),
            None,
        );
        let before = h.scheduler.stats().running;

        let id = h.submit("http://127.0.0.1:1/never.mp4", None);
        let job = h.finished(id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert!(!job.message.trim().is_empty());
        assert!(!h.pipeline.staging_path(id).exists());
        assert!(h.publisher.requests.lock().is_empty());
        assert_eq!(h.scheduler.stats().running, before);
    }
}
