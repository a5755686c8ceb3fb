//! Admission control.
//!
//! Decides when a queued job may take a concurrency slot. Admissions are
//! serialized behind a single lock, so the slot count read at the start of an
//! admission is still valid when the job is moved to `Admitted`.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::JobErrorKind;
use crate::job::{Job, JobStatus, JobUpdate, QueueStats};
use crate::registry::JobRegistry;
use crate::{Error, Result};

/// Stage descriptor of a job that just took a slot.
pub const STAGE_ADMITTED: &str = "starting";

pub struct AdmissionController {
    registry: Arc<JobRegistry>,
    max_concurrent: usize,
    lock: Mutex<()>,
}

impl AdmissionController {
    pub fn new(registry: Arc<JobRegistry>, max_concurrent: usize) -> Self {
        Self {
            registry,
            max_concurrent,
            lock: Mutex::new(()),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Admit the oldest queued job if a slot is free.
    ///
    /// `Ok(None)` means either every slot is taken or nothing is waiting.
    /// Queued jobs whose source file is gone are failed with
    /// [`JobErrorKind::SourceMissing`] and skipped.
    pub async fn try_admit(&self) -> Result<Option<Job>> {
        let _guard = self.lock.lock().await;

        loop {
            let jobs = self.registry.list_all().await;
            let stats = QueueStats::from_jobs(&jobs, self.max_concurrent);
            if stats.available_slots == 0 {
                debug!(running = stats.running, queued = stats.queued, "No free slot");
                return Ok(None);
            }

            let Some(next) = jobs
                .into_iter()
                .filter(|j| j.status == JobStatus::Queued)
                .min_by_key(|j| j.arrival_key())
            else {
                return Ok(None);
            };

            if !source_available(next.source_file_path.as_deref()).await {
                warn!(
                    job_id = %next.id,
                    source = ?next.source_file_path,
                    "Source file missing, failing queued job"
                );
                let update = JobUpdate::failed(JobErrorKind::SourceMissing, "Uploaded file not found")
                    .stage("error");
                match self.registry.finish(&next.id, update).await {
                    Ok(_) | Err(Error::NotFound { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }

            let update = JobUpdate::new()
                .status(JobStatus::Admitted)
                .stage(STAGE_ADMITTED);
            match self.registry.update(&next.id, update).await {
                Ok(job) => {
                    info!(
                        job_id = %job.id,
                        running = stats.running + 1,
                        max = self.max_concurrent,
                        "Job admitted"
                    );
                    return Ok(Some(job));
                }
                // Terminated or deleted since the snapshot was taken.
                Err(Error::JobTerminal { .. }) | Err(Error::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn queue_stats(&self) -> QueueStats {
        QueueStats::from_jobs(&self.registry.list_all().await, self.max_concurrent)
    }
}

async fn source_available(path: Option<&Path>) -> bool {
    match path {
        Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FsJobRepository;
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        registry: Arc<JobRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().unwrap();
            let repo = FsJobRepository::new(temp.path().join("jobs"));
            Self {
                registry: Arc::new(JobRegistry::new(Arc::new(repo))),
                temp,
            }
        }

        async fn queued(&self, name: &str) -> Job {
            let source = self.temp.path().join(name);
            tokio::fs::write(&source, b"video").await.unwrap();
            self.registry.create(name, Some(source)).await.unwrap()
        }

        async fn complete(&self, id: &str) {
            self.registry
                .update(id, JobUpdate::new().status(JobStatus::Running))
                .await
                .unwrap();
            assert!(
                self.registry
                    .finish(id, JobUpdate::new().status(JobStatus::Completed))
                    .await
                    .unwrap()
            );
        }
    }

    #[tokio::test]
    async fn admits_in_arrival_order_up_to_the_cap() {
        let fx = Fixture::new();
        let admission = AdmissionController::new(fx.registry.clone(), 2);

        let a = fx.queued("a.mp4").await;
        let b = fx.queued("b.mp4").await;
        let c = fx.queued("c.mp4").await;

        assert_eq!(admission.try_admit().await.unwrap().unwrap().id, a.id);
        assert_eq!(admission.try_admit().await.unwrap().unwrap().id, b.id);
        assert!(admission.try_admit().await.unwrap().is_none());

        let stats = admission.queue_stats().await;
        assert_eq!((stats.running, stats.queued, stats.available_slots), (2, 1, 0));

        fx.complete(&a.id).await;
        let admitted = admission.try_admit().await.unwrap().unwrap();
        assert_eq!(admitted.id, c.id);
        assert_eq!(admitted.status, JobStatus::Admitted);
    }

    #[tokio::test]
    async fn nothing_waiting_admits_nothing() {
        let fx = Fixture::new();
        let admission = AdmissionController::new(fx.registry.clone(), 1);
        assert!(admission.try_admit().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_source_fails_and_moves_on() {
        let fx = Fixture::new();
        let admission = AdmissionController::new(fx.registry.clone(), 1);

        let lost = fx.queued("lost.mp4").await;
        let next = fx.queued("next.mp4").await;
        tokio::fs::remove_file(fx.temp.path().join("lost.mp4"))
            .await
            .unwrap();

        assert_eq!(admission.try_admit().await.unwrap().unwrap().id, next.id);

        let lost = fx.registry.get(&lost.id).await.unwrap();
        assert_eq!(lost.status, JobStatus::Failed);
        assert_eq!(lost.error_kind, Some(JobErrorKind::SourceMissing));
    }

    #[tokio::test]
    async fn concurrent_admissions_respect_the_cap() {
        let fx = Fixture::new();
        let admission = Arc::new(AdmissionController::new(fx.registry.clone(), 3));
        for i in 0..10 {
            fx.queued(&format!("{i}.mp4")).await;
        }

        let mut handles = Vec::new();
        for _ in 0..10 {
            let admission = admission.clone();
            handles.push(tokio::spawn(async move { admission.try_admit().await.unwrap() }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(admission.queue_stats().await.running, 3);
    }
}
