//! Job service: the control surface of the engine.
//!
//! `JobService` wires the registry, admission controller, supervisor and
//! pipeline together. Promotion of the next queued job happens in exactly two
//! places: right after a job is submitted, and whenever a job reaches a
//! terminal status (pipeline end, termination).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use worker_protocol::FrameItems;

use crate::admission::AdmissionController;
use crate::config::EngineConfig;
use crate::error::JobErrorKind;
use crate::job::{ActiveWorker, EngineStatus, Job, JobCounts, JobStatus, JobUpdate, QueueStats};
use crate::logging::{LogEvent, RecentLogs};
use crate::pipeline::finalize::{LIVE_PREVIEW_FILE, PREVIEW_FILE, RESULT_FILE};
use crate::pipeline::{FfmpegFrameExtractor, FrameExtractor, PipelineOrchestrator, STAGE_ERROR};
use crate::registry::JobRegistry;
use crate::store::FsJobRepository;
use crate::supervisor::{
    DetectionBackend, LocalDetector, ProcessSupervisor, RemoteDetector, read_result_artifact,
};
use crate::utils::fs;
use crate::{Error, Result};

/// Stage descriptor of a job stopped on request.
pub const STAGE_TERMINATED: &str = "terminated by user";

const TERMINATED_DETAIL: &str = "Job was manually terminated";
const RESTART_DETAIL: &str = "interrupted by engine restart";
const SHUTDOWN_DETAIL: &str = "interrupted by engine shutdown";

/// Default time [`JobService::shutdown`] waits for pipelines to wind down.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// External collaborators of the engine.
pub struct EngineComponents {
    pub extractor: Arc<dyn FrameExtractor>,
    /// Preferred detection path; local only when `None`.
    pub remote: Option<Arc<dyn DetectionBackend>>,
    pub local: Arc<dyn DetectionBackend>,
}

impl EngineComponents {
    /// ffmpeg extraction, the configured detection service if any, and the
    /// local detector script.
    pub fn from_config(config: &EngineConfig) -> Self {
        let remote = config.detection_service_url.as_ref().map(|url| {
            Arc::new(RemoteDetector::new(url, config.detection_request_timeout()))
                as Arc<dyn DetectionBackend>
        });
        Self {
            extractor: Arc::new(FfmpegFrameExtractor::new(
                config.ffmpeg_path.clone(),
                config.extraction_fps,
            )),
            remote,
            local: Arc::new(LocalDetector::new(
                config.python_executable.clone(),
                config.detector_script.clone(),
            )),
        }
    }
}

/// Jobs, newest first, with the queue occupancy at the time of listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobList {
    pub jobs: Vec<Job>,
    pub queue: QueueStats,
}

pub struct JobService {
    config: Arc<EngineConfig>,
    registry: Arc<JobRegistry>,
    admission: AdmissionController,
    supervisor: Arc<ProcessSupervisor>,
    orchestrator: PipelineOrchestrator,
    recent_logs: RecentLogs,
    /// Pipeline tasks; taken on shutdown.
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
    cancellation_token: CancellationToken,
}

impl JobService {
    pub fn new(
        config: EngineConfig,
        components: EngineComponents,
        recent_logs: RecentLogs,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);

        let repository = Arc::new(FsJobRepository::new(&config.jobs_dir));
        let registry = Arc::new(JobRegistry::new(repository));
        let supervisor = Arc::new(ProcessSupervisor::new(
            registry.clone(),
            components.remote,
            components.local,
            config.termination_grace(),
        ));
        let orchestrator = PipelineOrchestrator::new(
            registry.clone(),
            supervisor.clone(),
            components.extractor,
            config.clone(),
        );

        Ok(Arc::new(Self {
            admission: AdmissionController::new(registry.clone(), config.max_concurrent_jobs),
            config,
            registry,
            supervisor,
            orchestrator,
            recent_logs,
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
            cancellation_token: CancellationToken::new(),
        }))
    }

    /// Create the state directories and load persisted jobs without running
    /// anything.
    pub async fn load(&self) -> Result<usize> {
        self.config.ensure_dirs().await?;
        self.registry.load().await
    }

    /// Load persisted jobs, fail the ones a previous run left in flight, and
    /// resume the queue.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let loaded = self.load().await?;
        let interrupted = self.recover_interrupted().await?;
        let admitted = self.admit_pending().await?;

        info!(
            loaded,
            interrupted,
            admitted,
            max_concurrent = self.admission.max_concurrent(),
            "Job service started"
        );
        Ok(())
    }

    /// Create a job for an uploaded file and admit it if a slot is free.
    pub async fn submit(
        self: &Arc<Self>,
        original_file_name: impl Into<String>,
        source_file_path: PathBuf,
    ) -> Result<Job> {
        if self.is_shutting_down() {
            return Err(Error::Other("job service is shutting down".to_string()));
        }

        let job = self
            .registry
            .create(original_file_name, Some(source_file_path))
            .await?;
        info!(job_id = %job.id, file = %job.original_file_name, "Job submitted");

        self.admit_pending().await?;
        self.registry.get(&job.id).await
    }

    /// Admit and start queued jobs until no slot is free.
    ///
    /// Returns the number of jobs started.
    pub async fn admit_pending(self: &Arc<Self>) -> Result<usize> {
        let mut started = 0;
        while !self.is_shutting_down() {
            let Some(job) = self.admission.try_admit().await? else {
                break;
            };
            self.spawn_pipeline(job);
            started += 1;
        }
        Ok(started)
    }

    fn spawn_pipeline(self: &Arc<Self>, job: Job) {
        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!(job_id = %job.id, "Job service stopped, pipeline not started");
            return;
        };

        // Reap pipelines that already ended.
        while join_set.try_join_next().is_some() {}

        let service = Arc::clone(self);
        join_set.spawn(async move {
            let report = service.orchestrator.run(job).await;
            debug!(job_id = %report.job_id, state = %report.state, "Pipeline ended");
            if report.finished {
                service.promote().await;
            }
        });
    }

    async fn promote(self: &Arc<Self>) {
        if let Err(e) = self.admit_pending().await {
            error!(error = %e, "Failed to promote queued jobs");
        }
    }

    pub async fn get(&self, id: &str) -> Result<Job> {
        self.registry.get(id).await
    }

    pub async fn list(&self) -> JobList {
        let jobs = self.registry.list_all().await;
        let queue = QueueStats::from_jobs(&jobs, self.admission.max_concurrent());
        JobList { jobs, queue }
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.admission.queue_stats().await
    }

    pub async fn status(&self) -> EngineStatus {
        let jobs = self.registry.list_all().await;
        let workers = jobs
            .iter()
            .filter_map(|job| {
                job.worker_process_id.map(|pid| ActiveWorker {
                    job_id: job.id.clone(),
                    pid,
                    stage: job.current_stage.clone(),
                })
            })
            .collect();

        EngineStatus {
            queue: QueueStats::from_jobs(&jobs, self.admission.max_concurrent()),
            counts: JobCounts::from_jobs(&jobs),
            workers,
        }
    }

    /// Stop a job.
    ///
    /// The worker, if one is attached, is asked to stop and the job is failed
    /// right away without waiting for the process to exit. Returns `false` if
    /// the job had already ended.
    pub async fn terminate(self: &Arc<Self>, id: &str) -> Result<bool> {
        let signalled = self.supervisor.terminate(id).await?;

        let update = JobUpdate::failed(JobErrorKind::TerminationRequested, TERMINATED_DETAIL)
            .stage(STAGE_TERMINATED);
        let finished = self.registry.finish(id, update).await?;
        if finished {
            info!(job_id = id, signalled, "Job terminated");
            self.admit_pending().await?;
        }
        Ok(finished)
    }

    /// Remove a job with its record, result files, working frames and
    /// uploaded source.
    ///
    /// Jobs holding a slot must be terminated first. Unknown ids return
    /// `false`.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let job = match self.registry.get(id).await {
            Ok(job) => job,
            Err(Error::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        if job.status.holds_slot() {
            return Err(Error::InvalidStateTransition {
                from: job.status.to_string(),
                to: "deleted".to_string(),
            });
        }

        self.registry.remove(id).await?;
        fs::remove_dir_all_if_exists(&self.config.work_dir(&job.correlation_id)).await?;
        if let Some(source) = job
            .source_file_path
            .as_deref()
            .filter(|p| self.config.is_upload(p))
        {
            fs::remove_file_if_exists(source).await?;
        }

        info!(job_id = id, "Job deleted");
        Ok(true)
    }

    /// Detection results of a completed job.
    pub async fn results(&self, id: &str) -> Result<Vec<FrameItems>> {
        let job = self.registry.get(id).await?;
        if job.status != JobStatus::Completed {
            return Err(Error::not_found("Results", id));
        }
        read_result_artifact(&self.config.job_dir(id).join(RESULT_FILE)).await
    }

    /// Preview image of a job: the durable copy once finished, the live one
    /// while running. `None` when there is none yet.
    pub async fn preview_path(&self, id: &str) -> Result<Option<PathBuf>> {
        let job = self.registry.get(id).await?;
        let path = if job.status.is_terminal() {
            self.config.job_dir(id).join(PREVIEW_FILE)
        } else {
            self.config
                .work_dir(&job.correlation_id)
                .join(LIVE_PREVIEW_FILE)
        };
        Ok(tokio::fs::try_exists(&path)
            .await
            .unwrap_or(false)
            .then_some(path))
    }

    pub fn recent_logs(&self, limit: usize) -> Vec<LogEvent> {
        self.recent_logs.recent(limit)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Stop admitting, stop every in-flight job and wait for their pipelines.
    ///
    /// Queued jobs stay queued and resume on the next start.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down job service (timeout: {:?})", timeout);
        self.cancellation_token.cancel();

        let live: Vec<_> = self
            .registry
            .list_all()
            .await
            .into_iter()
            .filter(|job| job.status.holds_slot())
            .collect();
        for job in &live {
            if let Err(e) = self.supervisor.terminate(&job.id).await {
                warn!(job_id = %job.id, error = %e, "Failed to stop worker");
            }
            let update =
                JobUpdate::failed(JobErrorKind::Interrupted, SHUTDOWN_DETAIL).stage(STAGE_ERROR);
            if let Err(e) = self.registry.finish(&job.id, update).await {
                warn!(job_id = %job.id, error = %e, "Failed to record interrupted job");
            }
        }
        info!("Stopped {} active jobs", live.len());

        // Take the join set out of the mutex before awaiting
        let join_set = self.tasks.lock().take();
        if let Some(mut join_set) = join_set {
            let drained = tokio::time::timeout(timeout, async {
                while join_set.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    "Shutdown timeout reached, aborting {} pipelines",
                    join_set.len()
                );
                join_set.shutdown().await;
            }
        }

        info!("Job service shut down");
        Ok(())
    }

    async fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for job in self.registry.list_all().await {
            if !job.status.holds_slot() {
                continue;
            }
            let update = JobUpdate::failed(JobErrorKind::Interrupted, RESTART_DETAIL)
                .stage(STAGE_ERROR)
                .worker(None);
            if self.registry.finish(&job.id, update).await? {
                warn!(job_id = %job.id, status = %job.status, "Job interrupted by restart");
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
