//! Per-job pipeline: extract frames, detect, finalize.

use std::sync::Arc;

use strum::Display;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::extract::{self, FrameExtractor};
use super::finalize::{self, ResultSummary, WorkPaths};
use crate::config::EngineConfig;
use crate::error::JobErrorKind;
use crate::job::{Job, JobStatus, JobUpdate, LivePreview};
use crate::progress::{Stage, StageProgress};
use crate::registry::JobRegistry;
use crate::supervisor::{DetectionRequest, ProcessSupervisor, SupervisorEvent};
use crate::utils::fs;
use crate::{Error, Result};

pub const STAGE_FINALIZING: &str = "finalizing results";
pub const STAGE_COMPLETED: &str = "completed";
pub const STAGE_ERROR: &str = "error";

const PROGRESS_BUFFER: usize = 32;

/// Pipeline position of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum PipelineState {
    ExtractFrames,
    Detect,
    Finalize,
    Done,
    Error,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Error)
    }
}

/// How a pipeline run ended.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub job_id: String,
    /// `Done` or `Error`.
    pub state: PipelineState,
    /// Whether this run moved the job into a terminal status. When `false`
    /// someone else (termination) already did.
    pub finished: bool,
    pub summary: Option<ResultSummary>,
}

pub struct PipelineOrchestrator {
    registry: Arc<JobRegistry>,
    supervisor: Arc<ProcessSupervisor>,
    extractor: Arc<dyn FrameExtractor>,
    config: Arc<EngineConfig>,
}

impl PipelineOrchestrator {
    pub fn new(
        registry: Arc<JobRegistry>,
        supervisor: Arc<ProcessSupervisor>,
        extractor: Arc<dyn FrameExtractor>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            registry,
            supervisor,
            extractor,
            config,
        }
    }

    /// Run an admitted job to a terminal status.
    pub async fn run(&self, job: Job) -> PipelineReport {
        let mut report = PipelineReport {
            job_id: job.id.clone(),
            state: PipelineState::ExtractFrames,
            finished: false,
            summary: None,
        };

        let start = JobUpdate::new()
            .status(JobStatus::Running)
            .upload_progress(100.0)
            .stage(Stage::Extraction.label());
        let job = match self.registry.update(&job.id, start).await {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Admitted job could not start");
                report.state = PipelineState::Error;
                report.finished = self.fail(&job.id, &e).await;
                return report;
            }
        };
        info!(job_id = %job.id, file = %job.original_file_name, "Pipeline started");

        match self.execute(&job, &mut report.state).await {
            Ok(summary) => {
                let done = JobUpdate::new()
                    .status(JobStatus::Completed)
                    .processing_progress(100.0)
                    .detected_count(summary.frames as u64)
                    .stage(STAGE_COMPLETED);
                report.finished = match self.registry.finish(&job.id, done).await {
                    Ok(finished) => finished,
                    Err(e) => self.fail(&job.id, &e).await,
                };
                if report.finished {
                    info!(
                        job_id = %job.id,
                        frames = summary.frames,
                        items = summary.items.len(),
                        owned = ?summary.owned,
                        "Job completed"
                    );
                }
                report.state = PipelineState::Done;
                report.summary = Some(summary);
            }
            Err(e) => {
                error!(job_id = %job.id, state = %report.state, error = %e, "Pipeline failed");
                report.state = PipelineState::Error;
                report.finished = self.fail(&job.id, &e).await;
            }
        }

        report
    }

    async fn execute(&self, job: &Job, state: &mut PipelineState) -> Result<ResultSummary> {
        let paths = WorkPaths::new(
            self.config.work_dir(&job.correlation_id),
            self.config.job_dir(&job.id),
        );
        let mut progress = StageProgress::new(self.config.stage_weights);

        *state = PipelineState::ExtractFrames;
        let total_frames = self.extract_frames(job, &paths, &mut progress).await?;

        *state = PipelineState::Detect;
        let frames = self
            .detect(job, &paths, total_frames, &mut progress)
            .await?;

        *state = PipelineState::Finalize;
        self.apply(&job.id, JobUpdate::new().stage(STAGE_FINALIZING))
            .await?;
        finalize::finalize(&paths, &frames).await
    }

    async fn extract_frames(
        &self,
        job: &Job,
        paths: &WorkPaths,
        progress: &mut StageProgress,
    ) -> Result<u64> {
        let source = job.source_file_path.as_deref().ok_or_else(|| {
            Error::job(JobErrorKind::SourceMissing, "job has no source file")
        })?;
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(Error::job(
                JobErrorKind::SourceMissing,
                format!("Uploaded file not found: {}", source.display()),
            ));
        }

        fs::recreate_dir(&paths.work_dir).await?;
        fs::ensure_dir_all(&paths.raw_dir).await?;

        let (tx, mut rx) = mpsc::channel(PROGRESS_BUFFER);
        let pump = async {
            while let Some(fraction) = rx.recv().await {
                let value = progress.report(Stage::Extraction, fraction);
                self.apply_quietly(&job.id, JobUpdate::new().processing_progress(value))
                    .await;
            }
        };
        let (result, ()) = tokio::join!(self.extractor.extract(source, &paths.raw_dir, tx), pump);
        result?;

        let frames = extract::list_frames(&paths.raw_dir).await?;
        let kept = extract::decimate(frames).await?;
        if kept.is_empty() {
            return Err(Error::job(
                JobErrorKind::ExtractionFailed,
                "no frames were extracted from the video",
            ));
        }

        debug!(job_id = %job.id, frames = kept.len(), "Frames ready for detection");
        Ok(kept.len() as u64)
    }

    async fn detect(
        &self,
        job: &Job,
        paths: &WorkPaths,
        total_frames: u64,
        progress: &mut StageProgress,
    ) -> Result<Vec<worker_protocol::FrameItems>> {
        progress.enter(Stage::Detection);
        self.apply(
            &job.id,
            JobUpdate::new()
                .stage(Stage::Detection.label())
                .processing_progress(progress.value()),
        )
        .await?;

        let request = DetectionRequest {
            job_id: job.id.clone(),
            frames_dir: paths.raw_dir.clone(),
            output_json: paths.items_json.clone(),
            preview_file: Some(paths.live_preview.clone()),
            total_frames,
            model_path: self.config.model_path.clone(),
            confidence: self.config.min_confidence,
            fps: self.config.extraction_fps,
            kill: CancellationToken::new(),
        };

        let (tx, mut rx) = mpsc::channel(PROGRESS_BUFFER);
        let pump = async {
            while let Some(event) = rx.recv().await {
                let update = match event {
                    SupervisorEvent::ProcessStarted(pid) => {
                        debug!(job_id = %job.id, pid, "Worker process reported");
                        continue;
                    }
                    SupervisorEvent::StageChanged(stage) => {
                        let stage = Stage::from(stage);
                        if !progress.enter(stage) {
                            debug!(job_id = %job.id, stage = %stage, "Ignoring earlier stage");
                            continue;
                        }
                        JobUpdate::new()
                            .stage(stage.label())
                            .processing_progress(progress.value())
                    }
                    SupervisorEvent::Progress(units) => {
                        let stage = progress.active_stage();
                        let value = progress.report_units(stage, units, total_frames);
                        JobUpdate::new().processing_progress(value)
                    }
                    SupervisorEvent::Preview(preview) => JobUpdate::new()
                        .live_preview(LivePreview::from_frame(&job.correlation_id, preview)),
                };
                self.apply_quietly(&job.id, update).await;
            }
        };

        let (result, ()) = tokio::join!(self.supervisor.run(&request, tx), pump);
        let outcome = result?;
        info!(
            job_id = %job.id,
            path = %outcome.path,
            frames = outcome.frames.len(),
            "Detection finished"
        );
        Ok(outcome.frames)
    }

    async fn apply(&self, job_id: &str, update: JobUpdate) -> Result<Job> {
        self.registry.update(job_id, update).await
    }

    /// Apply an advisory update. Failures are logged, not propagated.
    async fn apply_quietly(&self, job_id: &str, update: JobUpdate) {
        match self.registry.update(job_id, update).await {
            Ok(_) => {}
            Err(Error::JobTerminal { .. }) => {
                debug!(job_id, "Dropping update for finished job");
            }
            Err(e) => warn!(job_id, error = %e, "Failed to record job progress"),
        }
    }

    /// Mark the job failed. Returns whether this call made the transition.
    async fn fail(&self, job_id: &str, cause: &Error) -> bool {
        let update =
            JobUpdate::failed(cause.job_kind(), cause.job_detail()).stage(STAGE_ERROR);
        match self.registry.finish(job_id, update).await {
            Ok(finished) => finished,
            Err(e) => {
                error!(job_id, error = %e, "Failed to record job failure");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FlakyRepository, FsJobRepository};
    use crate::store::JobRepository;
    use crate::supervisor::DetectionBackend;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use worker_protocol::DetectionStage;

    /// Writes `count` empty frames and reports half-way progress.
    struct StubExtractor {
        count: usize,
    }

    #[async_trait]
    impl FrameExtractor for StubExtractor {
        async fn extract(
            &self,
            _source: &Path,
            out_dir: &Path,
            progress: mpsc::Sender<f64>,
        ) -> Result<()> {
            let _ = progress.send(0.5).await;
            for i in 1..=self.count {
                tokio::fs::write(out_dir.join(format!("frame-{i:04}.png")), b"")
                    .await
                    .map_err(Error::Io)?;
            }
            let _ = progress.send(1.0).await;
            Ok(())
        }
    }

    /// Replays a fixed event script, then writes one result per frame.
    struct StubBackend {
        script: Vec<SupervisorEvent>,
        fail_with: Option<JobErrorKind>,
    }

    #[async_trait]
    impl DetectionBackend for StubBackend {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn detect(
            &self,
            request: &DetectionRequest,
            events: mpsc::Sender<SupervisorEvent>,
        ) -> Result<()> {
            for event in &self.script {
                let _ = events.send(event.clone()).await;
            }
            if let Some(kind) = self.fail_with {
                return Err(Error::job(kind, "worker crashed"));
            }
            let frames: Vec<_> = (1..=request.total_frames)
                .map(|i| serde_json::json!({"frameIndex": i, "items": [{"name": "Fade"}]}))
                .collect();
            tokio::fs::write(&request.output_json, serde_json::to_vec(&frames)?)
                .await
                .map_err(Error::Io)?;
            Ok(())
        }
    }

    struct Fixture {
        temp: TempDir,
        config: Arc<EngineConfig>,
        registry: Arc<JobRegistry>,
    }

    impl Fixture {
        async fn new() -> Self {
            let temp = tempfile::tempdir().unwrap();
            let repository = Arc::new(FsJobRepository::new(temp.path().join("jobs")));
            Self::with_repository(temp, repository).await
        }

        async fn with_repository(temp: TempDir, repository: Arc<dyn JobRepository>) -> Self {
            let config = EngineConfig::with_data_dir(temp.path());
            config.ensure_dirs().await.unwrap();
            let registry = Arc::new(JobRegistry::new(repository));
            Self {
                temp,
                config: Arc::new(config),
                registry,
            }
        }

        fn orchestrator(&self, frames: usize, backend: StubBackend) -> PipelineOrchestrator {
            let supervisor = Arc::new(ProcessSupervisor::new(
                self.registry.clone(),
                None,
                Arc::new(backend),
                Duration::ZERO,
            ));
            PipelineOrchestrator::new(
                self.registry.clone(),
                supervisor,
                Arc::new(StubExtractor { count: frames }),
                self.config.clone(),
            )
        }

        async fn admitted(&self) -> Job {
            let source = self.config.upload_dir.join("clip.mp4");
            tokio::fs::write(&source, b"video").await.unwrap();
            let job = self.registry.create("clip.mp4", Some(source)).await.unwrap();
            self.registry
                .update(&job.id, JobUpdate::new().status(JobStatus::Admitted))
                .await
                .unwrap()
        }
    }

    fn full_script() -> Vec<SupervisorEvent> {
        let mut script = vec![SupervisorEvent::StageChanged(DetectionStage::Ai)];
        script.extend((1..=3).map(SupervisorEvent::Progress));
        script.push(SupervisorEvent::StageChanged(DetectionStage::Ocr));
        script.extend((1..=3).map(SupervisorEvent::Progress));
        script
    }

    #[tokio::test]
    async fn successful_run_completes_job() {
        let fx = Fixture::new().await;
        let job = fx.admitted().await;
        let orchestrator = fx.orchestrator(
            6,
            StubBackend {
                script: full_script(),
                fail_with: None,
            },
        );

        let report = orchestrator.run(job.clone()).await;
        assert_eq!(report.state, PipelineState::Done);
        assert!(report.finished);

        let done = fx.registry.get(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.processing_progress, 100.0);
        assert_eq!(done.upload_progress, 100.0);
        assert_eq!(done.detected_count, Some(3));
        assert_eq!(done.current_stage, STAGE_COMPLETED);

        let job_dir = fx.config.job_dir(&job.id);
        assert!(job_dir.join(finalize::RESULT_FILE).exists());
        assert!(!fx.config.work_dir(&job.correlation_id).join("raw").exists());
    }

    #[tokio::test]
    async fn worker_failure_fails_job_with_kind() {
        let fx = Fixture::new().await;
        let job = fx.admitted().await;
        let orchestrator = fx.orchestrator(
            4,
            StubBackend {
                script: vec![SupervisorEvent::StageChanged(DetectionStage::Ai)],
                fail_with: Some(JobErrorKind::WorkerExitedNonZero),
            },
        );

        let report = orchestrator.run(job.clone()).await;
        assert_eq!(report.state, PipelineState::Error);
        assert!(report.finished);

        let failed = fx.registry.get(&job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_kind, Some(JobErrorKind::WorkerExitedNonZero));
        assert_eq!(failed.error_detail.as_deref(), Some("worker crashed"));
        assert_eq!(failed.processing_progress, 20.0);
    }

    #[tokio::test]
    async fn empty_extraction_is_a_failure() {
        let fx = Fixture::new().await;
        let job = fx.admitted().await;
        let orchestrator = fx.orchestrator(
            0,
            StubBackend {
                script: Vec::new(),
                fail_with: None,
            },
        );

        orchestrator.run(job.clone()).await;
        let failed = fx.registry.get(&job.id).await.unwrap();
        assert_eq!(failed.error_kind, Some(JobErrorKind::ExtractionFailed));
    }

    #[tokio::test]
    async fn missing_source_is_reported() {
        let fx = Fixture::new().await;
        let job = fx.admitted().await;
        tokio::fs::remove_file(fx.config.upload_dir.join("clip.mp4"))
            .await
            .unwrap();

        let orchestrator = fx.orchestrator(
            2,
            StubBackend {
                script: Vec::new(),
                fail_with: None,
            },
        );
        orchestrator.run(job.clone()).await;

        let failed = fx.registry.get(&job.id).await.unwrap();
        assert_eq!(failed.error_kind, Some(JobErrorKind::SourceMissing));
        assert!(fx.temp.path().exists());
    }

    #[tokio::test]
    async fn already_terminated_job_is_not_finished_twice() {
        let fx = Fixture::new().await;
        let job = fx.admitted().await;
        fx.registry
            .finish(
                &job.id,
                JobUpdate::failed(JobErrorKind::TerminationRequested, "Job was manually terminated"),
            )
            .await
            .unwrap();

        let orchestrator = fx.orchestrator(
            2,
            StubBackend {
                script: Vec::new(),
                fail_with: None,
            },
        );
        let report = orchestrator.run(job.clone()).await;
        assert!(!report.finished);
        assert_eq!(
            fx.registry.get(&job.id).await.unwrap().error_kind,
            Some(JobErrorKind::TerminationRequested)
        );
    }

    #[tokio::test]
    async fn preview_updates_live_preview_only() {
        let fx = Fixture::new().await;
        let job = fx.admitted().await;
        let preview = worker_protocol::FramePreview {
            frame_index: 2,
            items: vec![worker_protocol::FrameItem::new("Fade")],
            processing_time: Some(0.4),
            video_time: Some(0.28),
        };
        let orchestrator = fx.orchestrator(
            4,
            StubBackend {
                script: vec![
                    SupervisorEvent::StageChanged(DetectionStage::Ai),
                    SupervisorEvent::Preview(preview),
                ],
                fail_with: Some(JobErrorKind::WorkerExitedNonZero),
            },
        );

        orchestrator.run(job.clone()).await;
        let failed = fx.registry.get(&job.id).await.unwrap();
        let live = failed.live_preview.unwrap();
        assert_eq!(live.frame_index, 2);
        assert_eq!(
            live.preview_url,
            format!("/frames/{}/live-preview.jpg", job.correlation_id)
        );
        assert_eq!(failed.processing_progress, 20.0);
    }

    #[tokio::test]
    async fn storage_failure_still_ends_the_job() {
        let temp = tempfile::tempdir().unwrap();
        let repository = Arc::new(FlakyRepository::new(temp.path().join("jobs")));
        let fx = Fixture::with_repository(temp, repository.clone()).await;
        let job = fx.admitted().await;
        let orchestrator = fx.orchestrator(
            4,
            StubBackend {
                script: full_script(),
                fail_with: None,
            },
        );

        repository.set_failing(true);
        let report = orchestrator.run(job.clone()).await;
        assert_eq!(report.state, PipelineState::Error);
        assert!(report.finished);

        let failed = fx.registry.get(&job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_detail.as_deref(), Some("No space left on device"));
    }
}
