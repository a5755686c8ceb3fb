//! Detection worker supervision.
//!
//! The supervisor runs one detection attempt per job. A remote detection
//! service is preferred when configured; if it fails the same request is run
//! once through the local subprocess backend. Worker events are forwarded to
//! the caller over a channel, and the worker's pid is attached to the job as
//! soon as it is known so the job can be terminated.

mod local;
mod remote;
pub mod termination;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use strum::Display;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use worker_protocol::{DetectionStage, FrameItems, FramePreview, parse_result_artifact};

pub use local::LocalDetector;
pub use remote::RemoteDetector;
pub use termination::StopOutcome;

use crate::error::JobErrorKind;
use crate::job::{JobStatus, JobUpdate};
use crate::registry::JobRegistry;
use crate::{Error, Result};

/// Capacity of the event channel between a backend and the supervisor.
const EVENT_BUFFER: usize = 64;

/// Events reported while a detection worker runs.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    ProcessStarted(u32),
    Progress(u64),
    StageChanged(DetectionStage),
    Preview(FramePreview),
}

/// Parameters of one detection run.
#[derive(Debug, Clone)]
pub struct DetectionRequest {
    pub job_id: String,
    pub frames_dir: PathBuf,
    pub output_json: PathBuf,
    pub preview_file: Option<PathBuf>,
    pub total_frames: u64,
    pub model_path: PathBuf,
    pub confidence: f64,
    pub fps: f64,
    /// Fired to kill the worker outright. Backends holding a child handle
    /// must kill it through that handle.
    pub kill: CancellationToken,
}

/// Which execution path produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionPath {
    Remote,
    Local,
    /// Local execution after the remote service failed.
    LocalFallback,
}

#[derive(Debug, Clone)]
pub struct DetectionOutcome {
    pub frames: Vec<FrameItems>,
    pub path: ExecutionPath,
}

/// A way of running detection for one request.
///
/// Implementations write the result artifact to `request.output_json` and
/// report progress through `events`. Send errors on `events` are ignored.
#[async_trait]
pub trait DetectionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn detect(
        &self,
        request: &DetectionRequest,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Result<()>;
}

pub struct ProcessSupervisor {
    registry: Arc<JobRegistry>,
    remote: Option<Arc<dyn DetectionBackend>>,
    local: Arc<dyn DetectionBackend>,
    termination_grace: Duration,
    /// Kill switches of the detection runs in flight, by job id.
    kill_switches: DashMap<String, CancellationToken>,
}

impl ProcessSupervisor {
    pub fn new(
        registry: Arc<JobRegistry>,
        remote: Option<Arc<dyn DetectionBackend>>,
        local: Arc<dyn DetectionBackend>,
        termination_grace: Duration,
    ) -> Self {
        Self {
            registry,
            remote,
            local,
            termination_grace,
            kill_switches: DashMap::new(),
        }
    }

    /// Run detection for a job and return the parsed result artifact.
    pub async fn run(
        &self,
        request: &DetectionRequest,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Result<DetectionOutcome> {
        self.kill_switches
            .insert(request.job_id.clone(), request.kill.clone());
        let result = self.run_with_fallback(request, &events).await;
        self.kill_switches.remove(&request.job_id);
        result
    }

    async fn run_with_fallback(
        &self,
        request: &DetectionRequest,
        events: &mpsc::Sender<SupervisorEvent>,
    ) -> Result<DetectionOutcome> {
        let Some(remote) = &self.remote else {
            let frames = self.attempt(self.local.as_ref(), request, events).await?;
            return Ok(DetectionOutcome {
                frames,
                path: ExecutionPath::Local,
            });
        };

        match self.attempt(remote.as_ref(), request, events).await {
            Ok(frames) => {
                return Ok(DetectionOutcome {
                    frames,
                    path: ExecutionPath::Remote,
                });
            }
            Err(e) => {
                warn!(
                    job_id = %request.job_id,
                    backend = remote.name(),
                    error = %e,
                    "Remote detection failed, falling back to local execution"
                );
            }
        }

        self.ensure_live(&request.job_id).await?;
        let frames = self.attempt(self.local.as_ref(), request, events).await?;
        Ok(DetectionOutcome {
            frames,
            path: ExecutionPath::LocalFallback,
        })
    }

    /// Ask the job's worker process to stop.
    ///
    /// Returns `false` when the job is terminal or has no attached worker.
    /// `true` only means a stop was attempted; the process may still be alive.
    pub async fn terminate(&self, job_id: &str) -> Result<bool> {
        let job = self.registry.get(job_id).await?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        let Some(pid) = job.worker_process_id else {
            return Ok(false);
        };

        match termination::request_stop(pid) {
            Ok(outcome) => {
                info!(job_id, pid, outcome = %outcome, "Stop requested for detection worker");
                let kill = self.kill_switches.get(job_id).map(|k| k.clone());
                if let (StopOutcome::Signalled, Some(kill)) = (outcome, kill) {
                    termination::escalate_after(kill, self.termination_grace);
                }
            }
            Err(e) => warn!(job_id, pid, error = %e, "Failed to stop detection worker"),
        }
        Ok(true)
    }

    async fn attempt(
        &self,
        backend: &dyn DetectionBackend,
        request: &DetectionRequest,
        events: &mpsc::Sender<SupervisorEvent>,
    ) -> Result<Vec<FrameItems>> {
        debug!(job_id = %request.job_id, backend = backend.name(), "Starting detection");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (result, ()) = tokio::join!(
            backend.detect(request, tx),
            self.forward_events(request, rx, events)
        );
        result?;

        read_result_artifact(&request.output_json).await
    }

    /// Relay backend events, attaching the worker pid to the job first.
    async fn forward_events(
        &self,
        request: &DetectionRequest,
        mut rx: mpsc::Receiver<SupervisorEvent>,
        events: &mpsc::Sender<SupervisorEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            if let SupervisorEvent::ProcessStarted(pid) = event {
                self.attach_worker(&request.job_id, pid, &request.kill).await;
            }
            let _ = events.send(event).await;
        }
    }

    async fn attach_worker(&self, job_id: &str, pid: u32, kill: &CancellationToken) {
        match self
            .registry
            .update(job_id, JobUpdate::new().worker(Some(pid)))
            .await
        {
            Ok(job) if job.status == JobStatus::Running => {
                debug!(job_id, pid, "Detection worker attached");
            }
            Ok(_) => {}
            // Terminated before the pid could be recorded.
            Err(Error::JobTerminal { .. }) | Err(Error::NotFound { .. }) => {
                warn!(job_id, pid, "Worker started for a finished job, killing it");
                kill.cancel();
            }
            Err(e) => warn!(job_id, pid, error = %e, "Failed to record worker pid"),
        }
    }

    async fn ensure_live(&self, job_id: &str) -> Result<()> {
        let job = self.registry.get(job_id).await?;
        if job.status.is_terminal() {
            return Err(Error::job(
                JobErrorKind::TerminationRequested,
                format!("job is already {}", job.status),
            ));
        }
        Ok(())
    }
}

/// Read and decode the artifact a worker left at `path`.
pub async fn read_result_artifact(path: &Path) -> Result<Vec<FrameItems>> {
    let json = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::job(
            JobErrorKind::ResultUnreadable,
            format!("failed to read {}: {e}", path.display()),
        )
    })?;
    parse_result_artifact(&json).map_err(|e| Error::job(JobErrorKind::ResultUnreadable, e.to_string()))
}
