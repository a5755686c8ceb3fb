//! Job data model.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;
use worker_protocol::{FrameItem, FramePreview};

use crate::error::JobErrorKind;
use crate::progress::round2;
use crate::{Error, Result};

/// Stage descriptor of a job waiting for a slot.
pub const STAGE_QUEUED: &str = "queued - waiting for slot";

/// Lifecycle status of a job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a concurrency slot.
    Queued,
    /// Holds a slot; the pipeline is starting.
    Admitted,
    /// The pipeline is executing.
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// `Completed` and `Failed` accept no further mutation.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the job occupies a concurrency slot.
    pub fn holds_slot(self) -> bool {
        matches!(self, JobStatus::Admitted | JobStatus::Running)
    }

    /// Forward-only transitions. Any live job may fail.
    pub fn can_transition_to(self, target: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, target),
            (Queued, Admitted)
                | (Queued, Failed)
                | (Admitted, Running)
                | (Admitted, Failed)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

/// Snapshot of the most recently processed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivePreview {
    pub frame_index: u64,
    /// Reference to the preview image, relative to the frames root.
    pub preview_url: String,
    #[serde(default)]
    pub items: Vec<FrameItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_time: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl LivePreview {
    pub fn from_frame(correlation_id: &str, preview: FramePreview) -> Self {
        Self {
            frame_index: preview.frame_index,
            preview_url: preview_url(correlation_id),
            items: preview.items,
            processing_time: preview.processing_time,
            video_time: preview.video_time,
            updated_at: Utc::now(),
        }
    }
}

/// Public reference of a video's live preview image.
pub fn preview_url(correlation_id: &str) -> String {
    format!("/frames/{correlation_id}/live-preview.jpg")
}

/// A video detection job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    /// Namespaces the job's working files.
    pub correlation_id: String,
    pub original_file_name: String,
    pub status: JobStatus,
    pub upload_progress: f64,
    pub processing_progress: f64,
    /// Observability only; never drives control decisions.
    pub current_stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_process_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_preview: Option<LivePreview>,
    /// Arrival order; breaks `created_at` ties during admission.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<JobErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl Job {
    pub fn new(
        original_file_name: impl Into<String>,
        source_file_path: Option<PathBuf>,
        sequence: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            correlation_id: Uuid::new_v4().to_string(),
            original_file_name: original_file_name.into(),
            status: JobStatus::Queued,
            upload_progress: 0.0,
            processing_progress: 0.0,
            current_stage: STAGE_QUEUED.to_string(),
            detected_count: None,
            source_file_path,
            worker_process_id: None,
            live_preview: None,
            sequence,
            created_at: now,
            updated_at: now,
            error_kind: None,
            error_detail: None,
        }
    }

    /// Admission order key.
    pub fn arrival_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.sequence)
    }

    /// Merge `update` into this job.
    ///
    /// Terminal jobs reject every update. Processing progress only moves
    /// forward, the worker pid is dropped whenever the job is not running, and
    /// error fields are only kept on failed jobs.
    pub fn apply(&mut self, update: JobUpdate) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::JobTerminal {
                id: self.id.clone(),
                status: self.status.to_string(),
            });
        }

        if let Some(status) = update.status.filter(|s| *s != self.status) {
            if !self.status.can_transition_to(status) {
                return Err(Error::InvalidStateTransition {
                    from: self.status.to_string(),
                    to: status.to_string(),
                });
            }
            self.status = status;
        }

        if let Some(progress) = update.upload_progress {
            self.upload_progress = clamp_percent(progress);
        }
        if let Some(progress) = update.processing_progress {
            self.processing_progress = self.processing_progress.max(clamp_percent(progress));
        }
        if let Some(stage) = update.current_stage {
            self.current_stage = stage;
        }
        if let Some(count) = update.detected_count {
            self.detected_count = Some(count);
        }
        if let Some(pid) = update.worker_process_id {
            self.worker_process_id = pid;
        }
        if let Some(preview) = update.live_preview {
            self.live_preview = Some(preview);
        }

        match self.status {
            JobStatus::Running => {}
            JobStatus::Completed => {
                self.processing_progress = 100.0;
                self.worker_process_id = None;
            }
            JobStatus::Failed => {
                self.worker_process_id = None;
                if let Some((kind, detail)) = update.error {
                    self.error_kind = Some(kind);
                    self.error_detail = Some(detail);
                }
            }
            JobStatus::Queued | JobStatus::Admitted => self.worker_process_id = None,
        }

        self.updated_at = Utc::now().max(self.updated_at);
        Ok(())
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        round2(value.clamp(0.0, 100.0))
    } else {
        0.0
    }
}

/// A partial job mutation. Unset fields are left as they are.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub upload_progress: Option<f64>,
    pub processing_progress: Option<f64>,
    pub current_stage: Option<String>,
    pub detected_count: Option<u64>,
    /// `Some(None)` detaches the worker.
    pub worker_process_id: Option<Option<u32>>,
    pub live_preview: Option<LivePreview>,
    pub error: Option<(JobErrorKind, String)>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to `Failed` with a reason.
    pub fn failed(kind: JobErrorKind, detail: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some((kind, detail.into())),
            ..Self::default()
        }
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn upload_progress(mut self, progress: f64) -> Self {
        self.upload_progress = Some(progress);
        self
    }

    pub fn processing_progress(mut self, progress: f64) -> Self {
        self.processing_progress = Some(progress);
        self
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.current_stage = Some(stage.into());
        self
    }

    pub fn detected_count(mut self, count: u64) -> Self {
        self.detected_count = Some(count);
        self
    }

    pub fn worker(mut self, pid: Option<u32>) -> Self {
        self.worker_process_id = Some(pid);
        self
    }

    pub fn live_preview(mut self, preview: LivePreview) -> Self {
        self.live_preview = Some(preview);
        self
    }
}

/// Aggregate queue occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Jobs holding a slot (`Admitted` or `Running`).
    pub running: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub available_slots: usize,
}

impl QueueStats {
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>, max_concurrent: usize) -> Self {
        let (mut running, mut queued) = (0, 0);
        for job in jobs {
            if job.status.holds_slot() {
                running += 1;
            } else if job.status == JobStatus::Queued {
                queued += 1;
            }
        }
        Self {
            running,
            queued,
            max_concurrent,
            available_slots: max_concurrent.saturating_sub(running),
        }
    }
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub total: usize,
    pub queued: usize,
    pub admitted: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut counts = Self::default();
        for job in jobs {
            counts.total += 1;
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Admitted => counts.admitted += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

/// A detection worker process currently attached to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveWorker {
    pub job_id: String,
    pub pid: u32,
    pub stage: String,
}

/// Engine-wide status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub queue: QueueStats,
    pub counts: JobCounts,
    pub workers: Vec<ActiveWorker>,
}
