//! Engine configuration.
//!
//! Values come from the process environment (optionally seeded from a `.env`
//! file by the binary) and fall back to the defaults below.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::progress::StageWeights;
use crate::utils::fs;
use crate::{Error, Result};

const DEFAULT_MAX_CONCURRENT_JOBS: usize = 3;
const DEFAULT_EXTRACTION_FPS: f64 = 7.0;
const DEFAULT_MIN_CONFIDENCE: f64 = 0.5;
const DEFAULT_DETECTION_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_TERMINATION_GRACE_MS: u64 = 2000;

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "vidscan=info,worker_protocol=info";

/// Full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root for all engine state.
    pub data_dir: PathBuf,
    /// One sub-directory per job holding `metadata.json` and result files.
    pub jobs_dir: PathBuf,
    /// Per-video working directories (extracted frames, live preview).
    pub frames_dir: PathBuf,
    /// Where uploaded source videos are kept until processed.
    pub upload_dir: PathBuf,
    /// Maximum number of jobs in `Admitted` or `Running` at once.
    pub max_concurrent_jobs: usize,
    pub ffmpeg_path: String,
    /// Frames per second sampled from the source video.
    pub extraction_fps: f64,
    pub python_executable: String,
    pub detector_script: PathBuf,
    pub model_path: PathBuf,
    pub min_confidence: f64,
    /// Base URL of the remote detection service. `None` means local only.
    pub detection_service_url: Option<String>,
    pub detection_request_timeout_secs: u64,
    pub stage_weights: StageWeights,
    /// How long a stopped worker gets before it is force-killed.
    pub termination_grace_ms: u64,
    /// Directory for rolling log files. `None` logs to the console only.
    pub log_dir: Option<PathBuf>,
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::with_data_dir("./data")
    }
}

impl EngineConfig {
    /// Defaults with every state directory rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            jobs_dir: data_dir.join("jobs"),
            frames_dir: data_dir.join("frames"),
            upload_dir: data_dir.join("uploads"),
            data_dir,
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            ffmpeg_path: "ffmpeg".to_string(),
            extraction_fps: DEFAULT_EXTRACTION_FPS,
            python_executable: "python3".to_string(),
            detector_script: PathBuf::from("python/detector.py"),
            model_path: PathBuf::from("models/best.pt"),
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            detection_service_url: None,
            detection_request_timeout_secs: DEFAULT_DETECTION_TIMEOUT_SECS,
            stage_weights: StageWeights::default(),
            termination_grace_ms: DEFAULT_TERMINATION_GRACE_MS,
            log_dir: None,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = get("VIDSCAN_DATA_DIR").unwrap_or_else(|| "./data".to_string());
        let mut config = Self::with_data_dir(data_dir);

        if let Some(v) = get("VIDSCAN_JOBS_DIR") {
            config.jobs_dir = PathBuf::from(v);
        }
        if let Some(v) = get("VIDSCAN_FRAMES_DIR") {
            config.frames_dir = PathBuf::from(v);
        }
        if let Some(v) = get("VIDSCAN_UPLOAD_DIR") {
            config.upload_dir = PathBuf::from(v);
        }
        if let Some(v) = get("VIDSCAN_MAX_CONCURRENT_JOBS") {
            config.max_concurrent_jobs = parse_value("VIDSCAN_MAX_CONCURRENT_JOBS", &v)?;
        }
        if let Some(v) = get("FFMPEG_PATH") {
            config.ffmpeg_path = v;
        }
        if let Some(v) = get("VIDSCAN_EXTRACTION_FPS") {
            config.extraction_fps = parse_value("VIDSCAN_EXTRACTION_FPS", &v)?;
        }
        if let Some(v) = get("PYTHON_EXECUTABLE") {
            config.python_executable = v;
        }
        if let Some(v) = get("VIDSCAN_DETECTOR_SCRIPT") {
            config.detector_script = PathBuf::from(v);
        }
        if let Some(v) = get("YOLO_MODEL_PATH") {
            config.model_path = PathBuf::from(v);
        }
        if let Some(v) = get("MIN_CONFIDENCE") {
            config.min_confidence = parse_value("MIN_CONFIDENCE", &v)?;
        }
        config.detection_service_url =
            get("YOLO_SERVICE_URL").map(|v| v.trim_end_matches('/').to_string());
        if let Some(v) = get("YOLO_SERVICE_TIMEOUT_SECS") {
            config.detection_request_timeout_secs = parse_value("YOLO_SERVICE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("VIDSCAN_STAGE_WEIGHTS") {
            config.stage_weights = v.parse()?;
        }
        if let Some(v) = get("VIDSCAN_TERMINATION_GRACE_MS") {
            config.termination_grace_ms = parse_value("VIDSCAN_TERMINATION_GRACE_MS", &v)?;
        }
        config.log_dir = get("VIDSCAN_LOG_DIR").map(PathBuf::from);
        if let Some(v) = get("RUST_LOG") {
            config.log_filter = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(Error::config("max_concurrent_jobs must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(Error::config(format!(
                "min_confidence must be within [0, 1], got {}",
                self.min_confidence
            )));
        }
        if !(self.extraction_fps > 0.0) {
            return Err(Error::config(format!(
                "extraction_fps must be positive, got {}",
                self.extraction_fps
            )));
        }
        self.stage_weights.validate()
    }

    /// Create the jobs, frames and upload directories.
    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.jobs_dir, &self.frames_dir, &self.upload_dir] {
            fs::ensure_dir_all(dir).await?;
        }
        Ok(())
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn detection_request_timeout(&self) -> Duration {
        Duration::from_secs(self.detection_request_timeout_secs)
    }

    /// Directory holding a job's record and durable result files.
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(job_id)
    }

    /// Working directory for a video's extracted frames and live preview.
    pub fn work_dir(&self, correlation_id: &str) -> PathBuf {
        self.frames_dir.join(correlation_id)
    }

    /// Whether `path` lives inside the upload directory.
    pub fn is_upload(&self, path: &Path) -> bool {
        path.starts_with(&self.upload_dir)
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("invalid {key} {value:?}: {e}")))
}
