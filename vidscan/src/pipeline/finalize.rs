//! Result finalization.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use worker_protocol::FrameItems;

use crate::Result;
use crate::utils::fs;

/// Durable result artifact inside a job directory.
pub const RESULT_FILE: &str = "items.json";
/// Durable copy of the last live preview inside a job directory.
pub const PREVIEW_FILE: &str = "preview.jpg";
/// Live preview written by the worker inside the working directory.
pub const LIVE_PREVIEW_FILE: &str = "live-preview.jpg";
/// Sub-directory of the working directory holding extracted frames.
pub const RAW_FRAMES_DIR: &str = "raw";

/// File locations of one job run.
#[derive(Debug, Clone)]
pub struct WorkPaths {
    pub work_dir: PathBuf,
    pub raw_dir: PathBuf,
    pub items_json: PathBuf,
    pub live_preview: PathBuf,
    pub job_dir: PathBuf,
}

impl WorkPaths {
    pub fn new(work_dir: PathBuf, job_dir: PathBuf) -> Self {
        Self {
            raw_dir: work_dir.join(RAW_FRAMES_DIR),
            items_json: work_dir.join(RESULT_FILE),
            live_preview: work_dir.join(LIVE_PREVIEW_FILE),
            work_dir,
            job_dir,
        }
    }
}

/// Aggregate view of a result artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    /// Frames with at least one entry in the artifact.
    pub frames: usize,
    /// Distinct item names, sorted.
    pub items: Vec<String>,
    /// Distinct names of items explicitly flagged as owned, sorted.
    pub owned: Vec<String>,
}

impl ResultSummary {
    pub fn from_frames(frames: &[FrameItems]) -> Self {
        let mut items = BTreeSet::new();
        let mut owned = BTreeSet::new();
        for item in frames.iter().flat_map(|f| &f.items) {
            items.insert(item.name.clone());
            if item.is_owned() {
                owned.insert(item.name.clone());
            }
        }
        Self {
            frames: frames.len(),
            items: items.into_iter().collect(),
            owned: owned.into_iter().collect(),
        }
    }
}

/// Drop intermediate frames, write the result artifact and copy the durable
/// files into the job directory.
pub async fn finalize(paths: &WorkPaths, frames: &[FrameItems]) -> Result<ResultSummary> {
    fs::remove_dir_all_if_exists(&paths.raw_dir).await?;
    fs::write_json_atomic(&paths.items_json, frames).await?;

    fs::ensure_dir_all(&paths.job_dir).await?;
    copy_durable(&paths.items_json, &paths.job_dir.join(RESULT_FILE)).await?;
    if !copy_durable(&paths.live_preview, &paths.job_dir.join(PREVIEW_FILE)).await? {
        debug!(path = %paths.live_preview.display(), "No live preview to keep");
    }

    Ok(ResultSummary::from_frames(frames))
}

async fn copy_durable(from: &Path, to: &Path) -> Result<bool> {
    fs::copy_if_exists(from, to).await
}
