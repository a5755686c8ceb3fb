//! Job persistence.
//!
//! Each job lives in its own directory under the jobs root with the full
//! record in `metadata.json`. Result files produced at finalize sit next to it,
//! so removing the directory removes everything the job owns there.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::Result;
use crate::job::Job;
use crate::utils::fs;

/// File name of the job record inside a job directory.
pub const METADATA_FILE: &str = "metadata.json";

/// Durable storage for job records.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Write the full record, replacing any previous version atomically.
    async fn save_job(&self, job: &Job) -> Result<()>;

    /// Load every readable record. Unreadable ones are skipped.
    async fn load_jobs(&self) -> Result<Vec<Job>>;

    /// Remove a job's record and directory. Returns `false` if nothing existed.
    async fn delete_job(&self, id: &str) -> Result<bool>;
}

/// [`JobRepository`] backed by one directory per job.
#[derive(Debug, Clone)]
pub struct FsJobRepository {
    jobs_dir: PathBuf,
}

impl FsJobRepository {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs_dir: jobs_dir.into(),
        }
    }

    pub fn job_dir(&self, id: &str) -> PathBuf {
        self.jobs_dir.join(id)
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.job_dir(id).join(METADATA_FILE)
    }

    async fn read_record(path: &Path) -> Option<Job> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Job directory without a record, skipping");
                return None;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read job record, skipping");
                return None;
            }
        };

        match serde_json::from_slice::<Job>(&bytes) {
            Ok(job) => Some(job),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Malformed job record, skipping");
                None
            }
        }
    }
}

#[async_trait]
impl JobRepository for FsJobRepository {
    async fn save_job(&self, job: &Job) -> Result<()> {
        fs::write_json_atomic(&self.metadata_path(&job.id), job).await
    }

    async fn load_jobs(&self) -> Result<Vec<Job>> {
        let mut entries = match tokio::fs::read_dir(&self.jobs_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(crate::Error::io_path("reading", &self.jobs_dir, e)),
        };

        let mut jobs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| crate::Error::io_path("reading", &self.jobs_dir, e))?
        {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }

            let Some(job) = Self::read_record(&dir.join(METADATA_FILE)).await else {
                continue;
            };

            // A record copied into the wrong directory would shadow another job.
            if dir.file_name().and_then(|n| n.to_str()) != Some(job.id.as_str()) {
                warn!(
                    path = %dir.display(),
                    job_id = %job.id,
                    "Job record does not match its directory, skipping"
                );
                continue;
            }

            jobs.push(job);
        }

        Ok(jobs)
    }

    async fn delete_job(&self, id: &str) -> Result<bool> {
        fs::remove_dir_all_if_exists(&self.job_dir(id)).await
    }
}

/// Repository whose writes can be switched off, for exercising storage failures.
#[cfg(test)]
pub(crate) struct FlakyRepository {
    inner: FsJobRepository,
    failing: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FlakyRepository {
    pub(crate) fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: FsJobRepository::new(jobs_dir),
            failing: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl JobRepository for FlakyRepository {
    async fn save_job(&self, job: &Job) -> Result<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::Error::Other("No space left on device".to_string()));
        }
        self.inner.save_job(job).await
    }

    async fn load_jobs(&self) -> Result<Vec<Job>> {
        self.inner.load_jobs().await
    }

    async fn delete_job(&self, id: &str) -> Result<bool> {
        self.inner.delete_job(id).await
    }
}
