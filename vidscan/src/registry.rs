//! In-memory job registry.
//!
//! The registry is the only owner of job state. Every mutation goes through
//! [`JobRegistry::update`] (or [`JobRegistry::finish`]), which holds the job's
//! lock while merging and persisting, so writes to one job never interleave and
//! memory never runs ahead of disk. Terminal transitions are the exception: a
//! job that ended is ended in memory even when its record cannot be written,
//! so it always gives its slot back.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

use crate::job::{Job, JobUpdate};
use crate::store::JobRepository;
use crate::{Error, Result};

pub struct JobRegistry {
    jobs: DashMap<String, Arc<Mutex<Job>>>,
    repository: Arc<dyn JobRepository>,
    next_sequence: AtomicU64,
}

impl JobRegistry {
    pub fn new(repository: Arc<dyn JobRepository>) -> Self {
        Self {
            jobs: DashMap::new(),
            repository,
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Load every persisted record into memory.
    ///
    /// Returns the number of jobs loaded. Sequence numbers for new jobs
    /// continue after the highest one seen.
    pub async fn load(&self) -> Result<usize> {
        let jobs = self.repository.load_jobs().await?;
        let count = jobs.len();

        let max_sequence = jobs.iter().map(|j| j.sequence).max().unwrap_or(0);
        self.next_sequence
            .fetch_max(max_sequence + 1, Ordering::SeqCst);

        for job in jobs {
            self.jobs.insert(job.id.clone(), Arc::new(Mutex::new(job)));
        }

        info!(count, "Loaded persisted jobs");
        Ok(count)
    }

    /// Create and persist a new `Queued` job.
    pub async fn create(
        &self,
        original_file_name: impl Into<String>,
        source_file_path: Option<PathBuf>,
    ) -> Result<Job> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let job = Job::new(original_file_name, source_file_path, sequence);

        self.repository.save_job(&job).await?;
        self.jobs
            .insert(job.id.clone(), Arc::new(Mutex::new(job.clone())));

        debug!(job_id = %job.id, sequence, "Job created");
        Ok(job)
    }

    pub async fn get(&self, id: &str) -> Result<Job> {
        let slot = self.slot(id)?;
        let job = slot.lock().await;
        Ok(job.clone())
    }

    /// Merge `update` into a job and persist the result.
    ///
    /// The in-memory record only changes once the write succeeded.
    #[instrument(skip(self, update), fields(job_id = %id))]
    pub async fn update(&self, id: &str, update: JobUpdate) -> Result<Job> {
        let slot = self.slot(id)?;
        let mut current = slot.lock().await;

        let mut next = current.clone();
        next.apply(update)?;
        self.repository.save_job(&next).await?;

        *current = next;
        Ok(current.clone())
    }

    /// Apply a terminal update.
    ///
    /// Returns `Ok(false)` without touching the job when it is already terminal,
    /// so exactly one caller observes `true` for each job. A failed write is
    /// logged and the transition is kept in memory; the stale record on disk
    /// is failed as interrupted on the next load.
    #[instrument(skip(self, update), fields(job_id = %id))]
    pub async fn finish(&self, id: &str, update: JobUpdate) -> Result<bool> {
        debug_assert!(update.status.is_some_and(|s| s.is_terminal()));

        let slot = self.slot(id)?;
        let mut current = slot.lock().await;

        let mut next = current.clone();
        match next.apply(update) {
            Ok(()) => {}
            Err(Error::JobTerminal { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }
        if let Err(e) = self.repository.save_job(&next).await {
            error!(status = %next.status, error = %e, "Failed to persist terminal job state");
        }

        *current = next;
        Ok(true)
    }

    /// All jobs, newest first.
    pub async fn list_all(&self) -> Vec<Job> {
        let slots: Vec<_> = self.jobs.iter().map(|e| e.value().clone()).collect();

        let mut jobs = Vec::with_capacity(slots.len());
        for slot in slots {
            jobs.push(slot.lock().await.clone());
        }

        jobs.sort_by_key(|j| std::cmp::Reverse(j.arrival_key()));
        jobs
    }

    /// Delete a job's record, in memory and on disk.
    ///
    /// Removing an unknown id returns `false`.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let removed = self.jobs.remove(id);

        // Wait for an in-flight update on this job so its write cannot land
        // after the directory is gone.
        if let Some((_, slot)) = &removed {
            let _guard = slot.lock().await;
        }

        let deleted = self.repository.delete_job(id).await?;
        Ok(removed.is_some() || deleted)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn slot(&self, id: &str) -> Result<Arc<Mutex<Job>>> {
        self.jobs
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::not_found("Job", id))
    }
}
