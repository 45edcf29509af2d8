//! File-backed job store.
//!
//! One JSON file per job (`{jobId}.json`). Every mutation is a whole-file
//! read-modify-write through an atomic rename. Only the daemon mutates a job
//! after creation; within one process mutations are serialized.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::model::{JobCounts, JobLogEntry, JobRecord, JobStatus, LogLevel, StatusUpdate};
use crate::utils::fs;
use crate::utils::json::{self, JsonContext};
use crate::{Error, Result};

pub struct JobStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn job_path(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::validation(format!("invalid job id: {id:?}")));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    async fn write(&self, job: &JobRecord) -> Result<()> {
        fs::write_json_atomic(&self.job_path(&job.id)?, job).await
    }

    /// Create a queued job.
    pub async fn create(
        &self,
        job_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<JobRecord> {
        let job = JobRecord::new(job_type, payload);
        let _guard = self.write_lock.lock().await;
        self.write(&job).await?;
        debug!(job_id = %job.id, job_type = %job.job_type, "Created job");
        Ok(job)
    }

    /// Load a job by id.
    pub async fn get(&self, id: &str) -> Result<JobRecord> {
        fs::read_json_opt(&self.job_path(id)?)
            .await?
            .ok_or_else(|| Error::not_found("job", id))
    }

    /// Move a job to `status`.
    ///
    /// Sets `startedAt` on `running` and `finishedAt` on terminal states.
    /// Transitions that are not monotonic are rejected.
    pub async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        update: StatusUpdate,
    ) -> Result<JobRecord> {
        let _guard = self.write_lock.lock().await;
        let mut job = self.get(id).await?;

        if !job.status.can_transition_to(status) {
            return Err(Error::InvalidStateTransition {
                from: job.status.to_string(),
                to: status.to_string(),
            });
        }

        let now = Utc::now();
        job.status = status;
        job.updated_at = now;
        match status {
            JobStatus::Running => job.started_at = Some(now),
            JobStatus::Complete | JobStatus::Failed => job.finished_at = Some(now),
            JobStatus::Queued => {}
        }
        if let Some(error) = update.error {
            job.push_log(JobLogEntry::error(error.clone()));
            job.error = Some(error);
        }
        if let Some(result) = update.result {
            job.result = Some(result);
        }
        job.push_log(JobLogEntry::info(format!("Status changed to {status}")));

        self.write(&job).await?;
        info!(
            job_id = %id,
            status = %status,
            run_secs = job.run_duration().map(|d| d.num_seconds()),
            "Job status updated"
        );
        Ok(job)
    }

    /// Append a log entry to a job.
    pub async fn append_log(&self, id: &str, level: LogLevel, message: impl Into<String>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut job = self.get(id).await?;
        job.push_log(JobLogEntry::new(level, message));
        job.updated_at = Utc::now();
        self.write(&job).await
    }

    /// All jobs, oldest first. Unreadable job files are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<JobRecord>> {
        let mut jobs = Vec::new();
        for path in fs::list_json_files(&self.dir).await? {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                // Raced with a concurrent rename or delete.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(fs::io_error("reading job file", &path, e)),
            };
            if let Some(job) = json::parse_bytes::<JobRecord>(
                &bytes,
                JsonContext::JobFile { path: &path },
                "Skipping unreadable job file",
            ) {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    /// Queued jobs, oldest first.
    pub async fn list_queued(&self) -> Result<Vec<JobRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|job| job.status == JobStatus::Queued)
            .collect())
    }

    /// Per-status tallies.
    pub async fn counts(&self) -> Result<JobCounts> {
        let mut counts = JobCounts::default();
        for job in self.list().await? {
            counts.record(job.status);
        }
        Ok(counts)
    }
}
