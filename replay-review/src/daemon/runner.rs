//! The daemon loop: Heartbeat → Dispatch → Idle-Rollup, once per poll.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::heartbeat::{Heartbeat, HeartbeatReport};
use super::pidfile::PidFile;
use super::state::StateStore;
use super::worker::SessionWorker;
use crate::Result;
use crate::jobs::{JobStatus, JobStore, StatusUpdate};
use crate::rollup::{RollupOrchestrator, RollupReport};
use crate::slots::SlotArbiter;

/// Error recorded on jobs a previous daemon left `running`.
pub const INTERRUPTED_ERROR: &str = "interrupted by daemon restart";

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub poll_interval: Duration,
    /// Render memory budget; also sizes the worker pool.
    pub budget_mb: u64,
    pub pid_path: PathBuf,
}

/// What one tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub heartbeat: Option<HeartbeatReport>,
    pub dispatched: usize,
    pub rollup: Option<RollupReport>,
}

/// Removes a job id from the active set when its worker task ends,
/// including by panic.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<String>>>,
    job_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.job_id);
    }
}

pub struct DaemonRunner {
    jobs: Arc<JobStore>,
    state: Arc<StateStore>,
    arbiter: Arc<SlotArbiter>,
    heartbeat: Heartbeat,
    worker: Arc<SessionWorker>,
    rollup: RollupOrchestrator,
    options: RunnerOptions,
    workers: JoinSet<()>,
    active: Arc<Mutex<HashSet<String>>>,
    cancellation_token: CancellationToken,
}

impl DaemonRunner {
    pub fn new(
        jobs: Arc<JobStore>,
        state: Arc<StateStore>,
        arbiter: Arc<SlotArbiter>,
        heartbeat: Heartbeat,
        worker: Arc<SessionWorker>,
        rollup: RollupOrchestrator,
        options: RunnerOptions,
    ) -> Self {
        Self {
            jobs,
            state,
            arbiter,
            heartbeat,
            worker,
            rollup,
            options,
            workers: JoinSet::new(),
            active: Arc::new(Mutex::new(HashSet::new())),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops the loop after its current iteration.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Ids of jobs with a live worker task.
    pub fn active_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Run until cancelled, then drain workers and release the pid file.
    pub async fn run(mut self) -> Result<()> {
        let pid_file = PidFile::acquire(&self.options.pid_path).await?;
        info!(
            pid = pid_file.pid(),
            poll_interval_secs = self.options.poll_interval.as_secs(),
            budget_mb = self.options.budget_mb,
            "Daemon started"
        );

        let result = self.run_loop().await;
        if let Err(e) = &result {
            error!(error = %e, "Daemon loop stopped with an error");
        }
        self.drain().await;
        pid_file.release().await?;
        info!("Daemon stopped");
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        self.recover_interrupted().await?;
        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }
            self.tick(Utc::now()).await;
            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }
        Ok(())
    }

    /// Fail every job still marked `running`. Only call while holding the
    /// pid file: no live daemon owns those jobs.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for job in self.jobs.list().await? {
            let owned_here = self.active.lock().contains(&job.id);
            if job.status != JobStatus::Running || owned_here {
                continue;
            }
            self.jobs
                .update_status(&job.id, JobStatus::Failed, StatusUpdate::error(INTERRUPTED_ERROR))
                .await?;
            recovered += 1;
        }
        if recovered > 0 {
            warn!(count = recovered, "Failed jobs interrupted by a previous daemon");
        }
        Ok(recovered)
    }

    /// One Heartbeat → Dispatch → Idle-Rollup pass. Failures are logged and
    /// the loop carries on.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        match self.heartbeat.run(now).await {
            Ok(heartbeat) => report.heartbeat = Some(heartbeat),
            Err(e) => warn!(error = %e, "Heartbeat failed"),
        }

        match self.dispatch().await {
            Ok(dispatched) => report.dispatched = dispatched,
            Err(e) => warn!(error = %e, "Dispatch failed"),
        }

        match self.idle_rollup().await {
            Ok(rollup) => report.rollup = rollup,
            Err(e) => warn!(error = %e, "Idle rollup failed"),
        }

        report
    }

    fn reap(&mut self) {
        while let Some(result) = self.workers.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
    }

    /// Start workers for queued jobs up to the current slot capacity.
    pub async fn dispatch(&mut self) -> Result<usize> {
        self.reap();
        let max_workers = self.arbiter.capacity(self.options.budget_mb);
        let mut dispatched = 0;

        for queued in self.jobs.list_queued().await? {
            {
                let active = self.active.lock();
                if active.len() >= max_workers {
                    break;
                }
                if active.contains(&queued.id) {
                    continue;
                }
            }

            // The listing may be stale; only a job still queued on disk is taken.
            let job = match self.jobs.get(&queued.id).await {
                Ok(job) if job.status == JobStatus::Queued => job,
                Ok(_) => continue,
                Err(e) => {
                    warn!(job_id = %queued.id, error = %e, "Failed to re-read queued job");
                    continue;
                }
            };
            let job = match self
                .jobs
                .update_status(&job.id, JobStatus::Running, StatusUpdate::none())
                .await
            {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Failed to start job");
                    continue;
                }
            };

            self.active.lock().insert(job.id.clone());
            let guard = ActiveGuard {
                active: self.active.clone(),
                job_id: job.id.clone(),
            };
            let worker = self.worker.clone();
            debug!(job_id = %job.id, session_id = ?job.session_id(), "Dispatching job");
            self.workers.spawn(async move {
                let _guard = guard;
                worker.run(job).await;
            });
            dispatched += 1;
        }

        if dispatched > 0 {
            info!(dispatched, max_workers, active = self.active.lock().len(), "Dispatched jobs");
        }
        Ok(dispatched)
    }

    /// Resolve pending rollups once no session work is queued or running.
    pub async fn idle_rollup(&self) -> Result<Option<RollupReport>> {
        let busy = !self.active.lock().is_empty();
        if busy || !self.jobs.list_queued().await?.is_empty() {
            return Ok(None);
        }

        let mut state = self.state.load().await?;
        let mut report = None;
        if state.has_pending() {
            let pass = self
                .rollup
                .run(&state.pending_user_emails, &state.pending_group_ids, false)
                .await;
            state = self
                .state
                .clear_pending(&pass.cleared_users, &pass.cleared_groups)
                .await?;
            report = Some(pass.report);
        }

        if !state.has_pending()
            && state.backfill_started_at.is_some()
            && state.backfill_completed_at.is_none()
        {
            let completed = Utc::now();
            self.state
                .update(|state| {
                    if state.backfill_completed_at.is_none() {
                        state.backfill_completed_at = Some(completed);
                    }
                })
                .await?;
            info!(completed_at = %completed, "Backfill complete");
        }
        Ok(report)
    }

    /// Wait for every worker task to finish.
    pub async fn drain(&mut self) {
        if !self.workers.is_empty() {
            info!(workers = self.workers.len(), "Waiting for workers to finish");
        }
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
    }
}
