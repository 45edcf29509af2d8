//! Per-session job execution: render, analyze, record.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::state::StateStore;
use crate::cache::RenderCache;
use crate::inference::Analyzer;
use crate::jobs::{JobLogEntry, JobRecord, JobStatus, JobStore, StatusUpdate};
use crate::render::LogSender;
use crate::rollup::{AnalysisStore, SessionAnalysis};
use crate::{Error, Result};

/// `result` of a completed session job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionJobResult {
    pub video_uri: String,
    pub video_duration: f64,
    pub score: f64,
}

pub struct SessionWorker {
    jobs: Arc<JobStore>,
    cache: Arc<RenderCache>,
    analyzer: Arc<dyn Analyzer>,
    analyses: Arc<AnalysisStore>,
    state: Arc<StateStore>,
}

impl SessionWorker {
    pub fn new(
        jobs: Arc<JobStore>,
        cache: Arc<RenderCache>,
        analyzer: Arc<dyn Analyzer>,
        analyses: Arc<AnalysisStore>,
        state: Arc<StateStore>,
    ) -> Self {
        Self {
            jobs,
            cache,
            analyzer,
            analyses,
            state,
        }
    }

    /// Run a job already marked `running` to a terminal state.
    ///
    /// Failures are recorded on the job and never propagate.
    pub async fn run(&self, job: JobRecord) {
        let job_id = job.id.clone();
        let (log_tx, mut log_rx) = mpsc::unbounded_channel::<JobLogEntry>();

        let jobs = self.jobs.clone();
        let log_job_id = job_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(entry) = log_rx.recv().await {
                if let Err(e) = jobs
                    .append_log(&log_job_id, entry.level, entry.message)
                    .await
                {
                    warn!(job_id = %log_job_id, error = %e, "Failed to append job log");
                }
            }
        });

        let outcome = self.process(&job, &log_tx).await;
        drop(log_tx);
        if let Err(e) = forwarder.await {
            warn!(job_id = %job_id, error = %e, "Job log forwarder ended abnormally");
        }

        let outcome = outcome.and_then(|result| Ok((result.score, serde_json::to_value(&result)?)));
        let (status, update) = match outcome {
            Ok((score, value)) => {
                info!(job_id = %job_id, score, "Session job complete");
                (JobStatus::Complete, StatusUpdate::result(value))
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Session job failed");
                (JobStatus::Failed, StatusUpdate::error(e.to_string()))
            }
        };
        if let Err(e) = self.jobs.update_status(&job_id, status, update).await {
            error!(job_id = %job_id, error = %e, "Failed to record job outcome");
        }
    }

    /// Render, analyze and record one session.
    pub async fn process(&self, job: &JobRecord, log_tx: &LogSender) -> Result<SessionJobResult> {
        let recording = job
            .session_payload()
            .ok_or_else(|| Error::validation(format!("job {} has no session payload", job.id)))?
            .recording;
        let session_id = recording.id.as_str();

        let _ = log_tx.send(JobLogEntry::info(format!("Rendering session {session_id}")));
        let rendered = self.cache.ensure_rendered(session_id, Some(log_tx)).await?;

        let _ = log_tx.send(JobLogEntry::info("Analyzing session"));
        let insight = self.analyzer.analyze_session(&recording, &rendered).await?;
        let score = insight.score;

        self.analyses
            .put_session(&SessionAnalysis {
                session_id: recording.id.clone(),
                user_email: recording.user_email().map(str::to_string),
                group_id: recording.group_id().map(str::to_string),
                start_time: recording.start_time,
                video_uri: rendered.video_uri.clone(),
                insight,
                analyzed_at: Utc::now(),
            })
            .await?;
        self.state
            .mark_dirty(recording.user_email(), recording.group_id())
            .await?;
        let _ = log_tx.send(JobLogEntry::info(format!("Analysis stored (score {score})")));

        Ok(SessionJobResult {
            video_uri: rendered.video_uri,
            video_duration: rendered.video_duration,
            score,
        })
    }
}
