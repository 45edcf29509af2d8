//! Recording discovery.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::state::StateStore;
use crate::Result;
use crate::jobs::{JobStatus, JobStore, SESSION_JOB_TYPE, SessionJobPayload};
use crate::source::{RecordingSource, sort_chronologically};

/// Outcome of one heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeartbeatReport {
    pub fetched: usize,
    pub enqueued: usize,
    pub skipped_ongoing: usize,
    pub skipped_domain: usize,
    pub skipped_tracked: usize,
    /// Set when the listing failed; the cursor still advanced.
    pub fetch_error: Option<String>,
}

pub struct Heartbeat {
    source: Arc<dyn RecordingSource>,
    jobs: Arc<JobStore>,
    state: Arc<StateStore>,
    lookback_days: i64,
    allowed_domains: Vec<String>,
}

impl Heartbeat {
    pub fn new(
        source: Arc<dyn RecordingSource>,
        jobs: Arc<JobStore>,
        state: Arc<StateStore>,
        lookback_days: i64,
        allowed_domains: Vec<String>,
    ) -> Self {
        Self {
            source,
            jobs,
            state,
            lookback_days,
            allowed_domains,
        }
    }

    /// Pull recordings started in `[cursor, now]` and enqueue the new ones.
    ///
    /// The first run reaches back `lookback_days` and stamps
    /// `backfillStartedAt`. The cursor moves to `now` whether or not the
    /// listing succeeded.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<HeartbeatReport> {
        let state = self.state.load().await?;
        let from = match state.last_pulled_at {
            Some(cursor) => cursor,
            None => {
                let from = now - Duration::days(self.lookback_days.max(0));
                info!(from = %from, "First heartbeat, starting backfill");
                from
            }
        };

        let mut report = HeartbeatReport::default();
        match self.source.list_recordings(from).await {
            Ok(recordings) => self.enqueue_new(recordings, &mut report).await?,
            Err(e) => {
                warn!(from = %from, error = %e, "Failed to list recordings");
                report.fetch_error = Some(e.to_string());
            }
        }

        self.state
            .update(|state| {
                if state.backfill_started_at.is_none() {
                    state.backfill_started_at = Some(now);
                }
                state.last_pulled_at = Some(now);
            })
            .await?;

        if report.enqueued > 0 {
            info!(
                fetched = report.fetched,
                enqueued = report.enqueued,
                skipped_tracked = report.skipped_tracked,
                "Heartbeat enqueued recordings"
            );
        } else {
            debug!(report = ?report, "Heartbeat finished");
        }
        Ok(report)
    }

    async fn enqueue_new(
        &self,
        mut recordings: Vec<crate::source::Recording>,
        report: &mut HeartbeatReport,
    ) -> Result<()> {
        report.fetched = recordings.len();

        let tracked: HashSet<String> = self
            .jobs
            .list()
            .await?
            .iter()
            .filter(|job| job.status != JobStatus::Failed)
            .filter_map(|job| job.session_id())
            .collect();

        sort_chronologically(&mut recordings);
        let mut seen = HashSet::new();
        for recording in recordings {
            if recording.ongoing {
                report.skipped_ongoing += 1;
                continue;
            }
            if !recording.is_allowed(&self.allowed_domains) {
                debug!(session_id = %recording.id, url = %recording.start_url, "Recording outside allowed domains");
                report.skipped_domain += 1;
                continue;
            }
            if tracked.contains(&recording.id) || !seen.insert(recording.id.clone()) {
                report.skipped_tracked += 1;
                continue;
            }

            let session_id = recording.id.clone();
            let payload = serde_json::to_value(SessionJobPayload { recording })?;
            let job = self.jobs.create(SESSION_JOB_TYPE, payload).await?;
            debug!(job_id = %job.id, session_id = %session_id, "Enqueued session");
            report.enqueued += 1;
        }
        Ok(())
    }
}
