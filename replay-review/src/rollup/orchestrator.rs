//! Ordered, hash-idempotent aggregation: sessions → users → groups.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::model::{GroupRollup, UserRollup, analysis_hash};
use super::store::AnalysisStore;
use crate::Result;
use crate::inference::Analyzer;
use crate::jobs::{JobRecord, JobStore};

/// What happened to one rollup target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupOutcome {
    /// Inference ran and a new artifact was written.
    Resolved,
    /// Nothing to aggregate; resolved without inference.
    Empty,
    /// Children unchanged since the stored artifact.
    Unchanged,
    /// Some child is still in flight; try again later.
    NotReady,
}

/// Summary of one pass over the pending targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RollupReport {
    pub users_resolved: usize,
    pub users_skipped: usize,
    pub users_failed: usize,
    pub users_deferred: usize,
    pub groups_resolved: usize,
    pub groups_skipped: usize,
    pub groups_failed: usize,
    pub groups_deferred: usize,
}

impl RollupReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Result of [`RollupOrchestrator::run`]: the report plus the targets that
/// can leave the pending lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollupPass {
    pub report: RollupReport,
    pub cleared_users: Vec<String>,
    pub cleared_groups: Vec<String>,
}

pub struct RollupOrchestrator {
    analyses: Arc<AnalysisStore>,
    jobs: Arc<JobStore>,
    analyzer: Arc<dyn Analyzer>,
}

fn in_flight(job: &JobRecord) -> bool {
    !job.status.is_terminal()
}

impl RollupOrchestrator {
    pub fn new(analyses: Arc<AnalysisStore>, jobs: Arc<JobStore>, analyzer: Arc<dyn Analyzer>) -> Self {
        Self {
            analyses,
            jobs,
            analyzer,
        }
    }

    /// Non-terminal session jobs, decoded.
    async fn unfinished_recordings(&self) -> Result<Vec<crate::source::Recording>> {
        Ok(self
            .jobs
            .list()
            .await?
            .iter()
            .filter(|job| in_flight(job))
            .filter_map(|job| job.session_payload())
            .map(|payload| payload.recording)
            .collect())
    }

    /// Aggregate `email`'s analyzed sessions.
    pub async fn resolve_user(&self, email: &str, force: bool) -> Result<RollupOutcome> {
        let unfinished = self.unfinished_recordings().await?;
        if unfinished.iter().any(|r| r.user_email() == Some(email)) {
            debug!(email, "User has sessions in flight, deferring rollup");
            return Ok(RollupOutcome::NotReady);
        }
        self.aggregate_user(email, force).await
    }

    async fn aggregate_user(&self, email: &str, force: bool) -> Result<RollupOutcome> {
        let sessions = self.analyses.sessions_for_user(email).await?;
        if sessions.is_empty() {
            debug!(email, "No analyzed sessions, nothing to aggregate");
            return Ok(RollupOutcome::Empty);
        }

        let session_ids: Vec<String> = sessions.iter().map(|s| s.session_id.clone()).collect();
        let hash = analysis_hash(&session_ids);
        if !force
            && let Some(existing) = self.analyses.get_user(email).await?
            && existing.analysis_hash == hash
        {
            debug!(email, "User rollup unchanged");
            return Ok(RollupOutcome::Unchanged);
        }

        let insight = self.analyzer.summarize_user(email, &sessions).await?;
        let group_id = sessions.iter().rev().find_map(|s| s.group_id.clone());
        self.analyses
            .put_user(&UserRollup {
                email: email.to_string(),
                group_id,
                analysis_hash: hash,
                session_ids,
                insight,
                updated_at: Utc::now(),
            })
            .await?;
        info!(email, sessions = sessions.len(), "User rollup updated");
        Ok(RollupOutcome::Resolved)
    }

    /// Aggregate `group_id`'s user rollups. `pending_users` are users whose
    /// own rollup is still outstanding.
    pub async fn resolve_group(
        &self,
        group_id: &str,
        pending_users: &[String],
        force: bool,
    ) -> Result<RollupOutcome> {
        let unfinished = self.unfinished_recordings().await?;
        if unfinished.iter().any(|r| r.group_id() == Some(group_id)) {
            debug!(group_id, "Group has sessions in flight, deferring rollup");
            return Ok(RollupOutcome::NotReady);
        }
        for email in pending_users {
            let belongs = match self.analyses.get_user(email).await? {
                Some(rollup) => rollup.group_id.as_deref() == Some(group_id),
                None => self
                    .analyses
                    .sessions_for_user(email)
                    .await?
                    .iter()
                    .any(|s| s.group_id.as_deref() == Some(group_id)),
            };
            if belongs {
                debug!(group_id, email = %email, "Member user still pending, deferring rollup");
                return Ok(RollupOutcome::NotReady);
            }
        }

        let users = self.analyses.users_in_group(group_id).await?;
        if users.is_empty() {
            debug!(group_id, "No user rollups, nothing to aggregate");
            return Ok(RollupOutcome::Empty);
        }

        let hash = analysis_hash(users.iter().map(|u| u.analysis_hash.as_str()));
        if !force
            && let Some(existing) = self.analyses.get_group(group_id).await?
            && existing.analysis_hash == hash
        {
            debug!(group_id, "Group rollup unchanged");
            return Ok(RollupOutcome::Unchanged);
        }

        let insight = self.analyzer.summarize_group(group_id, &users).await?;
        self.analyses
            .put_group(&GroupRollup {
                group_id: group_id.to_string(),
                analysis_hash: hash,
                user_emails: users.iter().map(|u| u.email.clone()).collect(),
                insight,
                updated_at: Utc::now(),
            })
            .await?;
        info!(group_id, users = users.len(), "Group rollup updated");
        Ok(RollupOutcome::Resolved)
    }

    /// Resolve every pending user, then every pending group.
    ///
    /// Failed and not-ready targets are left out of the cleared lists so they
    /// are retried on the next pass.
    pub async fn run(&self, users: &[String], groups: &[String], force: bool) -> RollupPass {
        let mut pass = RollupPass::default();
        let mut still_pending = Vec::new();

        for email in dedupe(users) {
            match self.resolve_user(email, force).await {
                Ok(RollupOutcome::Resolved | RollupOutcome::Empty) => {
                    pass.report.users_resolved += 1;
                    pass.cleared_users.push(email.to_string());
                }
                Ok(RollupOutcome::Unchanged) => {
                    pass.report.users_skipped += 1;
                    pass.cleared_users.push(email.to_string());
                }
                Ok(RollupOutcome::NotReady) => {
                    pass.report.users_deferred += 1;
                    still_pending.push(email.to_string());
                }
                Err(e) => {
                    warn!(email, error = %e, "User rollup failed, will retry");
                    pass.report.users_failed += 1;
                    still_pending.push(email.to_string());
                }
            }
        }

        for group_id in dedupe(groups) {
            match self.resolve_group(group_id, &still_pending, force).await {
                Ok(RollupOutcome::Resolved | RollupOutcome::Empty) => {
                    pass.report.groups_resolved += 1;
                    pass.cleared_groups.push(group_id.to_string());
                }
                Ok(RollupOutcome::Unchanged) => {
                    pass.report.groups_skipped += 1;
                    pass.cleared_groups.push(group_id.to_string());
                }
                Ok(RollupOutcome::NotReady) => pass.report.groups_deferred += 1,
                Err(e) => {
                    warn!(group_id, error = %e, "Group rollup failed, will retry");
                    pass.report.groups_failed += 1;
                }
            }
        }

        if !pass.report.is_empty() {
            info!(report = ?pass.report, "Rollup pass finished");
        }
        pass
    }
}

fn dedupe(items: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    items
        .iter()
        .map(String::as_str)
        .filter(|item| seen.insert(*item))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_keeps_first_occurrence_order() {
        let items = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(dedupe(&items), vec!["b", "a"]);
    }

    #[test]
    fn test_report_is_empty() {
        assert!(RollupReport::default().is_empty());
        let report = RollupReport {
            groups_failed: 1,
            ..RollupReport::default()
        };
        assert!(!report.is_empty());
    }
}
