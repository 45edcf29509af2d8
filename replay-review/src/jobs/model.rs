//! Job record types.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::source::Recording;
use crate::utils::json::{self, JsonContext};

/// Job type for render + analyze of one recording.
pub const SESSION_JOB_TYPE: &str = "session_analysis";

/// Maximum log entries retained per job; the oldest are dropped first.
pub const MAX_JOB_LOGS: usize = 200;

/// Job status.
///
/// Transitions are monotonic: `queued → running → {complete | failed}`, plus
/// `queued → failed` for jobs that fail before they start. Terminal states
/// are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a worker.
    Queued,
    /// Picked up by a worker.
    Running,
    /// Finished successfully.
    Complete,
    /// Finished with an error.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Complete)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log level for job logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// A single job log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
}

impl JobLogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }
}

/// A persisted job. The job's file is the sole source of truth for its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub logs: VecDeque<JobLogEntry>,
}

impl JobRecord {
    /// A fresh queued job with its seed log entry.
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        let mut logs = VecDeque::new();
        logs.push_back(JobLogEntry::info("Job created"));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            payload,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            error: None,
            result: None,
            logs,
        }
    }

    /// Append a log entry, dropping the oldest beyond [`MAX_JOB_LOGS`].
    pub fn push_log(&mut self, entry: JobLogEntry) {
        self.logs.push_back(entry);
        while self.logs.len() > MAX_JOB_LOGS {
            self.logs.pop_front();
        }
    }

    /// Time spent in `running`, if finished.
    pub fn run_duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

/// Payload of a [`SESSION_JOB_TYPE`] job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionJobPayload {
    pub recording: Recording,
}

impl JobRecord {
    /// Decode the payload of a session job. Other job types, and payloads
    /// that do not decode, yield `None`.
    pub fn session_payload(&self) -> Option<SessionJobPayload> {
        if self.job_type != SESSION_JOB_TYPE {
            return None;
        }
        json::parse_value(
            &self.payload,
            JsonContext::JobPayload {
                job_id: &self.id,
                field: "recording",
            },
            "Undecodable session job payload",
        )
    }

    /// Session id this job covers, if it is a session job.
    pub fn session_id(&self) -> Option<String> {
        self.payload
            .get("recording")
            .and_then(|r| r.get("id"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    }
}

/// Optional fields recorded alongside a status change.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl StatusUpdate {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            result: None,
        }
    }

    pub fn result(value: serde_json::Value) -> Self {
        Self {
            error: None,
            result: Some(value),
        }
    }
}

/// Per-status job tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub queued: usize,
    pub running: usize,
    pub complete: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Complete => self.complete += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.running + self.complete + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Failed));
        assert!(Running.can_transition_to(Complete));
        assert!(Running.can_transition_to(Failed));

        assert!(!Running.can_transition_to(Queued));
        assert!(!Complete.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Complete));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_new_job_shape() {
        let job = JobRecord::new(SESSION_JOB_TYPE, serde_json::json!({"x": 1}));
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.logs.len(), 1);
        assert!(job.started_at.is_none());

        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["type"], SESSION_JOB_TYPE);
        assert_eq!(json["status"], "queued");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("startedAt").is_none());
    }

    #[test]
    fn test_push_log_is_capped() {
        let mut job = JobRecord::new("t", serde_json::Value::Null);
        for i in 0..(MAX_JOB_LOGS + 10) {
            job.push_log(JobLogEntry::info(format!("line {i}")));
        }
        assert_eq!(job.logs.len(), MAX_JOB_LOGS);
        assert_eq!(
            job.logs.back().unwrap().message,
            format!("line {}", MAX_JOB_LOGS + 9)
        );
    }

    #[test]
    fn test_session_payload() {
        let recording = crate::source::test_support::recording("s1", 0, Some("a@b.co"), None);
        let payload = serde_json::to_value(SessionJobPayload {
            recording: recording.clone(),
        })
        .unwrap();
        let job = JobRecord::new(SESSION_JOB_TYPE, payload);
        assert_eq!(job.session_payload().unwrap().recording, recording);
        assert_eq!(job.session_id().as_deref(), Some("s1"));

        let other = JobRecord::new("other", serde_json::json!({"recording": 1}));
        assert!(other.session_payload().is_none());
    }

    #[test]
    fn test_counts() {
        let mut counts = JobCounts::default();
        counts.record(JobStatus::Queued);
        counts.record(JobStatus::Failed);
        counts.record(JobStatus::Failed);
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.total(), 3);
    }
}
