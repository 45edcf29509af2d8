//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use replay_review::cache::{RenderedSession, SessionRenderer};
use replay_review::inference::{AggregateInsight, Analyzer, SessionInsight};
use replay_review::jobs::JobLogEntry;
use replay_review::render::LogSender;
use replay_review::rollup::{SessionAnalysis, UserRollup};
use replay_review::slots::{CapacityPolicy, FileLeaseBackend, FixedMemoryProbe, SlotArbiter};
use replay_review::source::{Person, Recording, RecordingSource};
use replay_review::{Error, Result};

pub fn recording(id: &str, offset_secs: i64, email: Option<&str>, group: Option<&str>) -> Recording {
    let start = DateTime::<Utc>::from_timestamp(1_750_000_000 + offset_secs, 0).unwrap();
    Recording {
        id: id.to_string(),
        start_time: start,
        end_time: start + chrono::Duration::seconds(90),
        active_seconds: 60.0,
        inactive_seconds: 30.0,
        start_url: "https://app.example.com/dashboard".to_string(),
        person: Person {
            distinct_id: format!("person-{id}"),
            email: email.map(str::to_string),
            group_id: group.map(str::to_string),
        },
        ongoing: false,
    }
}

/// Arbiter over `slot_dir` that sees 64 GiB free, 512 MiB per render.
pub fn arbiter(slot_dir: &Path) -> SlotArbiter {
    SlotArbiter::new(
        Arc::new(FileLeaseBackend::new(slot_dir, Duration::from_secs(60))),
        Arc::new(FixedMemoryProbe::from_mb(64 * 1024)),
        CapacityPolicy::new(512, 0.9),
        Duration::from_millis(10),
    )
}

pub struct FakeSource {
    pub recordings: Mutex<Vec<Recording>>,
}

impl FakeSource {
    pub fn new(recordings: Vec<Recording>) -> Self {
        Self {
            recordings: Mutex::new(recordings),
        }
    }
}

#[async_trait]
impl RecordingSource for FakeSource {
    async fn list_recordings(&self, _date_from: DateTime<Utc>) -> Result<Vec<Recording>> {
        Ok(self.recordings.lock().clone())
    }

    async fn fetch_events(&self, _session_id: &str) -> Result<String> {
        Ok("[]".to_string())
    }
}

/// Renders instantly-ish; sessions in `failing` error out.
pub struct FakeRenderer {
    pub calls: AtomicUsize,
    pub delay: Duration,
    pub failing: HashSet<String>,
}

impl FakeRenderer {
    pub fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
            failing: HashSet::new(),
        }
    }

    pub fn failing_on(mut self, session_id: &str) -> Self {
        self.failing.insert(session_id.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionRenderer for FakeRenderer {
    async fn render_session(
        &self,
        session_id: &str,
        log_tx: Option<&LogSender>,
    ) -> Result<RenderedSession> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = log_tx {
            let _ = tx.send(JobLogEntry::info("Rendering replay"));
        }
        tokio::time::sleep(self.delay).await;
        if self.failing.contains(session_id) {
            return Err(Error::render("player exited without finishing"));
        }
        Ok(RenderedSession {
            session_id: session_id.to_string(),
            events_uri: format!("mem://events/{session_id}.json"),
            video_uri: format!("mem://videos/{session_id}.mp4"),
            video_duration: 12.5,
            rendered_at: Utc::now(),
        })
    }
}

/// Records what each aggregate call saw.
#[derive(Default)]
pub struct FakeAnalyzer {
    pub user_calls: Mutex<HashMap<String, Vec<Vec<String>>>>,
    pub group_calls: Mutex<HashMap<String, Vec<Vec<String>>>>,
    pub failing_users: Mutex<HashSet<String>>,
}

impl FakeAnalyzer {
    pub fn fail_user(&self, email: &str) {
        self.failing_users.lock().insert(email.to_string());
    }

    pub fn heal_user(&self, email: &str) {
        self.failing_users.lock().remove(email);
    }

    pub fn user_call_count(&self, email: &str) -> usize {
        self.user_calls.lock().get(email).map_or(0, Vec::len)
    }

    pub fn group_call_count(&self, group_id: &str) -> usize {
        self.group_calls.lock().get(group_id).map_or(0, Vec::len)
    }
}

fn aggregate(story: &str) -> AggregateInsight {
    AggregateInsight {
        story: story.to_string(),
        health: "good".to_string(),
        score: 7.0,
    }
}

#[async_trait]
impl Analyzer for FakeAnalyzer {
    async fn analyze_session(
        &self,
        recording: &Recording,
        rendered: &RenderedSession,
    ) -> Result<SessionInsight> {
        Ok(SessionInsight {
            summary: format!("{} watched at {}", recording.id, rendered.video_uri),
            health: "good".to_string(),
            score: 8.0,
            issues: Vec::new(),
            features: vec!["dashboard".to_string()],
        })
    }

    async fn summarize_user(
        &self,
        email: &str,
        analyses: &[SessionAnalysis],
    ) -> Result<AggregateInsight> {
        if self.failing_users.lock().contains(email) {
            return Err(Error::Inference("model overloaded".to_string()));
        }
        self.user_calls
            .lock()
            .entry(email.to_string())
            .or_default()
            .push(analyses.iter().map(|a| a.session_id.clone()).collect());
        Ok(aggregate(&format!("{email} story")))
    }

    async fn summarize_group(
        &self,
        group_id: &str,
        users: &[UserRollup],
    ) -> Result<AggregateInsight> {
        self.group_calls
            .lock()
            .entry(group_id.to_string())
            .or_default()
            .push(users.iter().map(|u| u.email.clone()).collect());
        Ok(aggregate(&format!("{group_id} story")))
    }
}

pub fn analysis(session_id: &str, offset_secs: i64, email: &str, group: Option<&str>) -> SessionAnalysis {
    let recording = recording(session_id, offset_secs, Some(email), group);
    SessionAnalysis {
        session_id: session_id.to_string(),
        user_email: Some(email.to_string()),
        group_id: group.map(str::to_string),
        start_time: recording.start_time,
        video_uri: format!("mem://videos/{session_id}.mp4"),
        insight: SessionInsight {
            summary: "ok".to_string(),
            health: "good".to_string(),
            score: 5.0,
            issues: Vec::new(),
            features: Vec::new(),
        },
        analyzed_at: Utc::now(),
    }
}
