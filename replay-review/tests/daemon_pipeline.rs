//! End-to-end daemon ticks over in-memory collaborators.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use common::{FakeAnalyzer, FakeRenderer, FakeSource, arbiter, recording};
use replay_review::cache::RenderCache;
use replay_review::daemon::{
    DaemonRunner, Heartbeat, INTERRUPTED_ERROR, RunnerOptions, SessionJobResult, SessionWorker,
    StateStore,
};
use replay_review::jobs::{JobStatus, JobStore, SESSION_JOB_TYPE, SessionJobPayload, StatusUpdate};
use replay_review::rollup::{AnalysisStore, RollupOrchestrator};

struct Harness {
    dir: TempDir,
    jobs: Arc<JobStore>,
    state: Arc<StateStore>,
    analyses: Arc<AnalysisStore>,
    analyzer: Arc<FakeAnalyzer>,
    source: Arc<FakeSource>,
    renderer: Arc<FakeRenderer>,
    runner: DaemonRunner,
}

fn harness(source: FakeSource, renderer: FakeRenderer) -> Harness {
    let dir = TempDir::new().unwrap();
    let jobs = Arc::new(JobStore::new(dir.path().join("jobs")));
    let state = Arc::new(StateStore::new(dir.path().join("state/daemon.json")));
    let analyses = Arc::new(AnalysisStore::new(dir.path().join("analysis")));
    let analyzer = Arc::new(FakeAnalyzer::default());
    let renderer = Arc::new(renderer);
    let source = Arc::new(source);
    let arbiter = Arc::new(arbiter(&dir.path().join("slots")));

    let cache = Arc::new(RenderCache::new(
        dir.path().join("cache"),
        arbiter.clone(),
        renderer.clone(),
        4096,
    ));
    let worker = Arc::new(SessionWorker::new(
        jobs.clone(),
        cache,
        analyzer.clone(),
        analyses.clone(),
        state.clone(),
    ));
    let heartbeat = Heartbeat::new(source.clone(), jobs.clone(), state.clone(), 3, Vec::new());
    let rollup = RollupOrchestrator::new(analyses.clone(), jobs.clone(), analyzer.clone());

    let runner = DaemonRunner::new(
        jobs.clone(),
        state.clone(),
        arbiter,
        heartbeat,
        worker,
        rollup,
        RunnerOptions {
            poll_interval: Duration::from_millis(50),
            budget_mb: 4096,
            pid_path: dir.path().join("daemon.pid"),
        },
    );

    Harness {
        dir,
        jobs,
        state,
        analyses,
        analyzer,
        source,
        renderer,
        runner,
    }
}

fn job_for<'a>(jobs: &'a [replay_review::jobs::JobRecord], session_id: &str) -> &'a replay_review::jobs::JobRecord {
    jobs.iter()
        .find(|j| j.session_id().as_deref() == Some(session_id))
        .unwrap()
}

#[tokio::test]
async fn test_sessions_render_analyze_then_roll_up() {
    let source = FakeSource::new(vec![
        recording("s2", 10, Some("alice@acme.io"), Some("acme")),
        recording("s1", 0, Some("alice@acme.io"), Some("acme")),
        recording("s3", 5, Some("bob@acme.io"), Some("acme")),
        recording("s4", 20, Some("carol@solo.io"), None),
    ]);
    let mut h = harness(source, FakeRenderer::new(Duration::from_millis(50)).failing_on("s4"));

    let first = h.runner.tick(Utc::now()).await;
    assert_eq!(first.heartbeat.as_ref().unwrap().enqueued, 4);
    assert_eq!(first.dispatched, 4);

    h.runner.drain().await;
    assert!(h.runner.active_jobs().is_empty());

    let jobs = h.jobs.list().await.unwrap();
    for id in ["s1", "s2", "s3"] {
        let job = job_for(&jobs, id);
        assert_eq!(job.status, JobStatus::Complete, "job for {id}");
        let result: SessionJobResult =
            serde_json::from_value(job.result.clone().unwrap()).unwrap();
        assert_eq!(result.video_uri, format!("mem://videos/{id}.mp4"));
        assert_eq!(result.score, 8.0);
        assert!(job.logs.iter().any(|l| l.message == "Rendering replay"));
    }
    let failed = job_for(&jobs, "s4");
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("player exited"));
    assert!(h.analyses.get_session("s4").await.unwrap().is_none());

    let state = h.state.load().await.unwrap();
    assert_eq!(state.pending_group_ids, vec!["acme".to_string()]);
    assert_eq!(state.pending_user_emails.len(), 2);

    // Drop the broken recording so its failed job is not retried; with
    // nothing queued the next tick runs the rollups.
    h.source.recordings.lock().retain(|r| r.id != "s4");
    let second = h.runner.tick(Utc::now()).await;
    let rollup = second.rollup.unwrap();
    assert_eq!(rollup.users_resolved, 2);
    assert_eq!(rollup.groups_resolved, 1);

    assert_eq!(
        h.analyzer.user_calls.lock()["alice@acme.io"][0],
        vec!["s1".to_string(), "s2".to_string()]
    );
    assert_eq!(
        h.analyzer.group_calls.lock()["acme"][0],
        vec!["alice@acme.io".to_string(), "bob@acme.io".to_string()]
    );

    let state = h.state.load().await.unwrap();
    assert!(state.pending_user_emails.is_empty());
    assert!(state.pending_group_ids.is_empty());
    assert!(state.backfill_completed_at.is_some());
    assert_eq!(h.renderer.calls(), 4);
}

#[tokio::test]
async fn test_completed_sessions_are_not_enqueued_again() {
    let source = FakeSource::new(vec![recording("s1", 0, Some("a@x.io"), None)]);
    let mut h = harness(source, FakeRenderer::new(Duration::ZERO));

    h.runner.tick(Utc::now()).await;
    h.runner.drain().await;
    let again = h.runner.tick(Utc::now()).await;

    assert_eq!(again.heartbeat.unwrap().skipped_tracked, 1);
    assert_eq!(again.dispatched, 0);
    assert_eq!(h.jobs.list().await.unwrap().len(), 1);
    assert_eq!(h.renderer.calls(), 1);
}

#[tokio::test]
async fn test_jobs_left_running_are_failed_on_recovery() {
    let h = harness(FakeSource::new(Vec::new()), FakeRenderer::new(Duration::ZERO));
    let payload = serde_json::to_value(SessionJobPayload {
        recording: recording("s1", 0, None, None),
    })
    .unwrap();
    let job = h.jobs.create(SESSION_JOB_TYPE, payload).await.unwrap();
    h.jobs
        .update_status(&job.id, JobStatus::Running, StatusUpdate::none())
        .await
        .unwrap();

    assert_eq!(h.runner.recover_interrupted().await.unwrap(), 1);
    let job = h.jobs.get(&job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some(INTERRUPTED_ERROR));
}

#[tokio::test]
async fn test_run_drains_workers_and_releases_pid_file_on_cancel() {
    let source = FakeSource::new(vec![recording("s1", 0, Some("a@x.io"), None)]);
    let h = harness(source, FakeRenderer::new(Duration::from_millis(200)));
    let pid_path = h.dir.path().join("daemon.pid");
    let token = h.runner.cancellation_token();

    let handle = tokio::spawn(h.runner.run());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(pid_path.exists());

    token.cancel();
    handle.await.unwrap().unwrap();

    assert!(!pid_path.exists());
    let jobs = h.jobs.list().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Complete);
}
