//! End-to-end render of one recording: plan, play, post-process, upload.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::LogSender;
use super::engine::{PlaybackJob, ReplayEngine};
use super::events::EventTimeline;
use super::segments::{SegmentPlan, render_timeout};
use super::video::VideoTools;
use crate::config::RenderConfig;
use crate::jobs::JobLogEntry;
use crate::storage::{self, ObjectStore, UploadProgress};
use crate::utils::fs;
use crate::Result;

/// Tunables for one render.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub skip_threshold_ms: i64,
    pub skip_multiplier: f64,
    pub base_speed: f64,
    pub min_inactive_speed: f64,
    pub timeout_floor_secs: u64,
    pub timeout_buffer_secs: u64,
    pub trim_black_intro: bool,
}

impl From<&RenderConfig> for RenderOptions {
    fn from(config: &RenderConfig) -> Self {
        Self {
            skip_threshold_ms: config.skip_threshold_ms,
            skip_multiplier: config.skip_multiplier,
            base_speed: config.base_speed,
            min_inactive_speed: config.min_inactive_speed,
            timeout_floor_secs: config.timeout_floor_secs,
            timeout_buffer_secs: config.timeout_buffer_secs,
            trim_black_intro: config.trim_black_intro,
        }
    }
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self::from(&RenderConfig::default())
    }
}

/// Result of a successful render.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOutput {
    /// Local copy of the final video, inside `work_dir`.
    pub video_path: PathBuf,
    /// Seconds, as probed from the final file.
    pub video_duration: f64,
    pub video_uri: String,
    /// Scratch directory of this render; removable once the output is consumed.
    pub work_dir: PathBuf,
}

/// Probing and trimming of the rendered file.
#[async_trait]
pub trait VideoPostProcessor: Send + Sync {
    async fn probe_duration(&self, path: &Path) -> Result<f64>;

    /// Path of the video to keep, trimmed or not.
    async fn trim_black_intro(&self, path: &Path) -> Result<PathBuf>;
}

#[async_trait]
impl VideoPostProcessor for VideoTools {
    async fn probe_duration(&self, path: &Path) -> Result<f64> {
        VideoTools::probe_duration(self, path).await
    }

    async fn trim_black_intro(&self, path: &Path) -> Result<PathBuf> {
        VideoTools::trim_black_intro(self, path).await
    }
}

pub struct ReplayRenderer {
    engine: Arc<dyn ReplayEngine>,
    post: Arc<dyn VideoPostProcessor>,
    store: Arc<dyn ObjectStore>,
    work_root: PathBuf,
    options: RenderOptions,
}

impl ReplayRenderer {
    pub fn new(
        engine: Arc<dyn ReplayEngine>,
        post: Arc<dyn VideoPostProcessor>,
        store: Arc<dyn ObjectStore>,
        work_root: impl Into<PathBuf>,
        options: RenderOptions,
    ) -> Self {
        Self {
            engine,
            post,
            store,
            work_root: work_root.into(),
            options,
        }
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    /// Render `timeline` to video and upload it under `videos/{sessionId}.mp4`.
    ///
    /// An empty timeline still plays; the player records an empty replay.
    /// On failure the scratch directory is removed; on success the caller
    /// owns `RenderOutput::work_dir`.
    pub async fn render(
        &self,
        session_id: &str,
        timeline: &EventTimeline,
        log_tx: Option<&LogSender>,
    ) -> Result<RenderOutput> {
        let work_dir = self
            .work_root
            .join(fs::file_key(session_id))
            .join(uuid::Uuid::new_v4().simple().to_string());

        let result = self.render_in(session_id, timeline, &work_dir, log_tx).await;
        if result.is_err()
            && let Err(e) = tokio::fs::remove_dir_all(&work_dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %work_dir.display(), error = %e, "Failed to clean up render work dir");
        }
        result
    }

    async fn render_in(
        &self,
        session_id: &str,
        timeline: &EventTimeline,
        work_dir: &Path,
        log_tx: Option<&LogSender>,
    ) -> Result<RenderOutput> {
        let opts = &self.options;
        let plan = SegmentPlan::from_timeline(timeline, opts.skip_threshold_ms, opts.skip_multiplier);
        let expected = plan.expected_video_duration();
        let timeout = render_timeout(expected, opts.timeout_floor_secs, opts.timeout_buffer_secs);

        info!(
            session_id,
            events = timeline.len(),
            segments = plan.segments().len(),
            expected_secs = expected,
            "Rendering session"
        );
        send_log(
            log_tx,
            format!(
                "Rendering {} events in {} segments (~{:.1}s of video)",
                timeline.len(),
                plan.segments().len(),
                expected
            ),
        );

        let job = PlaybackJob {
            session_id: session_id.to_string(),
            events: timeline.events().to_vec(),
            segments: plan.speed_plan(opts.base_speed, opts.min_inactive_speed),
            skip_multiplier: plan.skip_multiplier(),
            min_speed_floor: opts.min_inactive_speed,
            expected_duration: expected,
            work_dir: work_dir.to_path_buf(),
            output_path: work_dir.join("replay.mp4"),
            timeout,
        };
        self.engine.play(&job, log_tx).await?;

        let video_path = if opts.trim_black_intro {
            self.post.trim_black_intro(&job.output_path).await?
        } else {
            job.output_path.clone()
        };
        let video_duration = self.post.probe_duration(&video_path).await?;
        debug!(session_id, video_duration, "Probed rendered video");

        let video_uri = self.upload(session_id, &video_path, log_tx).await?;
        send_log(log_tx, format!("Uploaded video ({video_duration:.1}s) to {video_uri}"));

        Ok(RenderOutput {
            video_path,
            video_duration,
            video_uri,
            work_dir: work_dir.to_path_buf(),
        })
    }

    async fn upload(&self, session_id: &str, path: &Path, log_tx: Option<&LogSender>) -> Result<String> {
        let (tx, mut rx) = watch::channel(UploadProgress::default());
        let reporter = log_tx.cloned().map(|log_tx| {
            tokio::spawn(async move {
                let mut next_quarter = 1u32;
                while rx.changed().await.is_ok() {
                    let fraction = rx.borrow_and_update().fraction();
                    if next_quarter <= 4 && fraction >= f64::from(next_quarter) * 0.25 {
                        let _ = log_tx.send(JobLogEntry::info(format!(
                            "Uploading video: {:.0}%",
                            fraction * 100.0
                        )));
                        next_quarter = (fraction * 4.0).floor() as u32 + 1;
                    }
                }
            })
        });

        let result = self
            .store
            .put_file(&storage::video_key(session_id), path, Some(&tx))
            .await;
        drop(tx);
        if let Some(reporter) = reporter {
            let _ = reporter.await;
        }
        result
    }
}

fn send_log(log_tx: Option<&LogSender>, message: String) {
    if let Some(tx) = log_tx {
        let _ = tx.send(JobLogEntry::info(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::render::events::ReplayEvent;
    use crate::storage::LocalObjectStore;
    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeEngine {
        played: Mutex<Vec<PlaybackJob>>,
        fail: bool,
    }

    #[async_trait]
    impl ReplayEngine for FakeEngine {
        async fn play(&self, job: &PlaybackJob, _log_tx: Option<&LogSender>) -> Result<()> {
            self.played.lock().push(job.clone());
            if self.fail {
                return Err(Error::render("tab crashed"));
            }
            fs::ensure_dir_all(&job.work_dir).await?;
            tokio::fs::write(&job.output_path, b"video").await?;
            Ok(())
        }
    }

    struct FakePost;

    #[async_trait]
    impl VideoPostProcessor for FakePost {
        async fn probe_duration(&self, _path: &Path) -> Result<f64> {
            Ok(12.5)
        }

        async fn trim_black_intro(&self, path: &Path) -> Result<PathBuf> {
            Ok(path.to_path_buf())
        }
    }

    fn timeline() -> EventTimeline {
        EventTimeline::from_events(vec![
            ReplayEvent::new(4, 0, json!({})),
            ReplayEvent::new(3, 1_000, json!({"source": 2})),
            ReplayEvent::new(3, 600_000, json!({"source": 2})),
            ReplayEvent::new(4, 605_000, json!({})),
        ])
    }

    fn renderer(dir: &TempDir, engine: Arc<FakeEngine>) -> ReplayRenderer {
        ReplayRenderer::new(
            engine,
            Arc::new(FakePost),
            Arc::new(LocalObjectStore::new(dir.path().join("store"))),
            dir.path().join("work"),
            RenderOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_render_plays_and_uploads() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let out = renderer(&dir, engine.clone())
            .render("s1", &timeline(), Some(&tx))
            .await
            .unwrap();

        assert_eq!(out.video_duration, 12.5);
        assert!(out.video_uri.ends_with("videos/s1.mp4"));
        assert!(dir.path().join("store/videos/s1.mp4").exists());
        assert!(out.video_path.starts_with(&out.work_dir));

        let played = engine.played.lock();
        assert_eq!(played.len(), 1);
        assert_eq!(played[0].segments.len(), 3);
        assert_eq!(played[0].timeout, render_timeout(played[0].expected_duration, 120, 60));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_failed_render_cleans_work_dir() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine {
            fail: true,
            ..FakeEngine::default()
        });

        let err = renderer(&dir, engine).render("s1", &timeline(), None).await.unwrap_err();
        assert!(matches!(err, Error::Render(_)));
        let leftovers = std::fs::read_dir(dir.path().join("work").join("s1"))
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_unparseable_dump_still_plays_and_uploads() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let timeline = EventTimeline::parse("not json at all");
        assert!(timeline.is_empty());

        let out = renderer(&dir, engine.clone())
            .render("s1", &timeline, None)
            .await
            .unwrap();

        assert!(dir.path().join("store/videos/s1.mp4").exists());
        assert!(out.video_uri.ends_with("videos/s1.mp4"));

        let played = engine.played.lock();
        assert_eq!(played.len(), 1);
        assert!(played[0].events.is_empty());
        assert!(played[0].segments.is_empty());
        assert_eq!(played[0].expected_duration, 0.0);
        assert_eq!(played[0].timeout, render_timeout(0.0, 120, 60));
    }
}
