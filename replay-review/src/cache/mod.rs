//! Render cache.
//!
//! Rendering is expensive, so each session is rendered at most once. The
//! cache entry (`cache/{sessionId}.json`) is checked before a render slot is
//! requested and again once it is held; renders of the same session inside
//! one process are additionally serialized.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::Result;
use crate::render::{EventTimeline, LogSender, ReplayRenderer};
use crate::slots::SlotArbiter;
use crate::source::RecordingSource;
use crate::storage::{self, ObjectStore};
use crate::utils::fs;
use crate::utils::json::{self, JsonContext};

/// A session's rendered artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedSession {
    pub session_id: String,
    pub events_uri: String,
    pub video_uri: String,
    pub video_duration: f64,
    pub rendered_at: DateTime<Utc>,
}

/// Produces a session's rendered artifacts.
#[async_trait]
pub trait SessionRenderer: Send + Sync {
    async fn render_session(
        &self,
        session_id: &str,
        log_tx: Option<&LogSender>,
    ) -> Result<RenderedSession>;
}

/// Fetch events, upload them, render the video and upload it.
pub struct ReplayPipeline {
    source: Arc<dyn RecordingSource>,
    store: Arc<dyn ObjectStore>,
    renderer: ReplayRenderer,
}

impl ReplayPipeline {
    pub fn new(
        source: Arc<dyn RecordingSource>,
        store: Arc<dyn ObjectStore>,
        renderer: ReplayRenderer,
    ) -> Self {
        Self {
            source,
            store,
            renderer,
        }
    }
}

#[async_trait]
impl SessionRenderer for ReplayPipeline {
    async fn render_session(
        &self,
        session_id: &str,
        log_tx: Option<&LogSender>,
    ) -> Result<RenderedSession> {
        let raw = self.source.fetch_events(session_id).await?;
        let timeline = EventTimeline::parse(&raw);
        debug!(session_id, bytes = raw.len(), events = timeline.len(), "Fetched events");

        let events_uri = self
            .store
            .put_bytes(&storage::events_key(session_id), Bytes::from(raw))
            .await?;

        let output = self.renderer.render(session_id, &timeline, log_tx).await?;
        if let Err(e) = tokio::fs::remove_dir_all(&output.work_dir).await {
            warn!(path = %output.work_dir.display(), error = %e, "Failed to remove render work dir");
        }

        Ok(RenderedSession {
            session_id: session_id.to_string(),
            events_uri,
            video_uri: output.video_uri,
            video_duration: output.video_duration,
            rendered_at: Utc::now(),
        })
    }
}

/// Session-id keyed cache in front of a [`SessionRenderer`].
pub struct RenderCache {
    dir: PathBuf,
    arbiter: Arc<SlotArbiter>,
    renderer: Arc<dyn SessionRenderer>,
    budget_mb: u64,
    inflight: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RenderCache {
    pub fn new(
        dir: impl Into<PathBuf>,
        arbiter: Arc<SlotArbiter>,
        renderer: Arc<dyn SessionRenderer>,
        budget_mb: u64,
    ) -> Self {
        Self {
            dir: dir.into(),
            arbiter,
            renderer,
            budget_mb,
            inflight: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn entry_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", fs::file_key(session_id)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cached entry, if any. A corrupt entry counts as a miss.
    pub async fn get(&self, session_id: &str) -> Result<Option<RenderedSession>> {
        let path = self.entry_path(session_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(fs::io_error("reading cache entry", &path, e)),
        };
        Ok(json::parse_bytes(
            &bytes,
            JsonContext::CacheEntry { session_id },
            "Ignoring corrupt render cache entry",
        ))
    }

    /// Drop a cached entry. Returns whether one existed.
    pub async fn invalidate(&self, session_id: &str) -> Result<bool> {
        let removed = fs::remove_file_if_exists(&self.entry_path(session_id)).await?;
        if removed {
            info!(session_id, "Invalidated render cache entry");
        }
        Ok(removed)
    }

    /// Return the cached render, rendering under a slot on a miss.
    pub async fn ensure_rendered(
        &self,
        session_id: &str,
        log_tx: Option<&LogSender>,
    ) -> Result<RenderedSession> {
        if let Some(hit) = self.get(session_id).await? {
            debug!(session_id, "Render cache hit");
            return Ok(hit);
        }

        let lock = self
            .inflight
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .clone();
        let result = {
            let _serial = lock.lock().await;
            self.render_under_slot(session_id, log_tx).await
        };

        let mut inflight = self.inflight.lock();
        if Arc::strong_count(&lock) == 2 {
            inflight.remove(session_id);
        }
        result
    }

    async fn render_under_slot(
        &self,
        session_id: &str,
        log_tx: Option<&LogSender>,
    ) -> Result<RenderedSession> {
        self.arbiter
            .with_slot(self.budget_mb, || async {
                if let Some(hit) = self.get(session_id).await? {
                    debug!(session_id, "Render cache filled while waiting for a slot");
                    return Ok(hit);
                }

                let rendered = self.renderer.render_session(session_id, log_tx).await?;
                fs::write_json_atomic(&self.entry_path(session_id), &rendered).await?;
                info!(
                    session_id,
                    video_uri = %rendered.video_uri,
                    video_duration = rendered.video_duration,
                    "Session rendered and cached"
                );
                Ok(rendered)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::{CapacityPolicy, FileLeaseBackend, FixedMemoryProbe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct CountingRenderer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SessionRenderer for CountingRenderer {
        async fn render_session(
            &self,
            session_id: &str,
            _log_tx: Option<&LogSender>,
        ) -> Result<RenderedSession> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(RenderedSession {
                session_id: session_id.to_string(),
                events_uri: format!("mem://events/{session_id}"),
                video_uri: format!("mem://videos/{session_id}"),
                video_duration: 9.0,
                rendered_at: Utc::now(),
            })
        }
    }

    fn cache(dir: &TempDir, renderer: Arc<CountingRenderer>) -> RenderCache {
        let arbiter = SlotArbiter::new(
            Arc::new(FileLeaseBackend::new(dir.path().join("slots"), Duration::from_secs(60))),
            Arc::new(FixedMemoryProbe::from_mb(64 * 1024)),
            CapacityPolicy::new(512, 0.9),
            Duration::from_millis(10),
        );
        RenderCache::new(dir.path().join("cache"), Arc::new(arbiter), renderer, 4096)
    }

    #[tokio::test]
    async fn test_second_call_hits_cache() {
        let dir = TempDir::new().unwrap();
        let renderer = Arc::new(CountingRenderer {
            calls: AtomicUsize::new(0),
        });
        let cache = cache(&dir, renderer.clone());

        let first = cache.ensure_rendered("s1", None).await.unwrap();
        let second = cache.ensure_rendered("s1", None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("s1").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_invalidate_forces_rerender() {
        let dir = TempDir::new().unwrap();
        let renderer = Arc::new(CountingRenderer {
            calls: AtomicUsize::new(0),
        });
        let cache = cache(&dir, renderer.clone());

        cache.ensure_rendered("s1", None).await.unwrap();
        assert!(cache.invalidate("s1").await.unwrap());
        assert!(!cache.invalidate("s1").await.unwrap());
        cache.ensure_rendered("s1", None).await.unwrap();
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let renderer = Arc::new(CountingRenderer {
            calls: AtomicUsize::new(0),
        });
        let cache = cache(&dir, renderer.clone());
        std::fs::create_dir_all(dir.path().join("cache")).unwrap();
        std::fs::write(dir.path().join("cache/s1.json"), b"{truncated").unwrap();

        assert!(cache.get("s1").await.unwrap().is_none());
        cache.ensure_rendered("s1", None).await.unwrap();
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
    }
}
