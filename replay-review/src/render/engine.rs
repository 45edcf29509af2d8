//! Headless browser playback driver.
//!
//! The player is an external program. It receives the path of a JSON manifest
//! (events, speed plan, viewport, output path) as its last argument and
//! reports on stdout, one JSON object per line:
//!
//! ```text
//! {"type":"progress","videoTime":12.5}
//! {"type":"finished"}
//! {"type":"error","message":"..."}
//! ```

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use super::LogSender;
use super::events::ReplayEvent;
use super::segments::PlannedSegment;
use crate::config::RenderConfig;
use crate::jobs::JobLogEntry;
use crate::utils::fs;
use crate::{Error, Result};

/// Grace period for the player to exit after reporting `finished`.
const EXIT_GRACE: Duration = Duration::from_secs(30);
/// Minimum interval between progress lines forwarded to the job log.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);
/// Stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

/// Everything the player needs for one playback.
#[derive(Debug, Clone)]
pub struct PlaybackJob {
    pub session_id: String,
    pub events: Vec<ReplayEvent>,
    pub segments: Vec<PlannedSegment>,
    pub skip_multiplier: f64,
    pub min_speed_floor: f64,
    pub expected_duration: f64,
    pub work_dir: PathBuf,
    pub output_path: PathBuf,
    pub timeout: Duration,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Viewport {
    width: u32,
    height: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlayerManifest<'a> {
    session_id: &'a str,
    events: &'a [ReplayEvent],
    segments: &'a [PlannedSegment],
    skip_multiplier: f64,
    min_speed_floor: f64,
    viewport: Viewport,
    fps: u32,
    output_path: &'a Path,
}

/// A line reported by the player.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PlayerMessage {
    Progress {
        #[serde(rename = "videoTime")]
        video_time: f64,
    },
    Finished,
    Error {
        message: String,
    },
}

/// Plays a recording into a video file.
#[async_trait]
pub trait ReplayEngine: Send + Sync {
    /// Play `job` to completion, writing the video to `job.output_path`.
    async fn play(&self, job: &PlaybackJob, log_tx: Option<&LogSender>) -> Result<()>;
}

/// Drives the configured headless browser player command.
pub struct BrowserReplayEngine {
    command: Vec<String>,
    viewport_width: u32,
    viewport_height: u32,
    fps: u32,
}

impl BrowserReplayEngine {
    pub fn new(command: Vec<String>, viewport_width: u32, viewport_height: u32, fps: u32) -> Self {
        Self {
            command,
            viewport_width,
            viewport_height,
            fps,
        }
    }

    pub fn from_config(config: &RenderConfig) -> Self {
        Self::new(
            config.player_command.clone(),
            config.viewport_width,
            config.viewport_height,
            config.fps,
        )
    }

    async fn write_manifest(&self, job: &PlaybackJob) -> Result<PathBuf> {
        let manifest = PlayerManifest {
            session_id: &job.session_id,
            events: &job.events,
            segments: &job.segments,
            skip_multiplier: job.skip_multiplier,
            min_speed_floor: job.min_speed_floor,
            viewport: Viewport {
                width: self.viewport_width,
                height: self.viewport_height,
            },
            fps: self.fps,
            output_path: &job.output_path,
        };
        let path = job.work_dir.join("manifest.json");
        fs::write_json_atomic(&path, &manifest).await?;
        Ok(path)
    }
}

fn stderr_tail(tail: &Mutex<VecDeque<String>>) -> String {
    tail.lock().iter().cloned().collect::<Vec<_>>().join("\n")
}

#[async_trait]
impl ReplayEngine for BrowserReplayEngine {
    async fn play(&self, job: &PlaybackJob, log_tx: Option<&LogSender>) -> Result<()> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(Error::config("player command is empty"));
        };

        fs::ensure_dir_all(&job.work_dir).await?;
        let manifest_path = self.write_manifest(job).await?;

        let mut cmd = process_utils::tokio_command(program);
        cmd.args(args)
            .arg(&manifest_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(
            session_id = %job.session_id,
            events = job.events.len(),
            expected_secs = job.expected_duration,
            timeout_secs = job.timeout.as_secs(),
            "Starting replay player"
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::render(format!("failed to spawn player {program}: {e}")))?;

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let tail = tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("player stderr: {}", line);
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::render("player stdout was not captured"))?;

        let watch = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut last_logged: Option<Instant> = None;
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| Error::render(format!("reading player output: {e}")))?
            {
                let message = match serde_json::from_str::<PlayerMessage>(line.trim()) {
                    Ok(message) => message,
                    Err(_) => {
                        debug!("player stdout: {}", line);
                        continue;
                    }
                };
                match message {
                    PlayerMessage::Progress { video_time } => {
                        debug!(session_id = %job.session_id, video_time, "Player progress");
                        let due = last_logged.is_none_or(|t| t.elapsed() >= PROGRESS_LOG_INTERVAL);
                        if due && let Some(tx) = log_tx {
                            let _ = tx.send(JobLogEntry::info(format!(
                                "Rendering: {:.1}s of ~{:.1}s",
                                video_time, job.expected_duration
                            )));
                            last_logged = Some(Instant::now());
                        }
                    }
                    PlayerMessage::Finished => return Ok(()),
                    PlayerMessage::Error { message } => {
                        return Err(Error::render(format!("player reported error: {message}")));
                    }
                }
            }
            Err(Error::render("player exited without a finished signal"))
        };

        let outcome = match tokio::time::timeout(job.timeout, watch).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    session_id = %job.session_id,
                    timeout_secs = job.timeout.as_secs(),
                    "Replay player timed out, killing it"
                );
                let _ = child.kill().await;
                return Err(Error::RenderTimeout {
                    secs: job.timeout.as_secs(),
                });
            }
        };

        if let Err(e) = outcome {
            let _ = child.kill().await;
            let tail = stderr_tail(&tail);
            return Err(if tail.is_empty() {
                e
            } else {
                Error::render(format!("{e}; stderr: {tail}"))
            });
        }

        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) if !status.success() => {
                warn!(session_id = %job.session_id, %status, "Player exited with failure after finishing");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(session_id = %job.session_id, error = %e, "Failed to wait for player"),
            Err(_) => {
                warn!(session_id = %job.session_id, "Player did not exit after finishing, killing it");
                let _ = child.kill().await;
            }
        }

        if !tokio::fs::try_exists(&job.output_path).await.unwrap_or(false) {
            return Err(Error::render(format!(
                "player finished but produced no video at {}",
                job.output_path.display()
            )));
        }
        Ok(())
    }
}
