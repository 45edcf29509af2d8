//! Replay rendering.
//!
//! A recording's rrweb events are parsed into a timeline, split into active
//! and inactive segments, played through a headless browser player into a
//! video, post-processed with ffmpeg and uploaded.

pub mod engine;
pub mod events;
pub mod renderer;
pub mod segments;
pub mod video;

use tokio::sync::mpsc;

use crate::jobs::JobLogEntry;

/// Channel for progress lines destined for a job's log.
pub type LogSender = mpsc::UnboundedSender<JobLogEntry>;

pub use engine::{BrowserReplayEngine, PlaybackJob, PlayerMessage, ReplayEngine};
pub use events::{EventTimeline, ReplayEvent};
pub use renderer::{RenderOptions, RenderOutput, ReplayRenderer, VideoPostProcessor};
pub use segments::{PlannedSegment, Segment, SegmentPlan, compute_segments, render_timeout};
pub use video::{BlackSegment, VideoTools};
