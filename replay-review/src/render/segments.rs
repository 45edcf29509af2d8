//! Active/inactive segmentation and the real-time to video-time mapping.
//!
//! Long idle stretches are fast-forwarded in the rendered video. A gap
//! between consecutive interactions longer than the skip threshold becomes an
//! inactive segment that plays at the skip multiplier; everything else plays
//! at base speed. Segments are half-open `[start, end)` in epoch ms.

use std::time::Duration;

use serde::Serialize;

use super::events::EventTimeline;

/// A contiguous span of the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub start: i64,
    pub end: i64,
    pub active: bool,
}

impl Segment {
    pub fn duration_ms(&self) -> i64 {
        self.end - self.start
    }
}

/// Split `timeline` into active and inactive segments.
///
/// Zero-length spans are dropped and adjacent spans of the same kind merged,
/// so the result alternates and exactly covers `[start, end]`.
pub fn compute_segments(timeline: &EventTimeline, threshold_ms: i64) -> Vec<Segment> {
    let (Some(start), Some(end)) = (timeline.start(), timeline.end()) else {
        return Vec::new();
    };

    let interactions = timeline.interaction_timestamps();
    let mut segments = Vec::new();

    let (Some(&first), Some(&last)) = (interactions.first(), interactions.last()) else {
        push_segment(&mut segments, start, end, end - start <= threshold_ms);
        return segments;
    };

    let mut active_start = start;
    if first - start > threshold_ms {
        push_segment(&mut segments, start, first, false);
        active_start = first;
    }
    for pair in interactions.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if b - a > threshold_ms {
            push_segment(&mut segments, active_start, a, true);
            push_segment(&mut segments, a, b, false);
            active_start = b;
        }
    }
    if end - last > threshold_ms {
        push_segment(&mut segments, active_start, last, true);
        push_segment(&mut segments, last, end, false);
    } else {
        push_segment(&mut segments, active_start, end, true);
    }
    segments
}

fn push_segment(segments: &mut Vec<Segment>, start: i64, end: i64, active: bool) {
    if end <= start {
        return;
    }
    if let Some(prev) = segments.last_mut()
        && prev.active == active
        && prev.end == start
    {
        prev.end = end;
        return;
    }
    segments.push(Segment { start, end, active });
}

/// Playback speed inside an inactive segment with `remaining_secs` left.
///
/// Slows towards the end of the skip so the video does not overshoot the
/// next interaction.
pub fn inactive_speed(remaining_secs: f64, skip_multiplier: f64, min_speed_floor: f64) -> f64 {
    skip_multiplier.min(min_speed_floor.max(remaining_secs))
}

/// A segment with its playback speed, as handed to the player.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedSegment {
    pub start: i64,
    pub end: i64,
    pub active: bool,
    pub speed: f64,
}

/// Segments plus the multiplier applied to inactive time.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentPlan {
    segments: Vec<Segment>,
    skip_multiplier: f64,
}

impl SegmentPlan {
    pub fn new(segments: Vec<Segment>, skip_multiplier: f64) -> Self {
        Self {
            segments,
            skip_multiplier: skip_multiplier.max(1.0),
        }
    }

    pub fn from_timeline(timeline: &EventTimeline, threshold_ms: i64, skip_multiplier: f64) -> Self {
        Self::new(compute_segments(timeline, threshold_ms), skip_multiplier)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn skip_multiplier(&self) -> f64 {
        self.skip_multiplier
    }

    /// Video time (seconds) at which real timestamp `ts` appears.
    ///
    /// Clamped to the timeline bounds; monotonic non-decreasing and
    /// continuous across segment boundaries.
    pub fn video_time_for(&self, ts: i64) -> f64 {
        let (Some(first), Some(last)) = (self.segments.first(), self.segments.last()) else {
            return 0.0;
        };
        let ts = ts.clamp(first.start, last.end);

        let mut video_ms = 0.0;
        for segment in &self.segments {
            if ts <= segment.start {
                break;
            }
            let covered = (ts.min(segment.end) - segment.start) as f64;
            video_ms += if segment.active {
                covered
            } else {
                covered / self.skip_multiplier
            };
        }
        video_ms / 1000.0
    }

    /// Expected length (seconds) of the rendered video.
    pub fn expected_video_duration(&self) -> f64 {
        self.segments
            .last()
            .map(|last| self.video_time_for(last.end))
            .unwrap_or(0.0)
    }

    /// Per-segment speeds. Inactive speeds are evaluated at the segment start;
    /// the player re-evaluates them with [`inactive_speed`] as it progresses.
    pub fn speed_plan(&self, base_speed: f64, min_speed_floor: f64) -> Vec<PlannedSegment> {
        self.segments
            .iter()
            .map(|s| PlannedSegment {
                start: s.start,
                end: s.end,
                active: s.active,
                speed: if s.active {
                    base_speed
                } else {
                    inactive_speed(
                        s.duration_ms() as f64 / 1000.0,
                        self.skip_multiplier,
                        min_speed_floor,
                    )
                },
            })
            .collect()
    }
}

/// Deadline for a playback: `max(expected * 2, floor) + buffer`.
pub fn render_timeout(expected_secs: f64, floor_secs: u64, buffer_secs: u64) -> Duration {
    let doubled = (expected_secs.max(0.0) * 2.0).ceil() as u64;
    Duration::from_secs(doubled.max(floor_secs) + buffer_secs)
}
