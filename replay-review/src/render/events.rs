//! rrweb event timeline parsing.
//!
//! Event dumps from the recording source are sometimes truncated or
//! concatenated, so parsing is lenient: a strict JSON array is tried first,
//! then individually well-formed `{...}` fragments are salvaged.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// rrweb incremental snapshot event type.
pub const INCREMENTAL_SNAPSHOT: i64 = 3;

/// Incremental snapshot sources that count as user interaction
/// (mouse move, mouse interaction, scroll, viewport resize, input).
const INTERACTION_SOURCES: std::ops::RangeInclusive<i64> = 1..=5;

/// A single rrweb event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayEvent {
    #[serde(rename = "type")]
    pub kind: i64,
    pub timestamp: i64,
    #[serde(default)]
    pub data: Value,
}

impl ReplayEvent {
    pub fn new(kind: i64, timestamp: i64, data: Value) -> Self {
        Self {
            kind,
            timestamp,
            data,
        }
    }

    /// Whether this event is a user interaction.
    pub fn is_interaction(&self) -> bool {
        self.kind == INCREMENTAL_SNAPSHOT
            && self
                .data
                .get("source")
                .and_then(Value::as_i64)
                .is_some_and(|source| INTERACTION_SOURCES.contains(&source))
    }
}

/// Events of one recording, sorted by timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventTimeline {
    events: Vec<ReplayEvent>,
}

impl EventTimeline {
    /// Parse a raw event dump. Never fails: unusable input yields an empty timeline.
    pub fn parse(raw: &str) -> Self {
        if let Ok(items) = serde_json::from_str::<Vec<Value>>(raw) {
            let total = items.len();
            let events: Vec<ReplayEvent> = items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect();
            if events.len() < total {
                debug!(
                    dropped = total - events.len(),
                    "Dropped array items that are not events"
                );
            }
            return Self::from_events(events);
        }

        let fragments = extract_fragments(raw);
        let total = fragments.len();
        let events: Vec<ReplayEvent> = fragments
            .into_iter()
            .filter_map(|fragment| serde_json::from_str(fragment).ok())
            .collect();
        debug!(
            fragments = total,
            recovered = events.len(),
            "Recovered events from malformed dump"
        );
        Self::from_events(events)
    }

    /// Build a timeline, stably sorting by timestamp.
    pub fn from_events(mut events: Vec<ReplayEvent>) -> Self {
        events.sort_by_key(|e| e.timestamp);
        Self { events }
    }

    pub fn events(&self) -> &[ReplayEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// First event timestamp (ms).
    pub fn start(&self) -> Option<i64> {
        self.events.first().map(|e| e.timestamp)
    }

    /// Last event timestamp (ms).
    pub fn end(&self) -> Option<i64> {
        self.events.last().map(|e| e.timestamp)
    }

    pub fn duration_ms(&self) -> i64 {
        match (self.start(), self.end()) {
            (Some(start), Some(end)) => end - start,
            _ => 0,
        }
    }

    /// Timestamps of interaction events, ascending.
    pub fn interaction_timestamps(&self) -> Vec<i64> {
        self.events
            .iter()
            .filter(|e| e.is_interaction())
            .map(|e| e.timestamp)
            .collect()
    }
}

/// Top-level `{...}` fragments of `raw`, matched by brace depth.
///
/// Braces inside string literals (including escaped quotes) are ignored. An
/// unterminated trailing fragment is discarded.
pub fn extract_fragments(raw: &str) -> Vec<&str> {
    let bytes = raw.as_bytes();
    let mut fragments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    fragments.push(&raw[start..=i]);
                }
            }
            _ => {}
        }
    }
    fragments
}
