//! AI inference connector.
//!
//! Three calls, one per level of the hierarchy: a session is analyzed from
//! its rendered video, a user is summarized from their session analyses, and
//! a group from its users' rollups.

mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::cache::RenderedSession;
use crate::rollup::{SessionAnalysis, UserRollup};
use crate::source::Recording;

pub use http::HttpAnalyzer;

/// Structured result of analyzing one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInsight {
    pub summary: String,
    pub health: String,
    pub score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub features: Vec<String>,
}

/// Structured result of summarizing a user or a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateInsight {
    pub story: String,
    pub health: String,
    pub score: f64,
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze_session(
        &self,
        recording: &Recording,
        rendered: &RenderedSession,
    ) -> Result<SessionInsight>;

    /// `analyses` are sorted by session start time.
    async fn summarize_user(
        &self,
        email: &str,
        analyses: &[SessionAnalysis],
    ) -> Result<AggregateInsight>;

    async fn summarize_group(&self, group_id: &str, users: &[UserRollup])
    -> Result<AggregateInsight>;
}

/// JSON schema the session reply must follow.
pub fn session_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["summary", "health", "score", "issues", "features"],
        "properties": {
            "summary": {"type": "string"},
            "health": {"type": "string", "enum": ["healthy", "mixed", "struggling"]},
            "score": {"type": "number", "minimum": 0, "maximum": 100},
            "issues": {"type": "array", "items": {"type": "string"}},
            "features": {"type": "array", "items": {"type": "string"}}
        }
    })
}

/// JSON schema the user and group replies must follow.
pub fn aggregate_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["story", "health", "score"],
        "properties": {
            "story": {"type": "string"},
            "health": {"type": "string", "enum": ["healthy", "mixed", "struggling"]},
            "score": {"type": "number", "minimum": 0, "maximum": 100}
        }
    })
}
