//! Analysis artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::inference::{AggregateInsight, SessionInsight};

/// Inference result for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAnalysis {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub video_uri: String,
    pub insight: SessionInsight,
    pub analyzed_at: DateTime<Utc>,
}

/// Narrative over one user's sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRollup {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub analysis_hash: String,
    /// Session ids in start-time order.
    pub session_ids: Vec<String>,
    pub insight: AggregateInsight,
    pub updated_at: DateTime<Utc>,
}

/// Narrative over one group's users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRollup {
    pub group_id: String,
    pub analysis_hash: String,
    pub user_emails: Vec<String>,
    pub insight: AggregateInsight,
    pub updated_at: DateTime<Utc>,
}

/// SHA-256 hex over the sorted child ids joined by `\n`.
///
/// Order-insensitive, so the same set of children always yields the same hash.
pub fn analysis_hash<I, S>(child_ids: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut ids: Vec<String> = child_ids.into_iter().map(|s| s.as_ref().to_string()).collect();
    ids.sort();
    hex::encode(Sha256::digest(ids.join("\n").as_bytes()))
}

/// Sort session analyses by start time, then session id.
pub fn sort_by_start(analyses: &mut [SessionAnalysis]) {
    analyses.sort_by(|a, b| {
        a.start_time
            .cmp(&b.start_time)
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_order_insensitive() {
        assert_eq!(analysis_hash(["b", "a", "c"]), analysis_hash(["c", "b", "a"]));
        assert_ne!(analysis_hash(["a", "b"]), analysis_hash(["a", "b", "c"]));
        assert_eq!(analysis_hash(["x"]).len(), 64);
    }

    #[test]
    fn test_hash_matches_joined_digest() {
        let expected = hex::encode(Sha256::digest(b"a\nb"));
        assert_eq!(analysis_hash(vec!["b".to_string(), "a".to_string()]), expected);
    }
}
