//! Recording source.
//!
//! Discovers finished session recordings and serves their raw rrweb event
//! dumps.

mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::utils::url::host_allowed;

pub use http::HttpRecordingSource;

/// The user a recording belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    #[serde(alias = "distinct_id")]
    pub distinct_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, alias = "group_id", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

/// A recorded browser session, as listed by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    pub id: String,
    #[serde(alias = "start_time")]
    pub start_time: DateTime<Utc>,
    #[serde(alias = "end_time")]
    pub end_time: DateTime<Utc>,
    #[serde(default, alias = "active_seconds")]
    pub active_seconds: f64,
    #[serde(default, alias = "inactive_seconds")]
    pub inactive_seconds: f64,
    #[serde(default, alias = "start_url")]
    pub start_url: String,
    #[serde(default)]
    pub person: Person,
    /// Still being recorded; not yet eligible for rendering.
    #[serde(default)]
    pub ongoing: bool,
}

impl Recording {
    pub fn user_email(&self) -> Option<&str> {
        self.person.email.as_deref().filter(|e| !e.trim().is_empty())
    }

    pub fn group_id(&self) -> Option<&str> {
        self.person.group_id.as_deref().filter(|g| !g.trim().is_empty())
    }

    pub fn duration_secs(&self) -> f64 {
        (self.end_time - self.start_time).num_milliseconds().max(0) as f64 / 1000.0
    }

    /// Whether this recording's start URL is on an allowed host.
    pub fn is_allowed(&self, allowed_domains: &[String]) -> bool {
        host_allowed(&self.start_url, allowed_domains)
    }
}

/// Sort recordings chronologically (start time, then id).
pub fn sort_chronologically(recordings: &mut [Recording]) {
    recordings.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
}

/// Where recordings come from.
#[async_trait]
pub trait RecordingSource: Send + Sync {
    /// Every recording that started at or after `date_from`, across all pages.
    async fn list_recordings(&self, date_from: DateTime<Utc>) -> Result<Vec<Recording>>;

    /// Raw event dump of one recording.
    async fn fetch_events(&self, session_id: &str) -> Result<String>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn recording(id: &str, start_secs: i64, email: Option<&str>, group: Option<&str>) -> Recording {
        let start = DateTime::<Utc>::from_timestamp(1_700_000_000 + start_secs, 0).unwrap_or_default();
        Recording {
            id: id.to_string(),
            start_time: start,
            end_time: start + chrono::Duration::seconds(60),
            active_seconds: 40.0,
            inactive_seconds: 20.0,
            start_url: "https://app.example.com/home".to_string(),
            person: Person {
                distinct_id: format!("d-{id}"),
                email: email.map(str::to_string),
                group_id: group.map(str::to_string),
            },
            ongoing: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::recording;
    use super::*;

    #[test]
    fn test_decodes_snake_case_wire_format() {
        let raw = serde_json::json!({
            "id": "r1",
            "start_time": "2026-01-02T03:04:05Z",
            "end_time": "2026-01-02T03:05:05Z",
            "active_seconds": 30,
            "inactive_seconds": 30,
            "start_url": "https://app.example.com/",
            "person": {"distinct_id": "d1", "email": "a@b.co"},
            "ongoing": false
        });
        let rec: Recording = serde_json::from_value(raw).unwrap();
        assert_eq!(rec.user_email(), Some("a@b.co"));
        assert_eq!(rec.group_id(), None);
        assert_eq!(rec.duration_secs(), 60.0);

        let out = serde_json::to_value(&rec).unwrap();
        assert!(out.get("startTime").is_some());
        assert_eq!(out["person"]["distinctId"], "d1");
    }

    #[test]
    fn test_sort_chronologically_breaks_ties_by_id() {
        let mut recs = vec![
            recording("b", 10, None, None),
            recording("c", 5, None, None),
            recording("a", 10, None, None),
        ];
        sort_chronologically(&mut recs);
        let ids: Vec<&str> = recs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_blank_email_is_none() {
        let rec = recording("a", 0, Some("  "), Some(""));
        assert_eq!(rec.user_email(), None);
        assert_eq!(rec.group_id(), None);
    }
}
