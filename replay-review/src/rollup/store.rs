//! File-backed analysis artifact store.
//!
//! ```text
//! analysis/sessions/{sessionId}.json
//! analysis/users/{emailKey}.json
//! analysis/groups/{groupKey}.json
//! ```

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::model::{GroupRollup, SessionAnalysis, UserRollup, sort_by_start};
use crate::Result;
use crate::utils::fs;
use crate::utils::json::{self, JsonContext};

pub struct AnalysisStore {
    root: PathBuf,
}

impl AnalysisStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, kind: &str, id: &str) -> PathBuf {
        self.root.join(kind).join(format!("{}.json", fs::file_key(id)))
    }

    async fn read_all<T: DeserializeOwned + Send>(&self, kind: &'static str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for path in fs::list_json_files(&self.root.join(kind)).await? {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(fs::io_error("reading analysis file", &path, e)),
            };
            if let Some(item) = json::parse_bytes(
                &bytes,
                JsonContext::AnalysisFile { kind, path: &path },
                "Skipping unreadable analysis file",
            ) {
                out.push(item);
            }
        }
        Ok(out)
    }

    async fn write<T: Serialize>(&self, kind: &str, id: &str, value: &T) -> Result<()> {
        fs::write_json_atomic(&self.path(kind, id), value).await
    }

    pub async fn put_session(&self, analysis: &SessionAnalysis) -> Result<()> {
        self.write("sessions", &analysis.session_id, analysis).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionAnalysis>> {
        fs::read_json_opt(&self.path("sessions", session_id)).await
    }

    /// Analyses of `email`'s sessions, sorted by start time.
    pub async fn sessions_for_user(&self, email: &str) -> Result<Vec<SessionAnalysis>> {
        let mut sessions: Vec<SessionAnalysis> = self
            .read_all::<SessionAnalysis>("sessions")
            .await?
            .into_iter()
            .filter(|s| s.user_email.as_deref() == Some(email))
            .collect();
        sort_by_start(&mut sessions);
        Ok(sessions)
    }

    pub async fn put_user(&self, rollup: &UserRollup) -> Result<()> {
        self.write("users", &rollup.email, rollup).await
    }

    pub async fn get_user(&self, email: &str) -> Result<Option<UserRollup>> {
        fs::read_json_opt(&self.path("users", email)).await
    }

    /// Rollups of users in `group_id`, sorted by email.
    pub async fn users_in_group(&self, group_id: &str) -> Result<Vec<UserRollup>> {
        let mut users: Vec<UserRollup> = self
            .read_all::<UserRollup>("users")
            .await?
            .into_iter()
            .filter(|u| u.group_id.as_deref() == Some(group_id))
            .collect();
        users.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(users)
    }

    pub async fn put_group(&self, rollup: &GroupRollup) -> Result<()> {
        self.write("groups", &rollup.group_id, rollup).await
    }

    pub async fn get_group(&self, group_id: &str) -> Result<Option<GroupRollup>> {
        fs::read_json_opt(&self.path("groups", group_id)).await
    }
}
