//! Persisted daemon state (`state/daemon.json`).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::Result;
use crate::utils::fs;

/// Singleton daemon state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DaemonState {
    /// Upper bound of the last heartbeat window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pulled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backfill_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backfill_completed_at: Option<DateTime<Utc>>,
    /// Users whose rollup is outstanding, in insertion order.
    pub pending_user_emails: Vec<String>,
    /// Groups whose rollup is outstanding, in insertion order.
    pub pending_group_ids: Vec<String>,
}

fn insert_unique(list: &mut Vec<String>, item: &str) -> bool {
    if list.iter().any(|existing| existing == item) {
        return false;
    }
    list.push(item.to_string());
    true
}

impl DaemonState {
    pub fn mark_user_dirty(&mut self, email: &str) -> bool {
        insert_unique(&mut self.pending_user_emails, email)
    }

    pub fn mark_group_dirty(&mut self, group_id: &str) -> bool {
        insert_unique(&mut self.pending_group_ids, group_id)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_user_emails.is_empty() || !self.pending_group_ids.is_empty()
    }
}

/// Serialized access to the state file.
///
/// Every change is a read-modify-write of the whole file under an async
/// mutex, so concurrent workers never lose each other's updates.
pub struct StateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<DaemonState> {
        match fs::read_json_opt(&self.path).await {
            Ok(state) => Ok(state.unwrap_or_default()),
            Err(crate::Error::Serialization(e)) => {
                warn!(path = %self.path.display(), error = %e, "Daemon state is corrupt, starting fresh");
                Ok(DaemonState::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Current state; a missing file is the default state.
    pub async fn load(&self) -> Result<DaemonState> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Apply `f` and persist the result.
    pub async fn update<F>(&self, f: F) -> Result<DaemonState>
    where
        F: FnOnce(&mut DaemonState),
    {
        let _guard = self.lock.lock().await;
        let mut state = self.read().await?;
        f(&mut state);
        fs::write_json_atomic(&self.path, &state).await?;
        Ok(state)
    }

    /// Queue the owning user and group of a finished session for rollup.
    pub async fn mark_dirty(&self, email: Option<&str>, group_id: Option<&str>) -> Result<()> {
        if email.is_none() && group_id.is_none() {
            return Ok(());
        }
        self.update(|state| {
            if let Some(email) = email {
                state.mark_user_dirty(email);
            }
            if let Some(group_id) = group_id {
                state.mark_group_dirty(group_id);
            }
        })
        .await?;
        Ok(())
    }

    /// Drop resolved targets from the pending lists.
    pub async fn clear_pending(&self, users: &[String], groups: &[String]) -> Result<DaemonState> {
        self.update(|state| {
            state.pending_user_emails.retain(|e| !users.contains(e));
            state.pending_group_ids.retain(|g| !groups.contains(g));
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_state_is_default() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state/daemon.json"));
        assert_eq!(store.load().await.unwrap(), DaemonState::default());
    }

    #[tokio::test]
    async fn test_mark_dirty_dedupes() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("daemon.json"));
        store.mark_dirty(Some("a@x.io"), Some("acme")).await.unwrap();
        store.mark_dirty(Some("a@x.io"), Some("acme")).await.unwrap();
        store.mark_dirty(Some("b@x.io"), None).await.unwrap();

        let state = store.load().await.unwrap();
        assert_eq!(state.pending_user_emails, vec!["a@x.io", "b@x.io"]);
        assert_eq!(state.pending_group_ids, vec!["acme"]);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::new(dir.path().join("daemon.json")));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..20 {
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .mark_dirty(Some(&format!("user{i}@x.io")), None)
                    .await
                    .unwrap();
            });
        }
        while tasks.join_next().await.is_some() {}

        assert_eq!(store.load().await.unwrap().pending_user_emails.len(), 20);
    }

    #[tokio::test]
    async fn test_clear_pending_and_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = StateStore::new(&path);
        assert_eq!(store.load().await.unwrap(), DaemonState::default());

        store.mark_dirty(Some("a"), Some("g")).await.unwrap();
        store.mark_dirty(Some("b"), None).await.unwrap();
        let state = store
            .clear_pending(&["a".to_string()], &["g".to_string()])
            .await
            .unwrap();
        assert_eq!(state.pending_user_emails, vec!["b"]);
        assert!(state.pending_group_ids.is_empty());
    }
}
