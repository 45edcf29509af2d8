//! Artifact upload.
//!
//! Rendered videos and event dumps are written through an [`ObjectStore`]
//! under stable keys (`videos/{sessionId}.mp4`, `events/{sessionId}.json`).
//! Uploads report progress through a `watch` channel.

mod local;
mod rclone;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::config::StorageConfig;
use crate::{Error, Result};

pub use local::LocalObjectStore;
pub use rclone::{RcloneObjectStore, parse_rclone_stats};

/// Bytes transferred so far for one upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
}

impl UploadProgress {
    pub fn fraction(&self) -> f64 {
        if self.bytes_total == 0 {
            0.0
        } else {
            self.bytes_done as f64 / self.bytes_total as f64
        }
    }
}

pub type ProgressSender = watch::Sender<UploadProgress>;

/// Destination for rendered artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload the file at `path` under `key`, returning its retrievable URI.
    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        progress: Option<&ProgressSender>,
    ) -> Result<String>;

    /// Upload `bytes` under `key`, returning its retrievable URI.
    async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<String>;
}

/// Object key of a session's rendered video.
pub fn video_key(session_id: &str) -> String {
    format!("videos/{}.mp4", crate::utils::fs::file_key(session_id))
}

/// Object key of a session's raw event dump.
pub fn events_key(session_id: &str) -> String {
    format!("events/{}.json", crate::utils::fs::file_key(session_id))
}

/// Reject keys that are empty, absolute, or escape the store root.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.starts_with('\\') {
        return Err(Error::validation(format!("invalid object key: {key:?}")));
    }
    if key.split(['/', '\\']).any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(Error::validation(format!("invalid object key: {key:?}")));
    }
    Ok(())
}

/// Build the configured store.
pub fn build_store(config: &StorageConfig) -> Arc<dyn ObjectStore> {
    match config {
        StorageConfig::Local { root } => Arc::new(LocalObjectStore::new(root)),
        StorageConfig::Rclone {
            remote,
            rclone_path,
            public_base_url,
        } => Arc::new(RcloneObjectStore::new(
            rclone_path.clone().unwrap_or_else(|| "rclone".to_string()),
            remote,
            public_base_url.clone(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        assert_eq!(video_key("abc-123"), "videos/abc-123.mp4");
        assert_eq!(events_key("abc-123"), "events/abc-123.json");
        assert!(validate_key(&video_key("../../etc")).is_ok());
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("videos/a.mp4").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("a//b").is_err());
    }

    #[test]
    fn test_progress_fraction() {
        let p = UploadProgress {
            bytes_done: 25,
            bytes_total: 100,
        };
        assert_eq!(p.fraction(), 0.25);
        assert_eq!(UploadProgress::default().fraction(), 0.0);
    }
}
