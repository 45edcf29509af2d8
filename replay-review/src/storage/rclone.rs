use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

use super::{ObjectStore, ProgressSender, UploadProgress, validate_key};
use crate::utils::fs;
use crate::{Error, Result};

/// Uploads through `rclone copyto`.
pub struct RcloneObjectStore {
    rclone_path: String,
    remote: String,
    public_base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonLogLine {
    #[serde(default)]
    level: String,
    #[serde(default)]
    msg: String,
    stats: Option<JsonStats>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonStats {
    #[serde(default)]
    bytes: u64,
    #[serde(default)]
    total_bytes: u64,
}

/// Progress carried by one `--use-json-log` line, if it is a stats line.
pub fn parse_rclone_stats(line: &str) -> Option<UploadProgress> {
    let parsed: JsonLogLine = serde_json::from_str(line.trim()).ok()?;
    let stats = parsed.stats?;
    Some(UploadProgress {
        bytes_done: stats.bytes,
        bytes_total: stats.total_bytes,
    })
}

impl RcloneObjectStore {
    pub fn new(
        rclone_path: impl Into<String>,
        remote: impl Into<String>,
        public_base_url: Option<String>,
    ) -> Self {
        Self {
            rclone_path: rclone_path.into(),
            remote: remote.into(),
            public_base_url,
        }
    }

    fn join(base: &str, key: &str) -> String {
        if base.ends_with('/') || base.ends_with(':') {
            format!("{base}{key}")
        } else {
            format!("{base}/{key}")
        }
    }

    fn destination(&self, key: &str) -> String {
        Self::join(&self.remote, key)
    }

    /// URI returned to callers for `key`.
    pub fn uri_for(&self, key: &str) -> String {
        Self::join(self.public_base_url.as_deref().unwrap_or(&self.remote), key)
    }

    async fn copyto(&self, key: &str, path: &Path, progress: Option<&ProgressSender>) -> Result<String> {
        validate_key(key)?;
        let destination = self.destination(key);
        info!("Rclone copyto: {} -> {}", path.display(), destination);

        let mut cmd = process_utils::tokio_command(&self.rclone_path);
        cmd.args([
            "copyto",
            "--use-json-log",
            "--stats",
            "1s",
            "--stats-log-level",
            "NOTICE",
            "--log-level",
            "NOTICE",
        ])
        .arg(path)
        .arg(&destination)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Upload(format!("failed to spawn rclone: {e}")))?;

        let mut last_error = None;
        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(p) = parse_rclone_stats(&line) {
                    if let Some(tx) = progress {
                        tx.send_replace(p);
                    }
                    continue;
                }
                match serde_json::from_str::<JsonLogLine>(line.trim()) {
                    Ok(entry) if entry.level == "error" || entry.level == "critical" => {
                        warn!("rclone: {}", entry.msg);
                        last_error = Some(entry.msg);
                    }
                    Ok(entry) => debug!("rclone: {}", entry.msg),
                    Err(_) => debug!("rclone: {}", line),
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::Upload(format!("failed to wait for rclone: {e}")))?;
        if !status.success() {
            let reason = last_error.unwrap_or_else(|| status.to_string());
            error!("rclone copyto failed: {}", reason);
            return Err(Error::Upload(format!("rclone copyto {destination} failed: {reason}")));
        }

        Ok(self.uri_for(key))
    }
}

#[async_trait]
impl ObjectStore for RcloneObjectStore {
    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        progress: Option<&ProgressSender>,
    ) -> Result<String> {
        self.copyto(key, path, progress).await
    }

    async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<String> {
        let staged = tempfile::Builder::new()
            .prefix("replay-review-upload-")
            .tempfile()
            .map_err(Error::Io)?;
        let staged_path = staged.path().to_path_buf();
        tokio::fs::write(&staged_path, &bytes)
            .await
            .map_err(|e| fs::io_error("staging upload", &staged_path, e))?;
        let uri = self.copyto(key, &staged_path, None).await;
        drop(staged);
        uri
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stats_line() {
        let line = r#"{"level":"notice","msg":"Transferred: 1 MiB / 4 MiB, 25%","stats":{"bytes":1048576,"totalBytes":4194304,"speed":1000.5},"time":"2026-01-01T00:00:00Z"}"#;
        assert_eq!(
            parse_rclone_stats(line),
            Some(UploadProgress {
                bytes_done: 1_048_576,
                bytes_total: 4_194_304
            })
        );
        assert_eq!(parse_rclone_stats(r#"{"level":"error","msg":"boom"}"#), None);
        assert_eq!(parse_rclone_stats("plain text"), None);
    }

    #[test]
    fn test_uri_building() {
        let store = RcloneObjectStore::new("rclone", "s3:bucket/replays", None);
        assert_eq!(store.uri_for("videos/a.mp4"), "s3:bucket/replays/videos/a.mp4");

        let store = RcloneObjectStore::new(
            "rclone",
            "r2:",
            Some("https://cdn.example.com/".to_string()),
        );
        assert_eq!(store.destination("videos/a.mp4"), "r2:videos/a.mp4");
        assert_eq!(store.uri_for("videos/a.mp4"), "https://cdn.example.com/videos/a.mp4");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_upload_surfaces_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("a.mp4");
        std::fs::write(&file, b"x").unwrap();

        let store = RcloneObjectStore::new("false", "remote:", None);
        let err = store.put_file("videos/a.mp4", &file, None).await.unwrap_err();
        assert!(matches!(err, Error::Upload(_)));
    }
}
