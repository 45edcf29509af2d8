use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::{ObjectStore, ProgressSender, UploadProgress, validate_key};
use crate::utils::fs;
use crate::{Error, Result};

const COPY_CHUNK: usize = 1024 * 1024;

/// Stores artifacts in a local directory and hands out `file://` URIs.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn target(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn uri_for(path: &Path) -> Result<String> {
        let absolute =
            std::path::absolute(path).map_err(|e| fs::io_error("resolving", path, e))?;
        url::Url::from_file_path(&absolute)
            .map(|u| u.to_string())
            .map_err(|_| Error::Upload(format!("cannot build file URI for {}", absolute.display())))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        progress: Option<&ProgressSender>,
    ) -> Result<String> {
        let target = self.target(key)?;
        fs::ensure_parent_dir(&target).await?;

        let mut source = tokio::fs::File::open(path)
            .await
            .map_err(|e| fs::io_error("opening upload source", path, e))?;
        let bytes_total = source
            .metadata()
            .await
            .map_err(|e| fs::io_error("reading metadata of", path, e))?
            .len();

        let tmp = target.with_extension(format!("{}.part", uuid::Uuid::new_v4().simple()));
        let copy = async {
            let mut dest = tokio::fs::File::create(&tmp)
                .await
                .map_err(|e| fs::io_error("creating", &tmp, e))?;
            let mut buf = vec![0u8; COPY_CHUNK];
            let mut bytes_done = 0u64;
            loop {
                let n = source
                    .read(&mut buf)
                    .await
                    .map_err(|e| fs::io_error("reading", path, e))?;
                if n == 0 {
                    break;
                }
                dest.write_all(&buf[..n])
                    .await
                    .map_err(|e| fs::io_error("writing", &tmp, e))?;
                bytes_done += n as u64;
                if let Some(tx) = progress {
                    tx.send_replace(UploadProgress {
                        bytes_done,
                        bytes_total,
                    });
                }
            }
            dest.sync_all()
                .await
                .map_err(|e| fs::io_error("syncing", &tmp, e))?;
            tokio::fs::rename(&tmp, &target)
                .await
                .map_err(|e| fs::io_error("renaming upload onto", &target, e))
        };
        if let Err(e) = copy.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        debug!(key, bytes = bytes_total, "Stored artifact locally");
        Self::uri_for(&target)
    }

    async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<String> {
        let target = self.target(key)?;
        fs::write_atomic(&target, &bytes).await?;
        debug!(key, bytes = bytes.len(), "Stored artifact locally");
        Self::uri_for(&target)
    }
}
