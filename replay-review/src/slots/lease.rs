//! Slot leases.
//!
//! A lease is ownership of one numbered slot, identified by a random token.
//! Only the token holder may renew or release it. [`FileLeaseBackend`] backs
//! leases with `slot-N.lock` files: the file's existence is the lock and the
//! pid inside it is used to reclaim slots whose holder has died.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::utils::fs::{self, io_error};
use crate::utils::json::{self, JsonContext};
use crate::Result;

/// On-disk content of `slot-N.lock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotLock {
    pub pid: u32,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewed_at: Option<DateTime<Utc>>,
}

/// A held slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub index: usize,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

/// Storage primitive behind slot leases.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Try to take slot `index`. `Ok(None)` means a live holder owns it.
    async fn try_acquire(&self, index: usize) -> Result<Option<Lease>>;

    /// Refresh the lease. Returns `false` if the slot no longer carries our token.
    async fn renew(&self, lease: &Lease) -> Result<bool>;

    /// Give the slot up. Returns `false` if the slot no longer carries our token.
    async fn release(&self, lease: &Lease) -> Result<bool>;

    /// Synchronous best-effort release, used when a guard is dropped unreleased.
    fn release_blocking(&self, lease: &Lease);

    /// Indices of slots currently locked (by anyone).
    async fn held(&self) -> Result<Vec<usize>>;
}

/// Liveness check for a lock holder's pid.
pub type LivenessCheck = Arc<dyn Fn(u32) -> bool + Send + Sync>;

enum Holder {
    /// The lock file vanished between our create attempt and the inspection.
    Gone,
    /// Valid lock held by a live process.
    Alive,
    /// Valid lock whose pid is dead.
    Dead(SlotLock),
    /// Unreadable lock file older than the staleness threshold.
    Abandoned,
    /// Unreadable but recent; most likely a holder between create and write.
    Settling,
}

/// Lock-file implementation of [`LeaseBackend`].
pub struct FileLeaseBackend {
    dir: PathBuf,
    stale_after: Duration,
    is_alive: LivenessCheck,
}

impl FileLeaseBackend {
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self::with_liveness(dir, stale_after, Arc::new(process_utils::is_pid_alive))
    }

    /// Create a backend with a custom pid liveness check.
    pub fn with_liveness(
        dir: impl Into<PathBuf>,
        stale_after: Duration,
        is_alive: LivenessCheck,
    ) -> Self {
        Self {
            dir: dir.into(),
            stale_after,
            is_alive,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn slot_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("slot-{}.lock", index))
    }

    async fn read_lock(path: &Path) -> Result<Option<Option<SlotLock>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(json::parse_bytes(
                &bytes,
                JsonContext::SlotLock { path },
                "Unreadable slot lock",
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("reading slot lock", path, e)),
        }
    }

    async fn inspect(&self, path: &Path) -> Result<Holder> {
        let lock = match Self::read_lock(path).await? {
            None => return Ok(Holder::Gone),
            Some(lock) => lock,
        };

        match lock {
            Some(lock) if (self.is_alive)(lock.pid) => Ok(Holder::Alive),
            Some(lock) => Ok(Holder::Dead(lock)),
            None => {
                let modified = match tokio::fs::metadata(path).await {
                    Ok(meta) => meta.modified().ok(),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Holder::Gone),
                    Err(e) => return Err(io_error("inspecting slot lock", path, e)),
                };
                let age = modified
                    .and_then(|m| SystemTime::now().duration_since(m).ok())
                    .unwrap_or_default();
                if age > self.stale_after {
                    Ok(Holder::Abandoned)
                } else {
                    Ok(Holder::Settling)
                }
            }
        }
    }

    /// Remove a stale lock without clobbering a fresh one.
    ///
    /// The lock is first moved aside; if what was moved turns out not to be
    /// the stale lock we inspected (another acquirer reclaimed and re-locked
    /// the slot in between), it is linked back into place.
    async fn reclaim(&self, path: &Path, observed: Option<&SlotLock>) -> Result<()> {
        let tomb = path.with_extension(format!("lock.reclaim-{}", uuid::Uuid::new_v4().simple()));
        match tokio::fs::rename(path, &tomb).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_error("moving stale slot lock", path, e)),
        }

        let moved = Self::read_lock(&tomb).await?.flatten();
        let same = match (observed, moved.as_ref()) {
            (Some(a), Some(b)) => a.token == b.token,
            (None, None) => true,
            _ => false,
        };

        if !same {
            match tokio::fs::hard_link(&tomb, path).await {
                Ok(()) => debug!(path = %path.display(), "Restored fresh slot lock displaced during reclaim"),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Could not restore displaced slot lock"
                ),
            }
        }

        fs::remove_file_if_exists(&tomb).await?;
        Ok(())
    }

    async fn matches_token(path: &Path, token: &str) -> Result<Option<SlotLock>> {
        Ok(Self::read_lock(path)
            .await?
            .flatten()
            .filter(|lock| lock.token == token))
    }
}

#[async_trait]
impl LeaseBackend for FileLeaseBackend {
    async fn try_acquire(&self, index: usize) -> Result<Option<Lease>> {
        fs::ensure_dir_all_with_op("creating slot directory", &self.dir).await?;
        let path = self.slot_path(index);

        loop {
            let opened = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;

            match opened {
                Ok(mut file) => {
                    let lock = SlotLock {
                        pid: process_utils::current_pid(),
                        token: uuid::Uuid::new_v4().to_string(),
                        acquired_at: Utc::now(),
                        renewed_at: None,
                    };
                    let bytes = serde_json::to_vec(&lock)?;
                    let written = async {
                        file.write_all(&bytes).await?;
                        file.sync_all().await
                    }
                    .await;
                    if let Err(e) = written {
                        let _ = tokio::fs::remove_file(&path).await;
                        return Err(io_error("writing slot lock", &path, e));
                    }

                    debug!(slot = index, token = %lock.token, "Acquired render slot");
                    return Ok(Some(Lease {
                        index,
                        token: lock.token,
                        acquired_at: lock.acquired_at,
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match self.inspect(&path).await? {
                        Holder::Gone => continue,
                        Holder::Alive | Holder::Settling => return Ok(None),
                        Holder::Dead(lock) => {
                            warn!(
                                slot = index,
                                pid = lock.pid,
                                acquired_at = %lock.acquired_at,
                                "Reclaiming render slot held by dead process"
                            );
                            self.reclaim(&path, Some(&lock)).await?;
                        }
                        Holder::Abandoned => {
                            warn!(slot = index, "Reclaiming abandoned unreadable render slot lock");
                            self.reclaim(&path, None).await?;
                        }
                    }
                }
                Err(e) => return Err(io_error("creating slot lock", &path, e)),
            }
        }
    }

    async fn renew(&self, lease: &Lease) -> Result<bool> {
        let path = self.slot_path(lease.index);
        let Some(mut lock) = Self::matches_token(&path, &lease.token).await? else {
            warn!(slot = lease.index, "Cannot renew render slot: lease lost");
            return Ok(false);
        };
        lock.renewed_at = Some(Utc::now());
        fs::write_json_atomic(&path, &lock).await?;
        Ok(true)
    }

    async fn release(&self, lease: &Lease) -> Result<bool> {
        let path = self.slot_path(lease.index);
        if Self::matches_token(&path, &lease.token).await?.is_none() {
            warn!(
                slot = lease.index,
                "Render slot no longer carries our token; leaving it in place"
            );
            return Ok(false);
        }
        let removed = fs::remove_file_if_exists(&path).await?;
        debug!(slot = lease.index, "Released render slot");
        Ok(removed)
    }

    fn release_blocking(&self, lease: &Lease) {
        let path = self.slot_path(lease.index);
        let owned = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<SlotLock>(&bytes).ok())
            .is_some_and(|lock| lock.token == lease.token);
        if owned && let Err(e) = std::fs::remove_file(&path) {
            warn!(slot = lease.index, error = %e, "Failed to release render slot on drop");
        }
    }

    async fn held(&self) -> Result<Vec<usize>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("listing slot directory", &self.dir, e)),
        };

        let mut held = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("listing slot directory", &self.dir, e))?
        {
            let name = entry.file_name();
            if let Some(index) = name
                .to_str()
                .and_then(|n| n.strip_prefix("slot-"))
                .and_then(|n| n.strip_suffix(".lock"))
                .and_then(|n| n.parse::<usize>().ok())
            {
                held.push(index);
            }
        }
        held.sort_unstable();
        Ok(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend(dir: &TempDir) -> FileLeaseBackend {
        FileLeaseBackend::new(dir.path(), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_acquire_writes_lock_file() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);

        let lease = backend.try_acquire(0).await.unwrap().unwrap();
        let raw = std::fs::read(backend.slot_path(0)).unwrap();
        let lock: SlotLock = serde_json::from_slice(&raw).unwrap();

        assert_eq!(lock.pid, std::process::id());
        assert_eq!(lock.token, lease.token);
        assert!(String::from_utf8(raw).unwrap().contains("acquiredAt"));
    }

    #[tokio::test]
    async fn test_second_acquire_of_live_slot_fails() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);

        let _lease = backend.try_acquire(0).await.unwrap().unwrap();
        assert!(backend.try_acquire(0).await.unwrap().is_none());
        assert!(backend.try_acquire(1).await.unwrap().is_some());
        assert_eq!(backend.held().await.unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_release_only_with_matching_token() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);

        let lease = backend.try_acquire(3).await.unwrap().unwrap();
        let impostor = Lease {
            token: "someone-else".to_string(),
            ..lease.clone()
        };

        assert!(!backend.release(&impostor).await.unwrap());
        assert!(backend.slot_path(3).exists());

        assert!(backend.release(&lease).await.unwrap());
        assert!(!backend.slot_path(3).exists());
        assert!(!backend.release(&lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_dead_holder_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let backend = FileLeaseBackend::with_liveness(
            dir.path(),
            Duration::from_secs(60),
            Arc::new(|pid| pid != 999_999),
        );
        let stale = SlotLock {
            pid: 999_999,
            token: "dead".to_string(),
            acquired_at: Utc::now(),
            renewed_at: None,
        };
        std::fs::write(backend.slot_path(0), serde_json::to_vec(&stale).unwrap()).unwrap();

        let lease = backend.try_acquire(0).await.unwrap().unwrap();
        assert_eq!(lease.index, 0);
        assert_ne!(lease.token, "dead");
        assert_eq!(backend.held().await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_fresh_unreadable_lock_is_respected() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        std::fs::write(backend.slot_path(0), b"").unwrap();

        assert!(backend.try_acquire(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_old_unreadable_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        std::fs::write(backend.slot_path(0), b"{garbage").unwrap();
        let file = std::fs::File::options()
            .write(true)
            .open(backend.slot_path(0))
            .unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(120))
            .unwrap();

        assert!(backend.try_acquire(0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_renew_sets_renewed_at() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let lease = backend.try_acquire(0).await.unwrap().unwrap();

        assert!(backend.renew(&lease).await.unwrap());
        let lock: SlotLock =
            serde_json::from_slice(&std::fs::read(backend.slot_path(0)).unwrap()).unwrap();
        assert!(lock.renewed_at.is_some());
        assert_eq!(lock.token, lease.token);

        std::fs::remove_file(backend.slot_path(0)).unwrap();
        assert!(!backend.renew(&lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_blocking() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let lease = backend.try_acquire(2).await.unwrap().unwrap();

        backend.release_blocking(&lease);
        assert!(!backend.slot_path(2).exists());
    }
}
