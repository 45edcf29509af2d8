//! Single-daemon guard (`daemon.pid`).

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::utils::fs;
use crate::{Error, Result};

/// A held pid file. Removed by [`PidFile::release`].
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

/// Pid recorded in `path`, if the file exists and parses.
pub async fn read_pid(path: &Path) -> Result<Option<u32>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(raw.trim().parse().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(fs::io_error("reading pid file", path, e)),
    }
}

impl PidFile {
    /// Claim `path` for this process.
    ///
    /// Fails if the recorded pid belongs to another live process; a stale
    /// or unreadable pid file is replaced.
    pub async fn acquire(path: &Path) -> Result<Self> {
        Self::acquire_with(path, process_utils::is_pid_alive).await
    }

    pub async fn acquire_with(path: &Path, is_alive: impl Fn(u32) -> bool) -> Result<Self> {
        let pid = process_utils::current_pid();
        if let Some(existing) = read_pid(path).await? {
            if existing != pid && is_alive(existing) {
                return Err(Error::validation(format!(
                    "another daemon (pid {existing}) is running on this data dir ({})",
                    path.display()
                )));
            }
            if existing != pid {
                warn!(path = %path.display(), stale_pid = existing, "Replacing stale pid file");
            }
        }

        fs::write_atomic(path, format!("{pid}\n").as_bytes()).await?;
        info!(path = %path.display(), pid, "Acquired pid file");
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Remove the pid file if it still names this process.
    pub async fn release(self) -> Result<()> {
        if read_pid(&self.path).await? == Some(self.pid) {
            fs::remove_file_if_exists(&self.path).await?;
            info!(path = %self.path.display(), "Released pid file");
        }
        Ok(())
    }
}
