//! Cross-process render slot arbiter.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::capacity::{CapacityPolicy, MemoryProbe, SystemMemoryProbe};
use super::lease::{FileLeaseBackend, Lease, LeaseBackend};
use crate::Result;
use crate::config::SlotConfig;

/// Interval at which a slot held by [`SlotArbiter::with_slot`] is renewed.
const RENEW_INTERVAL: Duration = Duration::from_secs(30);

/// Bounds concurrent renders across every process sharing the slot directory.
pub struct SlotArbiter {
    backend: Arc<dyn LeaseBackend>,
    probe: Arc<dyn MemoryProbe>,
    policy: CapacityPolicy,
    backoff: Duration,
}

impl SlotArbiter {
    pub fn new(
        backend: Arc<dyn LeaseBackend>,
        probe: Arc<dyn MemoryProbe>,
        policy: CapacityPolicy,
        backoff: Duration,
    ) -> Self {
        Self {
            backend,
            probe,
            policy,
            backoff,
        }
    }

    /// File-backed arbiter reading live system memory.
    pub fn from_config(config: &SlotConfig, slot_dir: &Path) -> Self {
        Self::new(
            Arc::new(FileLeaseBackend::new(
                slot_dir,
                Duration::from_secs(config.stale_lock_secs),
            )),
            Arc::new(SystemMemoryProbe::new()),
            CapacityPolicy::from_config(config),
            Duration::from_millis(config.backoff_ms),
        )
    }

    /// Current capacity for `budget_mb`, using live free memory.
    pub fn capacity(&self, budget_mb: u64) -> usize {
        self.policy
            .capacity(budget_mb, self.probe.available_bytes())
    }

    /// Slots currently locked by any process.
    pub async fn held(&self) -> Result<Vec<usize>> {
        self.backend.held().await
    }

    /// One full scan over `0..capacity`. Capacity is re-derived on each call.
    pub async fn try_acquire(&self, budget_mb: u64) -> Result<Option<SlotGuard>> {
        let capacity = self.capacity(budget_mb);
        for index in 0..capacity {
            if let Some(lease) = self.backend.try_acquire(index).await? {
                debug!(slot = index, capacity, "Render slot granted");
                return Ok(Some(SlotGuard::new(lease, self.backend.clone())));
            }
        }
        Ok(None)
    }

    /// Wait until a slot is free, rescanning after each backoff.
    pub async fn acquire(&self, budget_mb: u64) -> Result<SlotGuard> {
        let mut waited = false;
        loop {
            if let Some(guard) = self.try_acquire(budget_mb).await? {
                return Ok(guard);
            }
            if !waited {
                debug!(
                    budget_mb,
                    capacity = self.capacity(budget_mb),
                    "All render slots busy, waiting"
                );
                waited = true;
            }
            tokio::time::sleep(self.backoff).await;
        }
    }

    /// Run `task` while holding a render slot.
    ///
    /// The slot is renewed periodically while the task runs and released
    /// when it finishes, whether it succeeded or not.
    pub async fn with_slot<F, Fut, T>(&self, budget_mb: u64, task: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(budget_mb).await?;

        let fut = task();
        tokio::pin!(fut);
        let mut ticker = tokio::time::interval(RENEW_INTERVAL);
        ticker.tick().await;

        let outcome = loop {
            tokio::select! {
                out = &mut fut => break out,
                _ = ticker.tick() => {
                    if let Err(e) = guard.renew().await {
                        warn!(slot = guard.index(), error = %e, "Failed to renew render slot");
                    }
                }
            }
        };

        let released = guard.release().await;
        match (outcome, released) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!(error = %release_err, "Failed to release render slot after task error");
                Err(e)
            }
            (Err(e), Ok(_)) => Err(e),
        }
    }
}

/// A held render slot. Released explicitly, or best-effort on drop.
pub struct SlotGuard {
    lease: Option<Lease>,
    backend: Arc<dyn LeaseBackend>,
}

impl SlotGuard {
    fn new(lease: Lease, backend: Arc<dyn LeaseBackend>) -> Self {
        Self {
            lease: Some(lease),
            backend,
        }
    }

    pub fn index(&self) -> usize {
        self.lease.as_ref().map(|l| l.index).unwrap_or_default()
    }

    pub fn token(&self) -> &str {
        self.lease.as_ref().map(|l| l.token.as_str()).unwrap_or_default()
    }

    /// Refresh the lease. Returns `false` if it was lost.
    pub async fn renew(&self) -> Result<bool> {
        match &self.lease {
            Some(lease) => self.backend.renew(lease).await,
            None => Ok(false),
        }
    }

    /// Release the slot. Returns `false` if it was no longer ours.
    pub async fn release(mut self) -> Result<bool> {
        match self.lease.take() {
            Some(lease) => self.backend.release(&lease).await,
            None => Ok(false),
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.backend.release_blocking(&lease);
        }
    }
}
