//! Memory-aware capacity calculation.
//!
//! The same formula sizes both the cross-process render slots and the
//! daemon's worker limit, so both shrink under memory pressure.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use crate::config::SlotConfig;

pub const MIB: u64 = 1024 * 1024;

/// Source of the live free-memory figure.
pub trait MemoryProbe: Send + Sync {
    /// Memory currently available for new allocations, in bytes.
    fn available_bytes(&self) -> u64;
}

/// Reads available memory from the operating system.
pub struct SystemMemoryProbe {
    system: parking_lot::Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: parking_lot::Mutex::new(System::new_with_specifics(
                RefreshKind::nothing().with_memory(MemoryRefreshKind::nothing().with_ram()),
            )),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn available_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram());
        system.available_memory()
    }
}

/// A probe reporting a settable, fixed amount of free memory.
#[derive(Debug)]
pub struct FixedMemoryProbe {
    bytes: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(bytes),
        }
    }

    pub fn from_mb(mb: u64) -> Self {
        Self::new(mb.saturating_mul(MIB))
    }

    pub fn set_bytes(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn available_bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }
}

/// Parameters of the capacity formula, minus the per-call budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapacityPolicy {
    /// Memory cost of one unit of work (one render).
    pub per_unit_mb: u64,
    /// Fraction of free memory considered usable.
    pub utilization: f64,
}

impl CapacityPolicy {
    pub fn new(per_unit_mb: u64, utilization: f64) -> Self {
        Self {
            per_unit_mb: per_unit_mb.max(1),
            utilization,
        }
    }

    pub fn from_config(config: &SlotConfig) -> Self {
        Self::new(config.per_render_memory_mb, config.memory_utilization)
    }

    /// `min(budget, floor(free * utilization / MiB))`.
    pub fn effective_budget_mb(&self, budget_mb: u64, free_bytes: u64) -> u64 {
        let usable_mb = ((free_bytes as f64 * self.utilization) / MIB as f64).floor() as u64;
        budget_mb.min(usable_mb)
    }

    /// `max(1, floor(effective_budget / per_unit))`.
    pub fn capacity(&self, budget_mb: u64, free_bytes: u64) -> usize {
        let effective = self.effective_budget_mb(budget_mb, free_bytes);
        ((effective / self.per_unit_mb) as usize).max(1)
    }
}
