//! Global render slot arbitration.
//!
//! Renders are memory-hungry (a headless browser plus an encoder), and several
//! processes on one host may render at once: the daemon and ad hoc
//! `replay-review render` invocations. They coordinate through numbered lock
//! files in a shared directory. The number of usable slots is derived from a
//! memory budget and the live free memory on every acquisition attempt:
//!
//! ```text
//! effective_mb = min(budget_mb, floor(free_bytes * utilization / MiB))
//! capacity     = max(1, floor(effective_mb / per_render_mb))
//! ```

mod arbiter;
mod capacity;
mod lease;

pub use arbiter::{SlotArbiter, SlotGuard};
pub use capacity::{CapacityPolicy, FixedMemoryProbe, MIB, MemoryProbe, SystemMemoryProbe};
pub use lease::{FileLeaseBackend, Lease, LeaseBackend, LivenessCheck, SlotLock};
