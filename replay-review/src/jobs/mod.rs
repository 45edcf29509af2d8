//! Durable job ledger.
//!
//! Each recording discovered by the daemon becomes one job. The job file
//! records its status lifecycle, error or result, and a capped log.

mod model;
mod store;

pub use model::{
    JobCounts, JobLogEntry, JobRecord, JobStatus, LogLevel, MAX_JOB_LOGS, SESSION_JOB_TYPE,
    SessionJobPayload, StatusUpdate,
};
pub use store::JobStore;
