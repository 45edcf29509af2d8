//! Session → user → group rollups.
//!
//! A user's narrative is built only once every one of their sessions has
//! finished analysis, and a group's only once none of its users is pending.
//! Each artifact stores a hash of its children so unchanged inputs skip
//! inference.

mod model;
mod orchestrator;
mod store;

pub use model::{GroupRollup, SessionAnalysis, UserRollup, analysis_hash, sort_by_start};
pub use orchestrator::{RollupOrchestrator, RollupOutcome, RollupPass, RollupReport};
pub use store::AnalysisStore;
