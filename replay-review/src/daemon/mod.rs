//! The long-running daemon.
//!
//! Each tick pulls new recordings into the job store, hands queued jobs to
//! workers up to the render slot capacity, and, once the queue has drained,
//! resolves the user and group rollups that session completions marked
//! dirty.

mod heartbeat;
mod pidfile;
mod runner;
mod signals;
mod state;
mod worker;

pub use heartbeat::{Heartbeat, HeartbeatReport};
pub use pidfile::{PidFile, read_pid};
pub use runner::{DaemonRunner, INTERRUPTED_ERROR, RunnerOptions, TickReport};
pub use signals::{cancel_on_shutdown_signal, wait_for_shutdown_signal};
pub use state::{DaemonState, StateStore};
pub use worker::{SessionJobResult, SessionWorker};
