//! Child-process and PID helpers shared across the workspace.
//!
//! - console-less command builders (no flashing console window on Windows)
//! - PID liveness probing used for stale lock and pid-file recovery

use std::ffi::OsStr;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` for a tool we supervise.
///
/// The child never opens a console window and is killed when the handle is
/// dropped, so a cancelled or timed-out caller cannot leak a browser or
/// encoder process.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// PID of the calling process.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Whether a process with `pid` currently exists on this host.
///
/// The calling process is always alive. Zombie processes are reported as
/// dead so that locks held by an unreaped child are reclaimable.
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == current_pid() {
        return true;
    }
    if pid == 0 {
        return false;
    }

    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing(),
    );

    match system.process(target) {
        Some(process) => !matches!(process.status(), sysinfo::ProcessStatus::Zombie),
        None => false,
    }
}
