//! Unix worker spawning with process groups
//!
//! Every worker is placed in its own session via `setsid()` so that a
//! cancellation can signal the whole tree the worker may have forked, not just
//! the direct child. Signals go to the negative PID (the process group).

// process management requires the libc::setsid() call in pre_exec
#![allow(unsafe_code)]

use crate::{Result, SolvdError};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
#[allow(unused_imports)]
use std::os::unix::process::CommandExt;
use std::ffi::OsStr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::{debug, error};

/// A worker process running as leader of its own process group
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    child: Child,
}

impl ChildProcess {
    /// Get the process ID
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Wait for the process to exit. Cancel safe.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child.wait().await.map_err(|e| {
            SolvdError::ProcessWait(format!("Failed to wait for process {}: {}", self.pid, e))
        })
    }

    /// Take the stdout handle for async reading, if available
    pub fn take_stdout(&mut self) -> Option<tokio::process::ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the stderr handle for async reading, if available
    pub fn take_stderr(&mut self) -> Option<tokio::process::ChildStderr> {
        self.child.stderr.take()
    }
}

/// Spawn `program` with no arguments inside `working_dir`, in a new process
/// group, with `envs` added to the inherited environment.
///
/// stdin is closed; stdout and stderr are piped so the caller can forward them
/// to the log. The child is killed if the handle is dropped while it runs.
///
/// ```rust,no_run
/// use solvd_core::process::unix::spawn;
/// use std::path::Path;
///
/// # async fn demo() -> solvd_core::Result<()> {
/// let mut child = spawn(Path::new("true"), Path::new("."), [("SOLVD_CONNECTION_ID", "demo")])?;
/// assert!(child.wait().await?.success());
/// # Ok(())
/// # }
/// ```
pub fn spawn<I, K, V>(program: &Path, working_dir: &Path, envs: I) -> Result<ChildProcess>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    debug!("Spawning worker {} in {}", program.display(), working_dir.display());

    let mut command = Command::new(program);
    command
        .current_dir(working_dir)
        .envs(envs)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Safety: setsid() is async-signal-safe and runs in the child before exec
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(|e| {
        error!("Failed to spawn worker '{}': {}", program.display(), e);
        SolvdError::Spawn(format!("'{}': {}", program.display(), e))
    })?;

    let raw_pid = child
        .id()
        .ok_or_else(|| SolvdError::Spawn("spawned worker did not have a PID".to_string()))?;
    let pid = Pid::from_raw(raw_pid as i32);
    debug!("Worker {} started in new process group", pid);

    Ok(ChildProcess { pid, child })
}

/// Send SIGKILL to the child's whole process group
///
/// `ESRCH` and `EPERM` mean the group is already gone (or the PID was reused
/// by someone we cannot signal) and are treated as success.
pub fn signal_kill_group(child: &ChildProcess) -> Result<()> {
    debug!("Sending SIGKILL to process group {}", child.pid);

    match killpg(child.pid, Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => {
            debug!("Process group {} already exited", child.pid);
            Ok(())
        }
        Err(nix::errno::Errno::EPERM) => {
            debug!(
                "Permission denied signaling process group {} (likely already exited)",
                child.pid
            );
            Ok(())
        }
        Err(e) => {
            error!("Failed to send SIGKILL to process group {}: {}", child.pid, e);
            Err(SolvdError::ProcessSignal(format!(
                "Failed to send SIGKILL to process group {}: {}",
                child.pid, e
            )))
        }
    }
}
