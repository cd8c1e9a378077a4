//! Worker supervision
//!
//! A [`WorkerSupervisor`] owns exactly one worker process from spawn to its
//! outcome:
//!
//! ```text
//! Running → ExitedOk | ExitedError(code) | Killed
//! ```
//!
//! The outcome is reached once; later `wait`/`cancel` calls return it
//! unchanged.

use crate::process::{self, ChildProcess};
use crate::watcher::CancellationSignal;
use crate::Result;
use schema::ArtifactMode;
use std::ffi::OsStr;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument, Span};

/// How long to let output forwarders drain after the worker is gone
const LOG_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Terminal state of one worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Exited with status 0
    ExitedOk,
    /// Exited with a non-zero status; signal deaths map to `128 + signal`
    ExitedError(i32),
    /// Forcibly terminated by [`WorkerSupervisor::cancel`]
    Killed,
}

impl WorkerOutcome {
    fn from_exit(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => WorkerOutcome::ExitedOk,
            Some(code) => WorkerOutcome::ExitedError(code),
            None => {
                use std::os::unix::process::ExitStatusExt;
                WorkerOutcome::ExitedError(128 + status.signal().unwrap_or(0))
            }
        }
    }
}

/// Supervises a single worker invocation
#[derive(Debug)]
pub struct WorkerSupervisor {
    child: ChildProcess,
    /// `None` while running
    outcome: Option<WorkerOutcome>,
    forwarders: Vec<JoinHandle<()>>,
}

impl WorkerSupervisor {
    /// Spawn `program` with no arguments in `working_dir`, adding `envs` to
    /// the inherited environment. The worker's stdout and stderr are forwarded
    /// to the current span at debug level.
    pub fn start<I, K, V>(program: &Path, working_dir: &Path, envs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        let mut child = process::spawn(program, working_dir, envs)?;
        info!(pid = child.pid(), "Worker started");

        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.take_stdout() {
            forwarders.push(spawn_output_forwarder(stdout, "stdout"));
        }
        if let Some(stderr) = child.take_stderr() {
            forwarders.push(spawn_output_forwarder(stderr, "stderr"));
        }

        Ok(Self {
            child,
            outcome: None,
            forwarders,
        })
    }

    /// Process ID of the worker
    pub fn pid(&self) -> u32 {
        self.child.pid()
    }

    /// Wait for the worker to exit on its own
    pub async fn wait(&mut self) -> Result<WorkerOutcome> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }
        let status = self.child.wait().await?;
        Ok(self.settle(WorkerOutcome::from_exit(status)))
    }

    /// Forcibly terminate the worker and its process group.
    ///
    /// No-op once the worker has an outcome.
    pub async fn cancel(&mut self) -> Result<WorkerOutcome> {
        if let Some(outcome) = self.outcome {
            debug!("Cancel after worker reached {:?}; nothing to do", outcome);
            return Ok(outcome);
        }
        process::signal_kill_group(&self.child)?;
        let status = self.child.wait().await?;
        debug!(pid = self.pid(), "Worker reaped after kill: {}", status);
        Ok(self.settle(WorkerOutcome::Killed))
    }

    /// Block until the worker exits or `signal` is raised, whichever comes
    /// first. A raised signal kills the worker.
    pub async fn supervise(&mut self, signal: &mut CancellationSignal) -> Result<WorkerOutcome> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }
        tokio::select! {
            status = self.child.wait() => {
                Ok(self.settle(WorkerOutcome::from_exit(status?)))
            }
            reason = signal.raised() => {
                info!(pid = self.pid(), "Cancelling worker: {:?}", reason);
                self.cancel().await
            }
        }
    }

    /// Give the output forwarders a moment to flush what the worker printed
    pub async fn drain_output(&mut self) {
        for handle in self.forwarders.drain(..) {
            let abort = handle.abort_handle();
            if tokio::time::timeout(LOG_DRAIN_GRACE, handle).await.is_err() {
                abort.abort();
            }
        }
    }

    fn settle(&mut self, outcome: WorkerOutcome) -> WorkerOutcome {
        self.outcome = Some(outcome);
        match outcome {
            WorkerOutcome::ExitedOk => info!(pid = self.pid(), "Worker exited successfully"),
            WorkerOutcome::ExitedError(code) => {
                warn!(pid = self.pid(), code, "Worker exited with failure")
            }
            WorkerOutcome::Killed => info!(pid = self.pid(), "Worker killed"),
        }
        outcome
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        for handle in &self.forwarders {
            handle.abort();
        }
        if self.outcome.is_none() {
            // kill_on_drop only reaches the direct child
            let _ = process::signal_kill_group(&self.child);
        }
    }
}

/// Convenience wrapper: spawn, supervise against `signal`, drain output.
pub async fn invoke<I, K, V>(
    program: &Path,
    working_dir: &Path,
    envs: I,
    signal: &mut CancellationSignal,
) -> Result<WorkerOutcome>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    let mut supervisor = WorkerSupervisor::start(program, working_dir, envs)?;
    let outcome = supervisor.supervise(signal).await?;
    supervisor.drain_output().await;
    Ok(outcome)
}

fn spawn_output_forwarder<R>(reader: R, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(
        async move {
            let mut reader = BufReader::new(reader);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&line);
                        debug!(stream, "worker: {}", text.trim_end());
                    }
                    Err(e) => {
                        debug!(stream, "Error reading worker output: {}", e);
                        break;
                    }
                }
            }
        }
        .instrument(Span::current()),
    )
}

/// Serializes worker access when every connection shares the same file names
#[derive(Debug, Clone, Default)]
pub struct WorkerGate {
    lock: Option<Arc<Mutex<()>>>,
}

impl WorkerGate {
    /// Gate matching the naming policy: open for per-connection names,
    /// exclusive for shared ones
    pub fn for_mode(mode: ArtifactMode) -> Self {
        match mode {
            ArtifactMode::PerConnection => Self { lock: None },
            ArtifactMode::Shared => Self {
                lock: Some(Arc::new(Mutex::new(()))),
            },
        }
    }

    /// Wait for the right to stage, run and read back; released on drop
    pub async fn enter(&self) -> Option<OwnedMutexGuard<()>> {
        match &self.lock {
            Some(lock) => Some(Arc::clone(lock).lock_owned().await),
            None => None,
        }
    }
}
