//! Peer liveness watching during worker execution
//!
//! The peer is not expected to send anything while its worker runs, so the
//! watcher simply parks on a one-byte read of the connection's input stream.
//! The read resolves through the runtime's readiness notification the moment
//! the peer closes, sends more bytes, or the socket errors; each of those
//! raises the [`CancellationSignal`] once and ends the watcher.

use std::future::pending;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

/// What the watcher saw on the input stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its sending side
    Closed,
    /// The peer sent bytes nobody asked for
    UnexpectedData,
    /// Reading the stream failed
    Error(ErrorKind),
}

/// One-shot cancellation event raised by a [`DisconnectWatcher`]
#[derive(Debug)]
pub struct CancellationSignal {
    rx: Option<oneshot::Receiver<DisconnectReason>>,
}

impl CancellationSignal {
    /// A signal that is never raised, for connections with nothing to watch
    pub fn inert() -> Self {
        Self { rx: None }
    }

    /// Resolve once the signal is raised.
    ///
    /// Never resolves if the watcher stopped without raising, so this can sit
    /// in a `select!` next to the worker wait. Cancel safe.
    pub async fn raised(&mut self) -> DisconnectReason {
        if let Some(rx) = self.rx.as_mut() {
            let outcome = rx.await;
            self.rx = None;
            if let Ok(reason) = outcome {
                return reason;
            }
        }
        pending().await
    }
}

/// Background task watching one connection's input stream
#[derive(Debug)]
pub struct DisconnectWatcher {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Option<DisconnectReason>>,
}

impl DisconnectWatcher {
    /// Start watching `reader`; the returned signal is raised at most once.
    ///
    /// Dropping the watcher also tears the task down.
    pub fn spawn<R>(mut reader: R) -> (Self, CancellationSignal)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (raise_tx, raise_rx) = oneshot::channel();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut probe = [0u8; 1];
            tokio::select! {
                biased;
                _ = &mut stop_rx => None,
                read = reader.read(&mut probe) => {
                    let reason = match read {
                        Ok(0) => DisconnectReason::Closed,
                        Ok(_) => DisconnectReason::UnexpectedData,
                        Err(e) => DisconnectReason::Error(e.kind()),
                    };
                    debug!("Peer activity while worker running: {:?}", reason);
                    // the handler may already be gone; nothing to cancel then
                    let _ = raise_tx.send(reason);
                    Some(reason)
                }
            }
        });

        let watcher = Self {
            stop_tx: Some(stop_tx),
            task,
        };
        let signal = CancellationSignal { rx: Some(raise_rx) };
        (watcher, signal)
    }

    /// Stop watching and wait for the task to finish.
    ///
    /// Returns the reason if the watcher had already raised its signal.
    pub async fn stop(mut self) -> Option<DisconnectReason> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        match (&mut self.task).await {
            Ok(reason) => reason,
            Err(e) => {
                debug!("Disconnect watcher task ended abnormally: {}", e);
                None
            }
        }
    }
}
