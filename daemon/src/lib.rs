//! Daemon library for solvd
//!
//! Accepts TCP connections and gives each one its own task running a
//! [`handler::ConnectionHandler`]. Connections never wait for each other
//! unless the worker is configured with shared artifact names.

#![allow(unused_crate_dependencies)]

pub mod handler;
pub mod protocol;

use handler::{ConnectionHandler, HandlerContext};
use schema::DaemonConfig;
use solvd_core::{ConnectionId, Result, SolvdError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Pause after a failed accept so a persistent error (e.g. out of file
/// descriptors) does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The main daemon server
#[derive(Debug, Clone)]
pub struct Daemon {
    config: Arc<DaemonConfig>,
    ctx: Arc<HandlerContext>,
    shutdown: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
}

impl Daemon {
    /// Create a new daemon instance from a validated configuration
    #[must_use]
    pub fn new(config: DaemonConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx: Arc::new(HandlerContext::new(config.worker.clone())),
            config: Arc::new(config),
            shutdown: Arc::new(shutdown),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Configuration the daemon was built with
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Bind the configured listening address
    ///
    /// # Errors
    /// Returns [`SolvdError::Bind`] if the address cannot be bound.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| SolvdError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let bound = listener.local_addr().map(|a| a.to_string()).unwrap_or(addr);
        info!("Listening on {}", bound);
        Ok(listener)
    }

    /// Accept connections on `listener` until [`Daemon::stop`] is called.
    ///
    /// Connections already being served keep running after the loop ends.
    pub async fn serve(&self, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = async { drop(shutdown.wait_for(|stop| *stop).await) } => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) => {
                        error!("{}", SolvdError::Accept(e));
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }

    /// Stop accepting connections
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let id = ConnectionId::new();
        let span = info_span!("conn", conn = %id, peer = %peer);
        let ctx = Arc::clone(&self.ctx);
        let active = Arc::clone(&self.active);

        tokio::spawn(
            async move {
                let serving = active.fetch_add(1, Ordering::SeqCst) + 1;
                info!(active = serving, "Connection accepted");
                let (reader, writer) = stream.into_split();
                let outcome = ConnectionHandler::new(ctx, id, peer).run(reader, writer).await;
                let remaining = active.fetch_sub(1, Ordering::SeqCst) - 1;
                report(outcome, remaining);
            }
            .instrument(span),
        );
    }
}

fn report(outcome: Result<usize>, active: usize) {
    match outcome {
        Ok(lines) => debug!(lines, active, "Connection finished"),
        Err(e @ SolvdError::Cancelled) => info!(code = e.code(), active, "{}", e),
        Err(e @ (SolvdError::WorkerFailure { .. } | SolvdError::Protocol(_))) => {
            warn!(code = e.code(), active, "{}", e)
        }
        Err(e) => error!(code = e.code(), active, "Connection failed: {}", e),
    }
}
