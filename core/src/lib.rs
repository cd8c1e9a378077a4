//! Core functionality for solvd
//!
//! The pieces a connection handler composes: per-connection staging files,
//! worker supervision with forced cancellation, and the watcher that notices
//! a peer going away while its worker runs.

pub mod config;
pub mod connection;
pub mod error;
#[cfg(unix)]
pub mod process;
pub mod staging;
pub mod watcher;
#[cfg(unix)]
pub mod worker;


pub use connection::{ConnectionId, WorkerArtifacts};
pub use error::{Result, SolvdError};
pub use staging::{StagedInput, StagingWriter, TransientStore};
pub use watcher::{CancellationSignal, DisconnectReason, DisconnectWatcher};
#[cfg(unix)]
pub use worker::{WorkerGate, WorkerOutcome, WorkerSupervisor};

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing; `RUST_LOG` takes precedence over `level`
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .map_err(|e| crate::SolvdError::Configuration(format!("log level '{}': {}", level, e)))?;

        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| crate::SolvdError::Configuration(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}
