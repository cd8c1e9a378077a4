//! Core error types and utilities

use thiserror::Error;

/// Errors raised while serving connections and supervising workers
#[derive(Error, Debug)]
pub enum SolvdError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Staging error: {0}")]
    StagingIo(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Worker exited with status {code}")]
    WorkerFailure { code: i32 },

    #[error("Worker cancelled: peer went away")]
    Cancelled,

    #[error("Result file error: {0}")]
    ResultIo(String),

    #[error("Process signal error: {0}")]
    ProcessSignal(String),

    #[error("Process wait error: {0}")]
    ProcessWait(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl SolvdError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            SolvdError::Configuration(_) => "SOLVD001",
            SolvdError::Bind { .. } => "SOLVD002",
            SolvdError::Accept(_) => "SOLVD003",
            SolvdError::StagingIo(_) => "SOLVD004",
            SolvdError::Spawn(_) => "SOLVD005",
            SolvdError::WorkerFailure { .. } => "SOLVD006",
            SolvdError::Cancelled => "SOLVD007",
            SolvdError::ResultIo(_) => "SOLVD008",
            SolvdError::ProcessSignal(_) => "SOLVD009",
            SolvdError::ProcessWait(_) => "SOLVD010",
            SolvdError::Io(_) => "SOLVD011",
            SolvdError::Protocol(_) => "SOLVD012",
        }
    }

    /// Whether this error takes the whole process down rather than a single
    /// connection
    pub fn is_fatal(&self) -> bool {
        matches!(self, SolvdError::Configuration(_) | SolvdError::Bind { .. })
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, SolvdError>;
