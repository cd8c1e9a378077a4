//! Schema definitions for solvd
//!
//! Shared configuration types used by the core library and the daemon binary.
//! Every type here derives a JSON Schema so the accepted TOML layout can be
//! published with `solvd --config-schema`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Line that ends a logical message in either direction of the wire protocol
pub const TERMINATOR: &str = "THE END";

/// Environment variable carrying the absolute staging file path to the worker
pub const ENV_INPUT_FILE: &str = "SOLVD_INPUT_FILE";
/// Environment variable carrying the absolute result file path to the worker
pub const ENV_RESULT_FILE: &str = "SOLVD_RESULT_FILE";
/// Environment variable carrying the connection identifier to the worker
pub const ENV_CONNECTION_ID: &str = "SOLVD_CONNECTION_ID";

/// Configuration structure for the daemon
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    /// Host to bind the listener to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind the listener to
    #[serde(default)]
    pub port: u16,
    /// Log level used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Worker invocation settings
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            log_level: default_log_level(),
            worker: WorkerConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// `host:port` string suitable for `TcpListener::bind`
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How staging and result files are named across concurrent connections
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactMode {
    /// Suffix both file names with the connection id; workers read the
    /// actual paths from the environment
    #[default]
    PerConnection,
    /// Use the configured names verbatim and serialize worker access
    /// process-wide
    Shared,
}

/// Everything needed to run the external worker for one connection
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Worker executable; a bare name is looked up on `PATH`
    #[serde(default)]
    pub executable: PathBuf,

    /// Directory the worker runs in and where its files live
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,

    /// Name of the file the worker reads its input from
    #[serde(default = "default_input_file_name")]
    pub input_file_name: String,

    /// Name of the file the worker writes its output to
    #[serde(default = "default_result_file_name")]
    pub result_file_name: String,

    /// Naming policy for the two files above
    #[serde(default)]
    pub artifacts: ArtifactMode,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::new(),
            working_directory: default_working_directory(),
            input_file_name: default_input_file_name(),
            result_file_name: default_result_file_name(),
            artifacts: ArtifactMode::default(),
        }
    }
}

impl WorkerConfig {
    /// Staging file name for the given connection id
    #[must_use]
    pub fn input_name_for(&self, connection_id: &str) -> String {
        match self.artifacts {
            ArtifactMode::PerConnection => format!("{}.{}", self.input_file_name, connection_id),
            ArtifactMode::Shared => self.input_file_name.clone(),
        }
    }

    /// Result file name for the given connection id
    #[must_use]
    pub fn result_name_for(&self, connection_id: &str) -> String {
        match self.artifacts {
            ArtifactMode::PerConnection => format!("{}.{}", self.result_file_name, connection_id),
            ArtifactMode::Shared => self.result_file_name.clone(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_working_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_input_file_name() -> String {
    "kin.i01".to_string()
}

fn default_result_file_name() -> String {
    "kin.o02".to_string()
}
