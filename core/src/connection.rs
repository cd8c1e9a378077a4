//! Per-connection identity and the file locations derived from it

use schema::{WorkerConfig, ENV_CONNECTION_ID, ENV_INPUT_FILE, ENV_RESULT_FILE};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Identifier unique to one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Staging and result locations for one connection
///
/// Input is always received under a name unique to the connection. In shared
/// mode it is moved to the fixed input name just before the worker starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArtifacts {
    connection_id: String,
    receive_name: String,
    handoff: bool,
    input_path: PathBuf,
    result_path: PathBuf,
}

impl WorkerArtifacts {
    /// Derive the locations for `id` from the worker configuration.
    ///
    /// `working_dir` should be absolute so the paths handed to the worker do
    /// not depend on its own working directory.
    pub fn derive(config: &WorkerConfig, working_dir: &Path, id: ConnectionId) -> Self {
        let connection_id = id.to_string();
        let receive_name = format!("{}.{}", config.input_file_name, connection_id);
        let input_name = config.input_name_for(&connection_id);
        Self {
            handoff: input_name != receive_name,
            input_path: working_dir.join(input_name),
            result_path: working_dir.join(config.result_name_for(&connection_id)),
            receive_name,
            connection_id,
        }
    }

    /// Connection-unique name the input is received under
    pub fn receive_name(&self) -> &str {
        &self.receive_name
    }

    /// Path the worker reads its input from
    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    /// Whether received input has to be moved to [`Self::input_path`]
    pub fn needs_handoff(&self) -> bool {
        self.handoff
    }

    /// Result file path
    pub fn result_path(&self) -> &Path {
        &self.result_path
    }

    /// Environment handed to the worker so it can find its files
    pub fn env(&self) -> [(&'static str, &std::ffi::OsStr); 3] {
        [
            (ENV_INPUT_FILE, self.input_path.as_os_str()),
            (ENV_RESULT_FILE, self.result_path.as_os_str()),
            (ENV_CONNECTION_ID, std::ffi::OsStr::new(&self.connection_id)),
        ]
    }
}
