//! Configuration loading and validation for solvd
//!
//! Parses the optional TOML configuration into [`schema::DaemonConfig`],
//! validates it with field-path error messages, and resolves the paths the
//! worker needs into a form that does not depend on the worker's own
//! working directory.

use crate::{Result, SolvdError};
use schema::DaemonConfig;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Load the daemon configuration from a TOML file path
pub fn load_config_from_toml_path(path: impl AsRef<Path>) -> Result<DaemonConfig> {
    let data = fs::read_to_string(&path).map_err(|e| {
        SolvdError::Configuration(format!("Failed to read config {:?}: {}", path.as_ref(), e))
    })?;
    load_config_from_toml_str(&data)
}

/// Load the daemon configuration from a TOML string.
///
/// Only syntax is checked here; call [`validate`] once command-line overrides
/// have been applied.
pub fn load_config_from_toml_str(input: &str) -> Result<DaemonConfig> {
    toml::from_str(input)
        .map_err(|e| SolvdError::Configuration(format!("TOML parse error: {}", e)))
}

/// Validate a fully merged configuration
pub fn validate(config: &DaemonConfig) -> Result<()> {
    if config.port == 0 {
        return Err(invalid("port", "must be 1..=65535"));
    }
    if config.host.trim().is_empty() {
        return Err(invalid("host", "cannot be empty"));
    }

    let worker = &config.worker;
    if worker.executable.as_os_str().is_empty() {
        return Err(invalid("worker.executable", "cannot be empty"));
    }
    validate_file_name("worker.inputFileName", &worker.input_file_name)?;
    validate_file_name("worker.resultFileName", &worker.result_file_name)?;
    if worker.input_file_name == worker.result_file_name {
        return Err(invalid(
            "worker.resultFileName",
            "must differ from worker.inputFileName",
        ));
    }

    let dir = &worker.working_directory;
    match fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(invalid(
            "worker.workingDirectory",
            &format!("{} is not a directory", dir.display()),
        )),
        Err(e) => Err(invalid(
            "worker.workingDirectory",
            &format!("{}: {}", dir.display(), e),
        )),
    }
}

/// Make the worker's paths absolute.
///
/// The working directory is canonicalized. An executable given as a relative
/// path with more than one component is anchored at the daemon's current
/// directory, so `./solver` means the same thing no matter where the worker
/// runs; a bare name is left for `PATH` lookup.
pub fn resolve_paths(mut config: DaemonConfig) -> Result<DaemonConfig> {
    let worker = &mut config.worker;
    worker.working_directory = fs::canonicalize(&worker.working_directory).map_err(|e| {
        invalid(
            "worker.workingDirectory",
            &format!("{}: {}", worker.working_directory.display(), e),
        )
    })?;

    if worker.executable.is_relative() && worker.executable.components().count() > 1 {
        worker.executable = absolute(&worker.executable)?;
    }
    Ok(config)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    let cwd = std::env::current_dir().map_err(|e| {
        SolvdError::Configuration(format!("Cannot determine current directory: {}", e))
    })?;
    Ok(cwd.join(path))
}

fn validate_file_name(field: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(invalid(field, "cannot be empty"));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(invalid(field, "must be a plain file name without directories")),
    }
}

fn invalid(field: &str, message: &str) -> SolvdError {
    SolvdError::Configuration(format!("{}: {}", field, message))
}
