//! solvd daemon binary
//!
//! Listens on a TCP port and runs the configured worker once per connection.

#![allow(unused_crate_dependencies)]

use anyhow::Context;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use daemon::Daemon;
use schema::{ArtifactMode, DaemonConfig};
use solvd_core::config;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "solvd")]
#[command(about = "Hands each connection's lines to a worker process and returns its result")]
#[command(version)]
struct Cli {
    /// TCP port to listen on
    #[arg(required_unless_present_any = ["config", "config_schema"])]
    port: Option<u16>,

    /// Worker executable, run with no arguments for every connection
    #[arg(required_unless_present_any = ["config", "config_schema"])]
    executable: Option<PathBuf>,

    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Directory the worker runs in and where its files live
    #[arg(long, value_name = "DIR")]
    workdir: Option<PathBuf>,

    /// TOML configuration file; flags and positionals override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Name of the worker's input file
    #[arg(long, value_name = "NAME")]
    input_name: Option<String>,

    /// Name of the worker's result file
    #[arg(long, value_name = "NAME")]
    result_name: Option<String>,

    /// Use the file names verbatim and run one worker at a time
    #[arg(long)]
    shared_artifacts: bool,

    /// Log level when RUST_LOG is not set
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Print the JSON Schema of the configuration file and exit
    #[arg(long)]
    config_schema: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.config_schema {
        return match print_config_schema() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        };
    }

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => Cli::command()
            .error(ErrorKind::InvalidValue, format!("{e:#}"))
            .exit(),
    };

    if let Err(e) = solvd_core::utils::init_tracing(&config.log_level) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }
    info!(
        executable = %config.worker.executable.display(),
        workdir = %config.worker.working_directory.display(),
        artifacts = ?config.worker.artifacts,
        "Starting solvd"
    );

    let daemon = Daemon::new(config);
    let listener = match daemon.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!(code = e.code(), "{}", e);
            return ExitCode::FAILURE;
        }
    };

    let stopper = daemon.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down...");
                stopper.stop();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    daemon.serve(listener).await;
    info!("Daemon stopped");
    ExitCode::SUCCESS
}

/// Merge defaults, the optional TOML file, flags and positionals, then
/// validate and resolve paths
fn build_config(cli: &Cli) -> anyhow::Result<DaemonConfig> {
    let mut config = match &cli.config {
        Some(path) => config::load_config_from_toml_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DaemonConfig::default(),
    };

    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(dir) = &cli.workdir {
        config.worker.working_directory = dir.clone();
    }
    if let Some(name) = &cli.input_name {
        config.worker.input_file_name = name.clone();
    }
    if let Some(name) = &cli.result_name {
        config.worker.result_file_name = name.clone();
    }
    if cli.shared_artifacts {
        config.worker.artifacts = ArtifactMode::Shared;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(executable) = &cli.executable {
        config.worker.executable = executable.clone();
    }

    config::validate(&config)?;
    Ok(config::resolve_paths(config)?)
}

fn print_config_schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(DaemonConfig);
    let text = serde_json::to_string_pretty(&schema).context("serializing schema")?;
    println!("{text}");
    Ok(())
}
