//! Test utilities for integration tests in the daemon crate.

#![allow(dead_code)]

use daemon::Daemon;
use schema::{ArtifactMode, DaemonConfig};
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// Worker that copies its input to its result file
pub const COPY_WORKER: &str = r#"cp "$SOLVD_INPUT_FILE" "$SOLVD_RESULT_FILE""#;

/// Run the given future with a timeout, failing the test if it elapses.
pub async fn run_with_timeout<F, T>(duration: Duration, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(duration, fut)
        .await
        .expect("test timed out")
}

/// Run a future with a default timeout of 30 seconds.
pub async fn run_with_default_timeout<F, T>(fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    run_with_timeout(Duration::from_secs(30), fut).await
}

/// Write an executable `/bin/sh` script into `dir`
pub fn write_worker(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write worker");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod worker");
    path
}

/// A daemon serving on an ephemeral loopback port
pub struct TestDaemon {
    pub daemon: Daemon,
    pub addr: SocketAddr,
    pub workdir: PathBuf,
    server: JoinHandle<()>,
}

impl TestDaemon {
    /// Start a daemon whose worker is a script with `body`, running in `dir`
    pub async fn start(dir: &Path, body: &str, artifacts: ArtifactMode) -> Self {
        let workdir = std::fs::canonicalize(dir).expect("canonical workdir");
        let mut config = DaemonConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..DaemonConfig::default()
        };
        config.worker.executable = write_worker(&workdir, "worker.sh", body);
        config.worker.working_directory = workdir.clone();
        config.worker.artifacts = artifacts;

        let daemon = Daemon::new(config);
        let listener = daemon.bind().await.expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        let server = {
            let daemon = daemon.clone();
            tokio::spawn(async move { daemon.serve(listener).await })
        };
        Self {
            daemon,
            addr,
            workdir,
            server,
        }
    }

    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.expect("connect")
    }

    /// Send `request`, keep the sending side open, and read until the daemon
    /// closes the connection
    pub async fn exchange(&self, request: &[u8]) -> Vec<u8> {
        let mut stream = self.connect().await;
        stream.write_all(request).await.expect("send request");
        read_to_close(&mut stream).await
    }

    pub async fn shutdown(self) {
        self.daemon.stop();
        run_with_default_timeout(self.server)
            .await
            .expect("server task");
    }
}

/// Read until end of stream
pub async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut reply = Vec::new();
    run_with_default_timeout(stream.read_to_end(&mut reply))
        .await
        .expect("read reply");
    reply
}

/// Files in `dir` whose names start with `prefix`
pub fn files_with_prefix(dir: &Path, prefix: &str) -> Vec<String> {
    std::fs::read_dir(dir)
        .expect("read dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(prefix))
        .collect()
}

/// Wait until no staging file is left in `dir`
pub async fn assert_no_staging(dir: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let left = files_with_prefix(dir, "kin.i01");
        if left.is_empty() {
            return;
        }
        assert!(Instant::now() < deadline, "staging files left behind: {left:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll for a file and parse its contents as a pid
pub async fn wait_for_pid(path: &Path) -> i32 {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(text) = std::fs::read_to_string(path) {
            if let Ok(pid) = text.trim().parse() {
                return pid;
            }
        }
        assert!(Instant::now() < deadline, "{} never written", path.display());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Alive means present and not a zombie
pub fn process_alive(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.trim_start().chars().next())
            .is_some_and(|state| state != 'Z' && state != 'X'),
        Err(_) => false,
    }
}
