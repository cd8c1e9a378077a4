//! Per-connection request handling
//!
//! One [`ConnectionHandler`] drives one connection through
//!
//! ```text
//! ReceivingInput → Staged → Supervising → Responding → Closed
//! ```
//!
//! and may drop straight to `Closed` from any phase. Every resource acquired
//! along the way (staging file, gate turn, worker process, watcher task,
//! connection halves) is an owned value released on drop, so leaving the
//! handler by any path runs the same cleanup exactly once.

use crate::protocol;
use schema::WorkerConfig;
use solvd_core::worker::{self, WorkerOutcome};
use solvd_core::{
    CancellationSignal, ConnectionId, DisconnectWatcher, Result, SolvdError, StagingWriter,
    TransientStore, WorkerArtifacts, WorkerGate,
};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info};

/// Where a connection currently is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Reading request lines into the staging file
    ReceivingInput,
    /// Request fully written and closed
    Staged,
    /// Worker running, peer watched
    Supervising,
    /// Streaming the result file back
    Responding,
    /// All resources released
    Closed,
}

/// How the request stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEnd {
    /// A terminator line arrived; the peer is still connected
    Terminator,
    /// The peer closed its sending side
    EndOfStream,
}

/// State shared by every connection of one daemon
#[derive(Debug)]
pub struct HandlerContext {
    worker: WorkerConfig,
    store: TransientStore,
    gate: WorkerGate,
}

impl HandlerContext {
    /// Build the context for an already validated worker configuration
    pub fn new(worker: WorkerConfig) -> Self {
        Self {
            store: TransientStore::new(worker.working_directory.clone()),
            gate: WorkerGate::for_mode(worker.artifacts),
            worker,
        }
    }
}

/// Serves a single accepted connection
#[derive(Debug)]
pub struct ConnectionHandler {
    ctx: Arc<HandlerContext>,
    id: ConnectionId,
    peer: SocketAddr,
    phase: Phase,
}

impl ConnectionHandler {
    /// Handler for a connection from `peer`
    pub fn new(ctx: Arc<HandlerContext>, id: ConnectionId, peer: SocketAddr) -> Self {
        Self {
            ctx,
            id,
            peer,
            phase: Phase::ReceivingInput,
        }
    }

    /// Run the connection to completion.
    ///
    /// Returns the number of result lines sent. Worker failure and
    /// cancellation surface as [`SolvdError::WorkerFailure`] and
    /// [`SolvdError::Cancelled`]; in every error case nothing was written to
    /// the peer.
    pub async fn run<R, W>(mut self, reader: R, writer: W) -> Result<usize>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        debug!(peer = %self.peer, "Connection opened");
        let result = self.serve(reader, writer).await;
        self.enter(Phase::Closed);
        result
    }

    async fn serve<R, W>(&mut self, reader: R, writer: W) -> Result<usize>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let ctx = Arc::clone(&self.ctx);
        let dir = ctx.worker.working_directory.as_path();
        let artifacts = WorkerArtifacts::derive(&ctx.worker, dir, self.id);

        // declared first so the connection closes after everything else
        let mut out = BufWriter::new(writer);
        let mut input = BufReader::new(reader);

        let mut staging = ctx.store.create(artifacts.receive_name()).await?;
        let end = receive_input(&mut input, &mut staging).await?;
        debug!(lines = staging.lines(), ?end, "Request received");
        let staged = staging.seal().await?;
        self.enter(Phase::Staged);

        // armed before queueing for the gate so a peer that leaves while
        // waiting gives up its turn; after end of stream there is nothing
        // left on the input to observe
        let (watcher, mut signal) = match end {
            InputEnd::Terminator => {
                let (watcher, signal) = DisconnectWatcher::spawn(input);
                (Some(watcher), signal)
            }
            InputEnd::EndOfStream => (None, CancellationSignal::inert()),
        };

        let _turn = tokio::select! {
            biased;
            reason = signal.raised() => {
                info!("Peer went away before the worker started: {:?}", reason);
                return Err(SolvdError::Cancelled);
            }
            turn = ctx.gate.enter() => turn,
        };
        let _staged = if artifacts.needs_handoff() {
            staged.rename_to(artifacts.input_path()).await?
        } else {
            staged
        };

        self.enter(Phase::Supervising);
        let outcome = worker::invoke(
            &ctx.worker.executable,
            dir,
            artifacts.env(),
            &mut signal,
        )
        .await;
        if let Some(watcher) = watcher {
            watcher.stop().await;
        }

        match outcome? {
            WorkerOutcome::ExitedOk => {}
            WorkerOutcome::ExitedError(code) => return Err(SolvdError::WorkerFailure { code }),
            WorkerOutcome::Killed => return Err(SolvdError::Cancelled),
        }

        self.enter(Phase::Responding);
        let result = File::open(artifacts.result_path()).await.map_err(|e| {
            SolvdError::ResultIo(format!("{}: {}", artifacts.result_path().display(), e))
        })?;
        let sent = send_result(BufReader::new(result), &mut out).await?;
        protocol::write_terminator(&mut out).await?;
        out.flush().await?;
        info!(lines = sent, "Response sent");
        Ok(sent)
    }

    fn enter(&mut self, phase: Phase) {
        debug!("{:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }
}

/// Copy request lines into `staging` until a terminator line or end of
/// stream. The terminator itself is never staged. A line longer than
/// [`protocol::MAX_LINE_SIZE`] is a [`SolvdError::Protocol`].
pub async fn receive_input<R>(input: &mut R, staging: &mut StagingWriter) -> Result<InputEnd>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let more = protocol::read_line_limited(input, &mut line, protocol::MAX_LINE_SIZE)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidData => SolvdError::Protocol(e.to_string()),
                _ => SolvdError::Io(e),
            })?;
        if !more {
            return Ok(InputEnd::EndOfStream);
        }
        if protocol::is_terminator(&line) {
            return Ok(InputEnd::Terminator);
        }
        staging.append_line(&line).await?;
    }
}

/// Stream every line of `result` to `out`; returns the line count.
///
/// Failing to read the result is a [`SolvdError::ResultIo`]; failing to write
/// is plain I/O on the connection.
pub async fn send_result<R, W>(mut result: R, out: &mut W) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    let mut sent = 0;
    loop {
        let more = protocol::read_line(&mut result, &mut line)
            .await
            .map_err(|e| SolvdError::ResultIo(format!("read failed: {}", e)))?;
        if !more {
            return Ok(sent);
        }
        protocol::write_line(out, &line).await?;
        sent += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::ArtifactMode;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(10);

    fn write_worker(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("worker.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn context(dir: &Path, body: &str) -> Arc<HandlerContext> {
        let worker = WorkerConfig {
            executable: write_worker(dir, body),
            working_directory: std::fs::canonicalize(dir).unwrap(),
            ..WorkerConfig::default()
        };
        Arc::new(HandlerContext::new(worker))
    }

    fn handler(ctx: &Arc<HandlerContext>) -> ConnectionHandler {
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        ConnectionHandler::new(Arc::clone(ctx), ConnectionId::new(), peer)
    }

    /// Client sends `request`, optionally closes its side, and collects the reply
    async fn exchange(
        ctx: &Arc<HandlerContext>,
        request: &[u8],
        close_after_send: bool,
    ) -> (Result<usize>, Vec<u8>) {
        let (mut client_tx, server_rx): (DuplexStream, DuplexStream) = tokio::io::duplex(4096);
        let (server_tx, mut client_rx) = tokio::io::duplex(4096);

        client_tx.write_all(request).await.unwrap();
        let keep_open = if close_after_send {
            drop(client_tx);
            None
        } else {
            Some(client_tx)
        };

        let result = timeout(WAIT, handler(ctx).run(server_rx, server_tx))
            .await
            .expect("handler timed out");
        let mut reply = Vec::new();
        client_rx.read_to_end(&mut reply).await.unwrap();
        drop(keep_open);
        (result, reply)
    }

    fn staging_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("kin.i01"))
            .collect()
    }

    const COPY: &str = r#"cp "$SOLVD_INPUT_FILE" "$SOLVD_RESULT_FILE""#;

    #[tokio::test]
    async fn test_success_echoes_result_and_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), COPY);

        let (result, reply) = exchange(&ctx, b"line1\nline2\nTHE END\n", false).await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(reply, b"line1\nline2\nTHE END\n");
        assert!(staging_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_terminator_in_any_case_is_not_staged() {
        for terminator in ["the end", "The End", "  THE END  ", "tHe EnD\r"] {
            let dir = tempfile::tempdir().unwrap();
            let ctx = context(dir.path(), COPY);
            let request = format!("a\n{terminator}\n");

            let (result, reply) = exchange(&ctx, request.as_bytes(), false).await;
            assert_eq!(result.unwrap(), 1, "terminator {terminator:?}");
            assert_eq!(reply, b"a\nTHE END\n", "terminator {terminator:?}");
            assert!(staging_files(dir.path()).is_empty());
        }
    }

    #[tokio::test]
    async fn test_oversized_line_closes_without_reply() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), &format!("touch ran\n{COPY}"));

        let (mut client_tx, server_rx) = tokio::io::duplex(4096);
        let (server_tx, mut client_rx) = tokio::io::duplex(4096);
        let sender = tokio::spawn(async move {
            let long = vec![b'x'; protocol::MAX_LINE_SIZE + 10];
            // the handler stops reading once the limit is crossed
            let _ = client_tx.write_all(&long).await;
            let _ = client_tx.write_all(b"\nTHE END\n").await;
        });

        let result = timeout(WAIT, handler(&ctx).run(server_rx, server_tx))
            .await
            .expect("handler timed out");
        assert!(matches!(result, Err(SolvdError::Protocol(_))));
        sender.await.unwrap();

        let mut reply = Vec::new();
        client_rx.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
        assert!(staging_files(dir.path()).is_empty());
        assert!(!dir.path().join("ran").exists());
    }

    #[tokio::test]
    async fn test_line_at_limit_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), COPY);

        let (mut client_tx, server_rx) = tokio::io::duplex(4096);
        let (server_tx, mut client_rx) = tokio::io::duplex(4096);
        let mut line = vec![b'y'; protocol::MAX_LINE_SIZE - 1];
        line.push(b'\n');
        let sender = tokio::spawn(async move {
            client_tx.write_all(&line).await.unwrap();
            client_tx.write_all(b"THE END\n").await.unwrap();
            client_tx
        });
        let reader = tokio::spawn(async move {
            let mut reply = Vec::new();
            client_rx.read_to_end(&mut reply).await.unwrap();
            reply
        });

        let result = timeout(WAIT, handler(&ctx).run(server_rx, server_tx))
            .await
            .expect("handler timed out");
        assert_eq!(result.unwrap(), 1);
        let reply = reader.await.unwrap();
        assert_eq!(reply.len(), protocol::MAX_LINE_SIZE + "THE END\n".len());
        drop(sender.await.unwrap());
    }

    #[tokio::test]
    async fn test_peer_leaving_while_queued_never_starts_worker() {
        let dir = tempfile::tempdir().unwrap();
        let worker = WorkerConfig {
            executable: write_worker(
                dir.path(),
                "echo run >> runs.log\nsleep 3\ncp kin.i01 kin.o02",
            ),
            working_directory: std::fs::canonicalize(dir.path()).unwrap(),
            artifacts: ArtifactMode::Shared,
            ..WorkerConfig::default()
        };
        let ctx = Arc::new(HandlerContext::new(worker));
        let runs = dir.path().join("runs.log");

        // first connection takes the gate and keeps its peer connected
        let (mut first_tx, first_rx) = tokio::io::duplex(4096);
        let (first_out, mut first_reply) = tokio::io::duplex(4096);
        first_tx.write_all(b"first\nTHE END\n").await.unwrap();
        let first = tokio::spawn(handler(&ctx).run(first_rx, first_out));
        while !runs.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // second connection queues behind it, then its peer goes away
        let (mut second_tx, second_rx) = tokio::io::duplex(4096);
        let (second_out, _second_reply) = tokio::io::duplex(4096);
        second_tx.write_all(b"second\nTHE END\n").await.unwrap();
        drop(second_tx);
        let second = timeout(
            Duration::from_secs(2),
            handler(&ctx).run(second_rx, second_out),
        )
        .await
        .expect("queued connection should give up its turn promptly");
        assert!(matches!(second, Err(SolvdError::Cancelled)));
        assert!(!first.is_finished());

        assert_eq!(timeout(WAIT, first).await.unwrap().unwrap().unwrap(), 1);
        let mut reply = Vec::new();
        first_reply.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"first\nTHE END\n");
        drop(first_tx);

        assert_eq!(std::fs::read_to_string(&runs).unwrap(), "run\n");
        assert!(staging_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_lines_are_staged_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), COPY);
        let request = b"  leading\ntrailing  \n\nTHE ENDING\n\xff\xfe bytes\r\nTHE END\n";

        let (result, reply) = exchange(&ctx, request, false).await;
        assert_eq!(result.unwrap(), 5);
        assert_eq!(
            reply,
            b"  leading\ntrailing  \n\nTHE ENDING\n\xff\xfe bytes\nTHE END\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_end_of_stream_still_runs_worker() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), COPY);

        let (result, reply) = exchange(&ctx, b"x\n", true).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(reply, b"x\nTHE END\n");
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_staged_with_newline() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), COPY);

        let (result, reply) = exchange(&ctx, b"x\ny", true).await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(reply, b"x\ny\nTHE END\n");
    }

    #[tokio::test]
    async fn test_worker_failure_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), &format!("{COPY}\nexit 1"));

        let (result, reply) = exchange(&ctx, b"x\nTHE END\n", false).await;
        assert!(matches!(result, Err(SolvdError::WorkerFailure { code: 1 })));
        assert!(reply.is_empty());
        assert!(staging_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_missing_result_file_is_result_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "exit 0");

        let (result, reply) = exchange(&ctx, b"x\nTHE END\n", false).await;
        assert!(matches!(result, Err(SolvdError::ResultIo(_))));
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let worker = WorkerConfig {
            executable: dir.path().join("missing-worker"),
            working_directory: std::fs::canonicalize(dir.path()).unwrap(),
            ..WorkerConfig::default()
        };
        let ctx = Arc::new(HandlerContext::new(worker));

        let (result, reply) = exchange(&ctx, b"x\nTHE END\n", false).await;
        assert!(matches!(result, Err(SolvdError::Spawn(_))));
        assert!(reply.is_empty());
        assert!(staging_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_peer_close_cancels_worker() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "touch started\nexec sleep 30");

        let (mut client_tx, server_rx) = tokio::io::duplex(4096);
        let (server_tx, mut client_rx) = tokio::io::duplex(4096);
        client_tx.write_all(b"x\nTHE END\n").await.unwrap();

        let started = dir.path().join("started");
        let closer = tokio::spawn(async move {
            while !started.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            drop(client_tx);
        });

        let result = timeout(WAIT, handler(&ctx).run(server_rx, server_tx))
            .await
            .expect("cancellation should end the handler promptly");
        assert!(matches!(result, Err(SolvdError::Cancelled)));
        closer.await.unwrap();

        let mut reply = Vec::new();
        client_rx.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
        assert!(staging_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_shared_mode_uses_fixed_names_and_removes_input() {
        let dir = tempfile::tempdir().unwrap();
        let worker = WorkerConfig {
            executable: write_worker(dir.path(), "cp kin.i01 kin.o02"),
            working_directory: std::fs::canonicalize(dir.path()).unwrap(),
            artifacts: ArtifactMode::Shared,
            ..WorkerConfig::default()
        };
        let ctx = Arc::new(HandlerContext::new(worker));

        let (result, reply) = exchange(&ctx, b"shared\nTHE END\n", false).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(reply, b"shared\nTHE END\n");
        assert!(staging_files(dir.path()).is_empty());
        // the result file belongs to the worker's convention and stays
        assert!(dir.path().join("kin.o02").exists());
    }

    #[tokio::test]
    async fn test_receive_input_stops_at_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let store = TransientStore::new(dir.path());
        let mut staging = store.create("in").await.unwrap();
        let mut input = BufReader::new(&b"a\nb\nthe end\nc\n"[..]);

        let end = receive_input(&mut input, &mut staging).await.unwrap();
        assert_eq!(end, InputEnd::Terminator);
        assert_eq!(staging.lines(), 2);

        let staged = staging.seal().await.unwrap();
        assert_eq!(std::fs::read(staged.path()).unwrap(), b"a\nb\n");
    }

    #[tokio::test]
    async fn test_send_result_copies_lines() {
        let mut out = Vec::new();
        let sent = send_result(BufReader::new(&b"r1\r\nr2\n\nr4"[..]), &mut out)
            .await
            .unwrap();
        assert_eq!(sent, 4);
        assert_eq!(out, b"r1\nr2\n\nr4\n");
    }
}
