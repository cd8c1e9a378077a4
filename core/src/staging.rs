//! Per-connection staging files
//!
//! A [`TransientStore`] hands out [`StagingWriter`]s for files inside the
//! worker's working directory. Sealing a writer flushes and closes the file and
//! yields a [`StagedInput`] guard; the file is removed when that guard (or an
//! unsealed writer) is dropped, on every exit path of the owning connection.

use crate::{Result, SolvdError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

/// Directory-scoped factory for staging files
#[derive(Debug, Clone)]
pub struct TransientStore {
    dir: PathBuf,
}

impl TransientStore {
    /// Create a store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the staging file `name`.
    ///
    /// Fails if the file already exists, so two live connections can never
    /// write through the same name.
    pub async fn create(&self, name: &str) -> Result<StagingWriter> {
        let path = self.dir.join(name);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| {
                SolvdError::StagingIo(format!("cannot create {}: {}", path.display(), e))
            })?;
        debug!("Created staging file {}", path.display());

        Ok(StagingWriter {
            file: BufWriter::new(file),
            guard: StagedInput::new(path),
            lines: 0,
        })
    }
}

/// Open staging file accepting lines
#[derive(Debug)]
pub struct StagingWriter {
    file: BufWriter<File>,
    guard: StagedInput,
    lines: usize,
}

impl StagingWriter {
    /// Append one line; `line` must not carry its line ending
    pub async fn append_line(&mut self, line: &[u8]) -> Result<()> {
        if let Err(e) = write_line(&mut self.file, line).await {
            return Err(self.io_error("write", e));
        }
        self.lines += 1;
        Ok(())
    }

    /// Number of lines appended so far
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Path of the file being written
    pub fn path(&self) -> &Path {
        self.guard.path()
    }

    /// Flush, sync and close the file so another process can read all of it
    pub async fn seal(mut self) -> Result<StagedInput> {
        self.file
            .flush()
            .await
            .map_err(|e| self.io_error("flush", e))?;
        self.file
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| self.io_error("sync", e))?;

        let StagingWriter { file, guard, lines } = self;
        drop(file);
        debug!("Sealed {} with {} lines", guard.path().display(), lines);
        Ok(guard)
    }

    fn io_error(&self, op: &str, e: std::io::Error) -> SolvdError {
        SolvdError::StagingIo(format!("cannot {} {}: {}", op, self.path().display(), e))
    }
}

/// A sealed staging file, deleted when dropped
#[derive(Debug)]
pub struct StagedInput {
    path: PathBuf,
    removed: bool,
}

impl StagedInput {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            removed: false,
        }
    }

    /// Location of the staged data
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the staged data to `target`, replacing whatever is there.
    ///
    /// The returned guard deletes `target` instead. Used when the worker only
    /// understands a fixed input name.
    pub async fn rename_to(mut self, target: &Path) -> Result<StagedInput> {
        tokio::fs::rename(&self.path, target).await.map_err(|e| {
            SolvdError::StagingIo(format!(
                "cannot move {} to {}: {}",
                self.path.display(),
                target.display(),
                e
            ))
        })?;
        debug!("Moved {} to {}", self.path.display(), target.display());
        self.removed = true;
        Ok(StagedInput::new(target.to_path_buf()))
    }

}

impl Drop for StagedInput {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        match remove_quietly(&self.path) {
            Ok(()) => debug!("Removed staging file {}", self.path.display()),
            Err(e) => warn!("Failed to remove staging file {}: {}", self.path.display(), e),
        }
    }
}

async fn write_line(file: &mut BufWriter<File>, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.write_all(b"\n").await
}

fn remove_quietly(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
