//! Line-oriented wire protocol
//!
//! Both directions are newline-delimited text ending with a `THE END` line.
//! Lines are handled as raw bytes; only the line ending is interpreted.

use schema::TERMINATOR;
use std::io::{Error, ErrorKind};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted request line, line ending included (64KB)
pub const MAX_LINE_SIZE: usize = 64 * 1024;

/// Whether `line` (without its line ending) is the terminator.
///
/// Surrounding whitespace is ignored and the comparison is case-insensitive.
pub fn is_terminator(line: &[u8]) -> bool {
    line.trim_ascii().eq_ignore_ascii_case(TERMINATOR.as_bytes())
}

/// Drop a trailing `\n` or `\r\n`
pub fn strip_line_ending(line: &mut Vec<u8>) {
    if matches!(line.last(), Some(b'\n')) {
        line.pop();
        if matches!(line.last(), Some(b'\r')) {
            line.pop();
        }
    }
}

/// Read the next line into `buf` without its line ending.
///
/// Returns `false` at end of stream. A final line without a line ending is
/// still returned.
pub async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    read_line_limited(reader, buf, usize::MAX).await
}

/// Like [`read_line`], but a line longer than `limit` bytes (line ending
/// included) fails with [`ErrorKind::InvalidData`]. At most `limit + 1`
/// bytes are buffered.
pub async fn read_line_limited<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let n = (&mut *reader).take(cap).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(false);
    }
    if buf.len() > limit {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("line exceeds {} bytes", limit),
        ));
    }
    strip_line_ending(buf);
    Ok(true)
}

/// Write `line` followed by `\n`
pub async fn write_line<W>(writer: &mut W, line: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line).await?;
    writer.write_all(b"\n").await
}

/// Write the terminator line
pub async fn write_terminator<W>(writer: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_line(writer, TERMINATOR.as_bytes()).await
}
