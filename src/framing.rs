//! Line framing for wire messages and handshake lines.
//!
//! A wire message is one ledger snapshot encoded as compact JSON followed by
//! exactly one `\n`. JSON escapes newlines inside strings, so a frame can
//! never contain a bare line break.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::ledger::Ledger;

/// Upper bound for a handshake line, terminator included.
pub const MAX_HANDSHAKE_LINE: usize = 512;

/// Upper bound for a wire message, terminator excluded.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Encode `ledger` as one newline-terminated wire message.
pub fn encode_message(ledger: &Ledger) -> Result<String> {
    encode_line(ledger)
}

fn encode_line<T: Serialize>(value: &T) -> Result<String> {
    let mut line = serde_json::to_string(value).map_err(Error::EncodeFailed)?;
    line.push('\n');
    Ok(line)
}

/// Decode one frame, without its terminator, into a ledger.
pub fn decode_message(frame: &[u8]) -> Result<Ledger> {
    Ok(serde_json::from_slice(frame)?)
}

/// Write `ledger` as one message and flush it.
pub async fn write_message<W>(writer: &mut W, ledger: &Ledger) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = encode_message(ledger)?;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(Error::StreamClosed)?;
    writer.flush().await.map_err(Error::StreamClosed)
}

/// Read the next complete frame, without its `\n` (or `\r\n`) terminator.
///
/// Returns `Ok(None)` at end of stream. Bytes after the last newline are an
/// incomplete frame and are dropped, also ending the stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    read_frame_limited(reader, MAX_MESSAGE_LEN).await
}

/// [`read_frame`] with a caller-chosen bound on the frame length.
///
/// A frame longer than `limit` fails with [`Error::FrameTooLong`]; the rest of
/// that line is discarded, so the next call starts at the following frame.
pub async fn read_frame_limited<R>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();
    let bound = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let read = (&mut *reader)
        .take(bound)
        .read_until(b'\n', &mut frame)
        .await
        .map_err(Error::StreamClosed)?;
    if read == 0 {
        return Ok(None);
    }
    if frame.last() != Some(&b'\n') {
        if frame.len() > limit {
            discard_line(reader).await.map_err(Error::StreamClosed)?;
            return Err(Error::FrameTooLong { limit });
        }
        debug!(bytes = read, "discarding incomplete trailing frame");
        return Ok(None);
    }

    frame.pop();
    if frame.last() == Some(&b'\r') {
        frame.pop();
    }
    Ok(Some(frame))
}

/// Skip everything up to and including the next newline, or to end of stream.
async fn discard_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(());
        }
        let (used, done) = match buf.iter().position(|byte| *byte == b'\n') {
            Some(at) => (at + 1, true),
            None => (buf.len(), false),
        };
        reader.consume(used);
        if done {
            return Ok(());
        }
    }
}

/// Write a single handshake line and flush.
pub async fn write_handshake_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Read one handshake line a byte at a time.
///
/// Reading unbuffered guarantees that nothing past the newline is consumed,
/// so the stream can be handed to a buffered reader afterwards.
pub async fn read_handshake_line<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    loop {
        let byte = reader.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() >= MAX_HANDSHAKE_LINE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake line too long",
            ));
        }
    }
    String::from_utf8(line).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}
