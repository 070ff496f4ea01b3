//! Line-framed wire codec.
//!
//! # Wire Format
//!
//! ```text
//! [put]\n              kind token
//! example.com\n        name (may be empty)
//! 1234\n               payload length, decimal
//! <1234 raw bytes>     payload, no trailing delimiter
//! ```
//!
//! Any first line that is not one of the four kind tokens is a log line and
//! carries no further fields. The payload is binary and is never scanned for
//! newlines: the decoder switches from line reads to an exact-length read as
//! soon as the length line has been parsed.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Command, CommandKind, ProtocolError};

/// Maximum payload size (10 MB)
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Encode the line portion of a framed command.
///
/// Returns `None` for log lines, which have no header.
pub fn encode_header(command: &Command) -> Option<Bytes> {
    let token = command.kind().token()?;
    let name = sanitize_line(command.name());
    let len = command.payload().len().to_string();

    let mut buf = BytesMut::with_capacity(token.len() + name.len() + len.len() + 3);
    buf.put_slice(token.as_bytes());
    buf.put_u8(b'\n');
    buf.put_slice(name.as_bytes());
    buf.put_u8(b'\n');
    buf.put_slice(len.as_bytes());
    buf.put_u8(b'\n');
    Some(buf.freeze())
}

/// Encode a log line so that it can never be mistaken for a frame header.
fn encode_log_line(text: &str) -> Bytes {
    let mut line = sanitize_line(text);
    if CommandKind::from_token(line.trim()).is_some() {
        line.insert(0, '>');
    }
    let mut buf = BytesMut::with_capacity(line.len() + 1);
    buf.put_slice(line.as_bytes());
    buf.put_u8(b'\n');
    buf.freeze()
}

fn sanitize_line(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
}

/// Write a command to the stream.
///
/// The header lines are flushed before any payload byte is written.
pub async fn write_command<W: AsyncWrite + Unpin>(
    writer: &mut W,
    command: &Command,
) -> Result<(), ProtocolError> {
    let Some(header) = encode_header(command) else {
        writer.write_all(&encode_log_line(command.name())).await?;
        writer.flush().await?;
        return Ok(());
    };

    if command.payload().len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: command.payload().len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    writer.write_all(&header).await?;
    writer.flush().await?;

    if !command.payload().is_empty() {
        writer.write_all(command.payload()).await?;
        writer.flush().await?;
    }

    Ok(())
}

/// Read the next command from the stream.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly on a frame
/// boundary. A stream that ends inside a frame, or a length line that is not
/// a decimal number, yields [`ProtocolError::Desync`].
pub async fn read_command<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Command>, ProtocolError> {
    let mut first = Vec::new();
    if reader.read_until(b'\n', &mut first).await? == 0 {
        return Ok(None);
    }
    let first = String::from_utf8_lossy(&first);

    let Some(kind) = CommandKind::from_token(first.trim()) else {
        return Ok(Some(Command::log_line(strip_newline(&first))));
    };

    let name = read_field(reader, "name").await?;
    let len_line = read_field(reader, "payload length").await?;
    let len: usize = len_line.trim().parse().map_err(|_| {
        ProtocolError::Desync(format!("invalid payload length {:?} for {}", len_line, kind))
    })?;

    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                ProtocolError::Desync(format!(
                    "stream ended inside {} byte payload for {}",
                    len, kind
                ))
            } else {
                ProtocolError::Io(e)
            }
        })?;
    }

    Ok(Some(Command::new(kind, name, payload)))
}

async fn read_field<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    field: &str,
) -> Result<String, ProtocolError> {
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line).await?;
    if line.last() != Some(&b'\n') {
        return Err(ProtocolError::Desync(format!(
            "stream ended before {} line",
            field
        )));
    }
    Ok(strip_newline(&String::from_utf8_lossy(&line)).to_string())
}

fn strip_newline(line: &str) -> &str {
    line.trim_end_matches('\n').trim_end_matches('\r')
}
