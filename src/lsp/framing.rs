//! Content-Length message framing for JSON-RPC over stdio.
//!
//! # Wire Format
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! Other `Key: Value` header lines (e.g. `Content-Type`) may precede the
//! blank line and are ignored. Header names compare case-insensitively and
//! both CRLF and LF line endings are accepted.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::lsp::message::{Message, JSONRPC_VERSION};

/// Maximum message size (100MB) to prevent OOM from malicious/buggy servers.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Longest header line accepted, terminator included.
pub const MAX_HEADER_LINE: usize = 8 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

/// Errors produced while encoding or decoding frames.
///
/// All decode errors are terminal for a connection: once the stream is
/// misaligned there is no way to find the next frame boundary.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Missing Content-Length header")]
    MissingLengthHeader,

    #[error("Malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("Invalid Content-Length value: {0:?}")]
    InvalidLength(String),

    #[error("Message size {size} exceeds maximum {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("Stream ended in the middle of a frame")]
    Truncated,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Failed to serialize message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Header block of a single frame, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Look up a header value (case-insensitive name match, last one wins).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Parsed `Content-Length`, if present.
    pub fn content_length(&self) -> Result<Option<usize>, FrameError> {
        match self.get(CONTENT_LENGTH) {
            None => Ok(None),
            Some(value) => parse_length(value).map(Some),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_length(value: &str) -> Result<usize, FrameError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FrameError::InvalidLength(value.to_string()));
    }
    value
        .parse()
        .map_err(|_| FrameError::InvalidLength(value.to_string()))
}

/// Split a header line into `(name, value)`.
///
/// The name must be non-empty and made of ASCII word characters or hyphens.
fn parse_header_line(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim_end();
    let valid_name = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    valid_name.then(|| (name, value.trim()))
}

/// Encode a message as a complete frame.
///
/// `Content-Length` is the byte length of the serialized body, which is
/// what the peer will read; it differs from the character count as soon as
/// the payload contains non-ASCII text.
pub fn encode(message: &Message) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(message).map_err(FrameError::Encode)?;
    let header = format!("{}: {}\r\n\r\n", CONTENT_LENGTH, body.len());

    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Encode and write a message, flushing afterwards.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the header block of the next frame.
///
/// Returns `Ok(None)` if the stream is at EOF before the first byte of a new
/// frame, which is how a peer that exited cleanly looks.
pub async fn read_headers<R>(reader: &mut R) -> Result<Option<Headers>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Headers::default();
    let mut line = Vec::new();
    let mut started = false;

    loop {
        line.clear();
        let bytes_read = (&mut *reader)
            .take(MAX_HEADER_LINE as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;

        if bytes_read == 0 {
            if started {
                return Err(FrameError::Truncated);
            }
            return Ok(None);
        }
        started = true;

        if line.len() > MAX_HEADER_LINE {
            return Err(FrameError::MalformedHeader(format!(
                "{}... (line exceeds {} bytes)",
                String::from_utf8_lossy(&line[..32]),
                MAX_HEADER_LINE
            )));
        }

        if line.last() != Some(&b'\n') {
            // EOF without a line terminator
            return Err(FrameError::Truncated);
        }

        let text = std::str::from_utf8(&line)
            .map_err(|_| FrameError::MalformedHeader(String::from_utf8_lossy(&line).into_owned()))?;
        let trimmed = text.trim_end_matches(['\r', '\n']);

        if trimmed.is_empty() {
            return Ok(Some(headers));
        }

        match parse_header_line(trimmed) {
            Some((name, value)) => headers.entries.push((name.to_string(), value.to_string())),
            None => return Err(FrameError::MalformedHeader(trimmed.to_string())),
        }
    }
}

/// Read the body announced by `headers` and parse it as a message.
pub async fn read_body<R>(headers: &Headers, reader: &mut R) -> Result<Message, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let size = headers
        .content_length()?
        .ok_or(FrameError::MissingLengthHeader)?;

    if size > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(e)
        }
    })?;

    let message: Message =
        serde_json::from_slice(&body).map_err(|e| FrameError::MalformedPayload(e.to_string()))?;

    if message.jsonrpc != JSONRPC_VERSION {
        return Err(FrameError::MalformedPayload(format!(
            "unsupported jsonrpc version {:?}",
            message.jsonrpc
        )));
    }

    Ok(message)
}

/// Read one complete frame. `Ok(None)` means clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Message>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    match read_headers(reader).await? {
        Some(headers) => read_body(&headers, reader).await.map(Some),
        None => Ok(None),
    }
}
