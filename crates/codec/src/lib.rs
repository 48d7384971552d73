//! Framed message codec.
//!
//! Messages are compact JSON documents terminated by `\n`. JSON escapes raw
//! newlines inside strings, so the terminator can never appear inside a
//! message and a byte stream can be split without a streaming parser.
//!
//! ```text
//! {"type":"ping","params":{},"id":1}\n{"type":"set_tempo","params":{"tempo":128.0},"id":2}\n
//! └──────────── frame 1 ───────────┘  └──────────────────── frame 2 ───────────────────────┘
//! ```
//!
//! - [`try_decode`] looks at a buffer and reports one complete message, "need
//!   more bytes", or a malformed frame.
//! - [`FrameDecoder`] owns a per-connection buffer and applies the same
//!   rules incrementally; it tolerates zero, one, or many messages per read.
//! - [`decode_datagram`] treats one UDP datagram as exactly one message.
//!
//! A malformed frame is fatal for a stream: the caller is expected to close
//! the connection rather than try to resynchronize.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Frame terminator.
pub const DELIMITER: u8 = b'\n';

/// Default upper bound for a single frame (1 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Datagram ended mid-document. Never recoverable on UDP.
    #[error("truncated message: {0}")]
    Truncated(#[source] serde_json::Error),

    #[error("frame exceeds {max} bytes without a terminator (have {len})")]
    FrameTooLong { len: usize, max: usize },

    #[error("empty message")]
    Empty,

    #[error("datagram carries more than one message")]
    MultipleMessages,
}

/// Result of a single [`try_decode`] attempt.
#[derive(Debug, PartialEq)]
pub enum Frame<T> {
    /// One message, plus how many bytes of the buffer it consumed (including
    /// any blank lines before it and its terminator).
    Complete { message: T, consumed: usize },
    /// No terminator yet.
    Incomplete,
}

/// Serialize one message and append the terminator.
pub fn encode<T: Serialize>(message: &T) -> serde_json::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(128);
    encode_into(message, &mut buf)?;
    Ok(buf)
}

/// Like [`encode`] but reuses a caller-owned buffer. The buffer is cleared
/// first.
pub fn encode_into<T: Serialize>(message: &T, buf: &mut Vec<u8>) -> serde_json::Result<()> {
    buf.clear();
    serde_json::to_writer(&mut *buf, message)?;
    buf.push(DELIMITER);
    Ok(())
}

/// Try to decode the first message in `buf`.
///
/// Blank lines (`\n`, `\r\n`, whitespace) between frames are skipped. Bytes
/// after the first complete frame are left for the next call.
pub fn try_decode<T: DeserializeOwned>(
    buf: &[u8],
    max_frame_bytes: usize,
) -> Result<Frame<T>, DecodeError> {
    let mut start = 0usize;
    loop {
        let rest = &buf[start..];
        let Some(pos) = rest.iter().position(|&b| b == DELIMITER) else {
            if rest.len() > max_frame_bytes {
                return Err(DecodeError::FrameTooLong {
                    len: rest.len(),
                    max: max_frame_bytes,
                });
            }
            return Ok(Frame::Incomplete);
        };

        if pos > max_frame_bytes {
            return Err(DecodeError::FrameTooLong {
                len: pos,
                max: max_frame_bytes,
            });
        }

        let line = &rest[..pos];
        if line.iter().all(u8::is_ascii_whitespace) {
            start += pos + 1;
            continue;
        }

        let message = serde_json::from_slice(line).map_err(DecodeError::Malformed)?;
        return Ok(Frame::Complete {
            message,
            consumed: start + pos + 1,
        });
    }
}

/// Decode a whole datagram as exactly one message.
///
/// A single trailing terminator is accepted so that stream-encoded bytes can
/// be sent as-is. A datagram that stops mid-document is reported as
/// [`DecodeError::Truncated`]; callers treat it like any other malformed
/// datagram.
pub fn decode_datagram<T: DeserializeOwned>(datagram: &[u8]) -> Result<T, DecodeError> {
    let body = trim_ascii_whitespace(datagram);
    if body.is_empty() {
        return Err(DecodeError::Empty);
    }
    if body.contains(&DELIMITER) {
        return Err(DecodeError::MultipleMessages);
    }
    serde_json::from_slice(body).map_err(|e| {
        if e.is_eof() {
            DecodeError::Truncated(e)
        } else {
            DecodeError::Malformed(e)
        }
    })
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Per-connection reassembly buffer.
///
/// ```
/// use stagelink_codec::FrameDecoder;
/// use stagelink_types::Command;
///
/// let mut dec = FrameDecoder::new();
/// dec.extend(br#"{"type":"ping"}"#);
/// assert!(dec.next_message::<Command>().unwrap().is_none());
/// dec.extend(b"\n");
/// assert_eq!(dec.next_message::<Command>().unwrap().unwrap().name, "ping");
/// ```
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    start: usize,
    /// Bytes after `start` already known to hold no terminator.
    scanned: usize,
    max_frame_bytes: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(8192),
            start: 0,
            scanned: 0,
            max_frame_bytes,
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.start > 0 && self.start >= self.buf.len() / 2 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete message, if any.
    ///
    /// Blank lines are consumed as they are found, so a peer sending only
    /// terminators never grows the buffer.
    pub fn next_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>, DecodeError> {
        loop {
            let pending = &self.buf[self.start..];
            let found = pending[self.scanned..]
                .iter()
                .position(|&b| b == DELIMITER)
                .map(|p| p + self.scanned);
            let Some(pos) = found else {
                self.scanned = pending.len();
                if pending.len() > self.max_frame_bytes {
                    return Err(DecodeError::FrameTooLong {
                        len: pending.len(),
                        max: self.max_frame_bytes,
                    });
                }
                return Ok(None);
            };

            if pos > self.max_frame_bytes {
                return Err(DecodeError::FrameTooLong {
                    len: pos,
                    max: self.max_frame_bytes,
                });
            }

            let blank = pending[..pos].iter().all(u8::is_ascii_whitespace);
            let decoded = if blank {
                None
            } else {
                Some(serde_json::from_slice(&pending[..pos]).map_err(DecodeError::Malformed))
            };
            self.consume(pos + 1);
            if let Some(decoded) = decoded {
                return decoded.map(Some);
            }
        }
    }

    fn consume(&mut self, n: usize) {
        self.start += n;
        self.scanned = 0;
        if self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        }
    }

    /// Bytes buffered but not yet consumed.
    pub fn pending_len(&self) -> usize {
        self.buf.len() - self.start
    }
}
