//! Line assembly for newline-framed byte streams.
//!
//! Bytes arrive in whatever chunks the socket hands out. `LineBuffer` keeps
//! the bytes that have not yet been terminated by `\n` and releases complete
//! lines one at a time; `LineReader` drives a `LineBuffer` from any
//! `AsyncRead`.
//!
//! ## Decoding
//!
//! A line is decoded only once it is complete, so a multi-byte UTF-8
//! sequence split across two reads is still decoded correctly. Invalid
//! sequences become U+FFFD instead of failing the read.

use crate::runtime::connection::TransportError;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Line terminator used on the wire.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Default upper bound for one line, terminator excluded (1 MB).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Capacity reserved before each socket read.
const READ_CHUNK: usize = 4 * 1024;

/// Buffer of received bytes not yet assembled into a line.
#[derive(Debug)]
pub struct LineBuffer {
    /// Received bytes, starting at the first byte of the next line.
    pending: BytesMut,
    /// Prefix of `pending` already searched for a terminator.
    scanned: usize,
    /// Longest line accepted before the peer is considered broken.
    max_line_length: usize,
}

impl LineBuffer {
    /// Create a buffer with the default line length limit.
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    /// Create a buffer that rejects lines longer than `max_line_length` bytes.
    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            pending: BytesMut::with_capacity(READ_CHUNK),
            scanned: 0,
            max_line_length,
        }
    }

    /// Append freshly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Take the next complete line, without its terminator.
    ///
    /// Returns `Ok(None)` when no terminator has been received yet; the
    /// partial line stays buffered.
    pub fn next_line(&mut self) -> Result<Option<String>, TransportError> {
        let unscanned = &self.pending[self.scanned..];
        match unscanned.iter().position(|&b| b == LINE_TERMINATOR) {
            Some(offset) => {
                let end = self.scanned + offset;
                let line = self.pending.split_to(end + 1);
                self.scanned = 0;

                if end > self.max_line_length {
                    return Err(TransportError::LineTooLong {
                        limit: self.max_line_length,
                    });
                }

                Ok(Some(String::from_utf8_lossy(&line[..end]).into_owned()))
            }
            None => {
                self.scanned = self.pending.len();
                if self.pending.len() > self.max_line_length {
                    return Err(TransportError::LineTooLong {
                        limit: self.max_line_length,
                    });
                }
                Ok(None)
            }
        }
    }

    /// Bytes received after the last terminator.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Returns true if a partial line is buffered.
    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Configured line length limit.
    pub fn max_line_length(&self) -> usize {
        self.max_line_length
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads newline-terminated lines from an async byte stream.
///
/// Cancel-safe: if a `read_line` future is dropped mid-read, no received
/// bytes are lost; they stay in the buffer for the next call.
#[derive(Debug)]
pub struct LineReader<R> {
    io: R,
    buffer: LineBuffer,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Wrap a stream with the default line length limit.
    pub fn new(io: R) -> Self {
        Self::with_buffer(io, LineBuffer::new())
    }

    /// Wrap a stream with an explicit buffer (and therefore line limit).
    pub fn with_buffer(io: R, buffer: LineBuffer) -> Self {
        Self {
            io,
            buffer,
            eof: false,
        }
    }

    /// Read the next line.
    ///
    /// Returns `Ok(None)` once the peer has closed its end. A trailing
    /// partial line at end-of-stream is not returned.
    pub async fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            if let Some(line) = self.buffer.next_line()? {
                return Ok(Some(line));
            }

            if self.eof {
                return Ok(None);
            }

            self.buffer.pending.reserve(READ_CHUNK);
            let n = self.io.read_buf(&mut self.buffer.pending).await?;
            if n == 0 {
                self.eof = true;
                if self.buffer.has_partial() {
                    trace!(
                        bytes = self.buffer.pending.len(),
                        "Discarding unterminated line at end of stream"
                    );
                }
                return Ok(None);
            }
        }
    }

    /// The underlying line buffer.
    pub fn buffer(&self) -> &LineBuffer {
        &self.buffer
    }
}
