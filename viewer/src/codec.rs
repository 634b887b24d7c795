//! Sentinel framing for the viewer's stdio streams.
//!
//! Commands go out as newline-terminated lines. Replies come back as free-form
//! text terminated by a single sentinel character, with no other message
//! boundaries on the stream. [`FrameReader`] reassembles frames across as many
//! reads as it takes and [`LineWriter`] writes command lines.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame terminator used by the bundled GTKWave setup script.
pub const DEFAULT_SENTINEL: char = '§';

/// Maximum buffered output (4 MiB) without a terminator before the buffer is discarded.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const READ_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("viewer output exceeded {max} bytes without a frame terminator")]
    Oversized { max: usize },

    #[error("reading viewer output: {0}")]
    Io(#[from] std::io::Error),
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reads sentinel-terminated frames from an async reader.
///
/// `read_frame` is cancel-safe: bytes are appended to the internal buffer only
/// once a read completes, so dropping the future between reads loses nothing.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
    sentinel: Vec<u8>,
    /// Prefix of `buf` already searched for the sentinel.
    scanned: usize,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, sentinel: char) -> Self {
        let mut encoded = [0u8; 4];
        Self {
            reader,
            buf: Vec::with_capacity(READ_CHUNK_SIZE),
            sentinel: sentinel.encode_utf8(&mut encoded).as_bytes().to_vec(),
            scanned: 0,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    #[must_use]
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Read the next frame, sentinel stripped.
    ///
    /// Returns `Ok(None)` on EOF. Unterminated output still buffered at EOF is
    /// dropped: it can never become a frame.
    pub async fn read_frame(&mut self) -> Result<Option<String>, FrameError> {
        loop {
            if let Some(frame) = self.next_buffered() {
                return Ok(Some(frame));
            }

            if self.buf.len() > self.max_frame_bytes {
                self.drain();
                return Err(FrameError::Oversized {
                    max: self.max_frame_bytes,
                });
            }

            self.buf.reserve(READ_CHUNK_SIZE);
            let read = self.reader.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Ok(None);
            }
        }
    }

    /// Discard everything buffered so far. Returns the number of bytes dropped.
    pub fn drain(&mut self) -> usize {
        let dropped = self.buf.len();
        self.buf.clear();
        self.scanned = 0;
        dropped
    }

    /// Bytes received but not yet returned as part of a frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn next_buffered(&mut self) -> Option<String> {
        // Restart a little before the scanned prefix: a multibyte sentinel
        // may straddle two reads.
        let start = self.scanned.saturating_sub(self.sentinel.len() - 1);
        match find(&self.buf[start..], &self.sentinel) {
            Some(offset) => {
                let end = start + offset;
                let payload = String::from_utf8_lossy(&self.buf[..end]).into_owned();
                self.buf.drain(..end + self.sentinel.len());
                self.scanned = 0;
                Some(payload)
            }
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }
}

/// Writes newline-terminated command lines to an async writer.
///
/// Writes suspend while the underlying pipe is full; completion is reported
/// only after the whole line has been accepted and flushed.
pub struct LineWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut wire = String::with_capacity(line.len() + 1);
        wire.push_str(line);
        wire.push('\n');
        self.writer.write_all(wire.as_bytes()).await?;
        self.writer.flush().await
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.writer.shutdown().await
    }
}
