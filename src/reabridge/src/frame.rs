//! Length-prefixed frames on a byte stream.
//!
//! A frame is an 8-byte little-endian length followed by exactly that many
//! payload bytes. A zero length means the peer is going away.

use std::io::{self, Read, Write};

use thiserror::Error;

pub const HEADER_LEN: usize = 8;
/// Payload buffers grow by at most this much per read, so a bogus header
/// cannot reserve memory the peer never sends.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Whether the error means the peer is gone rather than a local fault.
    pub fn is_disconnect(&self) -> bool {
        let Self::Io(err) = self;
        matches!(
            err.kind(),
            io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
                | io::ErrorKind::NotConnected
        )
    }
}

/// Writes one frame and flushes it.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let len = payload.len() as u64;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Blocks until a whole frame has arrived.
///
/// Returns `None` when the peer closed the stream or sent a zero length.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u64::from_le_bytes(header);
    if len == 0 {
        return Ok(None);
    }
    let mut payload = Vec::new();
    reader.take(len).read_to_end(&mut payload)?;
    if (payload.len() as u64) < len {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    Ok(Some(payload))
}

/// Outcome of a non-blocking read attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum FramePoll {
    /// No complete frame yet; partial bytes are kept for the next attempt.
    Pending,
    Frame(Vec<u8>),
    Closed,
}

/// Incremental frame reader for sockets with a short read timeout.
///
/// Partial headers and payloads survive across calls, so a frame split over
/// many scheduler ticks is reassembled without blocking any of them.
#[derive(Debug, Default)]
pub struct FrameReader {
    header: [u8; HEADER_LEN],
    header_filled: usize,
    expected: u64,
    payload: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_partial(&self) -> bool {
        self.header_filled > 0
    }

    pub fn poll<R: Read>(&mut self, reader: &mut R) -> Result<FramePoll, FrameError> {
        while self.header_filled < HEADER_LEN {
            match reader.read(&mut self.header[self.header_filled..]) {
                Ok(0) => return Ok(FramePoll::Closed),
                Ok(n) => self.header_filled += n,
                Err(err) if is_retryable(&err) => return Ok(FramePoll::Pending),
                Err(err) => return Err(err.into()),
            }
            if self.header_filled == HEADER_LEN {
                let len = u64::from_le_bytes(self.header);
                if len == 0 {
                    self.reset();
                    return Ok(FramePoll::Closed);
                }
                self.expected = len;
                self.payload = Vec::new();
            }
        }

        while (self.payload.len() as u64) < self.expected {
            let start = self.payload.len();
            let remaining = self.expected - start as u64;
            let want = remaining.min(READ_CHUNK as u64) as usize;
            if self.payload.try_reserve(want).is_err() {
                self.reset();
                return Ok(FramePoll::Closed);
            }
            self.payload.resize(start + want, 0);
            let read = reader.read(&mut self.payload[start..]);
            self.payload.truncate(start + *read.as_ref().unwrap_or(&0));
            match read {
                Ok(0) => return Ok(FramePoll::Closed),
                Ok(_) => {}
                Err(err) if is_retryable(&err) => return Ok(FramePoll::Pending),
                Err(err) => return Err(err.into()),
            }
        }

        let payload = std::mem::take(&mut self.payload);
        self.reset();
        Ok(FramePoll::Frame(payload))
    }

    fn reset(&mut self) {
        self.header_filled = 0;
        self.expected = 0;
        self.payload = Vec::new();
    }
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
