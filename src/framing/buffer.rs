//! Receive buffer for stream sockets.
//!
//! Uses `bytes::BytesMut` for zero-copy frame extraction.
//! Bytes accumulate across socket reads; [`ReceiveBuffer::try_extract`]
//! cuts one frame off the front when the active read's spec is satisfied
//! and leaves the remainder for the next read.
//!
//! Delimiter scans are resumable: after a miss the buffer remembers how far
//! it already looked, so feeding a large frame one chunk at a time stays
//! linear in the number of bytes received.
//!
//! # Example
//!
//! ```
//! use tagsock::framing::{FramingSpec, ReceiveBuffer};
//!
//! let mut buffer = ReceiveBuffer::new();
//! let spec = FramingSpec::delimiter("\r\n\r\n");
//!
//! buffer.extend(b"HEAD\r\n");
//! assert!(buffer.try_extract(&spec).is_none());
//!
//! buffer.extend(b"\r\nBODY");
//! let frame = buffer.try_extract(&spec).unwrap();
//! assert_eq!(&frame[..], b"HEAD\r\n\r\n");
//! assert_eq!(buffer.len(), 4);
//! ```

use bytes::{Bytes, BytesMut};

use super::FramingSpec;

/// Default initial capacity (64KB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Outcome of scanning a byte slice for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameScan {
    /// A frame of this many bytes is available at the front.
    Ready(usize),
    /// More bytes are needed. A later delimiter scan may resume at `resume_at`.
    NotReady { resume_at: usize },
}

/// Look for a complete frame at the front of `buf`.
///
/// `scan_from` is where a previous miss left off; it only matters for
/// delimiter framing. `OneMessage` and `ToEof` never complete from buffered
/// bytes alone.
pub fn scan_frame(buf: &[u8], spec: &FramingSpec, scan_from: usize) -> FrameScan {
    match spec {
        FramingSpec::Delimiter(delimiter) => {
            let start = scan_from.min(buf.len());
            match find(&buf[start..], delimiter) {
                Some(pos) => FrameScan::Ready(start + pos + delimiter.len()),
                None => FrameScan::NotReady {
                    // The tail may hold a delimiter prefix
                    resume_at: buf.len().saturating_sub(delimiter.len().saturating_sub(1)),
                },
            }
        }
        FramingSpec::ExactLength(n) if buf.len() >= *n => FrameScan::Ready(*n),
        _ => FrameScan::NotReady { resume_at: 0 },
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    if let [single] = needle {
        return haystack.iter().position(|b| b == single);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Buffer accumulating stream bytes until the active read can be satisfied.
#[derive(Debug)]
pub struct ReceiveBuffer {
    /// Bytes received but not yet handed out as a frame.
    buffer: BytesMut,
    /// Offset where the next delimiter scan resumes.
    scanned: usize,
}

impl ReceiveBuffer {
    /// Create a receive buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    /// Create a receive buffer with a custom initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            scanned: 0,
        }
    }

    /// Append bytes received from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to cut one frame matching `spec` off the front of the buffer.
    ///
    /// Returns `None` when more bytes are needed. The scan position is kept
    /// for the next call, so callers must keep asking with the same spec
    /// until a frame is produced (which is what the head-of-queue discipline
    /// guarantees).
    pub fn try_extract(&mut self, spec: &FramingSpec) -> Option<Bytes> {
        match scan_frame(&self.buffer, spec, self.scanned) {
            FrameScan::Ready(len) => {
                self.scanned = 0;
                Some(self.buffer.split_to(len).freeze())
            }
            FrameScan::NotReady { resume_at } => {
                if matches!(spec, FramingSpec::Delimiter(_)) {
                    self.scanned = resume_at;
                }
                None
            }
        }
    }

    /// Hand out everything that is left. Used when the peer closes the stream.
    pub fn take_all(&mut self) -> Bytes {
        self.scanned = 0;
        self.buffer.split().freeze()
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}
