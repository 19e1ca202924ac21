//! Per-connection outbound byte queue.
//!
//! The read path appends echoed bytes at the tail, the write path consumes
//! whatever the socket accepted from the head. Bytes always leave in the
//! order they were appended; a partial send keeps the unsent suffix at the
//! head for the next write-ready notification.

use bytes::{Buf, BytesMut};

/// Initial capacity reserved for a connection's first append.
const INITIAL_CAPACITY: usize = 4 * 1024;

/// Growable FIFO byte buffer.
#[derive(Debug, Default)]
pub struct OutboundBuffer {
    data: BytesMut,
}

impl OutboundBuffer {
    /// Create an empty buffer. No memory is reserved until the first append.
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
        }
    }

    /// Append bytes at the tail.
    ///
    /// Returns `true` if the buffer was empty before this call, i.e. the
    /// caller has to start polling for writability.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        let was_empty = self.data.is_empty();
        if bytes.is_empty() {
            return false;
        }
        if self.data.capacity() == 0 {
            self.data.reserve(INITIAL_CAPACITY.max(bytes.len()));
        }
        self.data.extend_from_slice(bytes);
        was_empty
    }

    /// Bytes waiting at the head of the queue.
    pub fn chunk(&self) -> &[u8] {
        &self.data
    }

    /// Drop `n` bytes from the head after a send.
    ///
    /// Returns `true` if the buffer is now empty, i.e. the caller should stop
    /// polling for writability.
    ///
    /// # Panics
    /// Panics if `n` exceeds the number of queued bytes.
    pub fn consume(&mut self, n: usize) -> bool {
        self.data.advance(n);
        self.data.is_empty()
    }

    /// Number of queued bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
