use std::{
    collections::VecDeque,
    io::{self, Write},
    mem,
};

use tracing::debug;

/// Queue-entry header charged against the byte budget in addition to the
/// payload itself.
pub const CHUNK_OVERHEAD: usize = mem::size_of::<Vec<u8>>();

/// The queue would exceed its byte budget; the owning session must be
/// expired and the queue has been discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputOverflow {
    pub attempted: usize,
    pub limit: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainResult {
    /// Everything queued reached the kernel.
    Empty,
    /// The kernel refused more bytes; retry on the next writable event.
    Blocked,
    /// Hard write error; the owning session must be expired.
    Failed,
}

/// Per-session FIFO of reply bytes that could not be written because the
/// socket was busy. Filled by the output policy, drained on writable
/// events; while non-empty the session stops reading (backpressure).
pub struct DeferredQueue {
    chunks: VecDeque<Vec<u8>>,
    /// Payload plus per-chunk overhead currently queued.
    bytes: usize,
    limit: usize,
}

impl DeferredQueue {
    pub fn new(limit: usize) -> Self {
        Self { chunks: VecDeque::new(), bytes: 0, limit }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Appends a chunk, charging `bytes.len() + CHUNK_OVERHEAD`. On
    /// overflow the whole queue is dropped: the session is dead either
    /// way and a partial tail would only confuse the peer.
    pub fn enqueue(&mut self, bytes: &[u8]) -> Result<(), OutputOverflow> {
        let attempted = self.bytes + bytes.len() + CHUNK_OVERHEAD;
        if attempted > self.limit {
            self.chunks.clear();
            self.bytes = 0;
            return Err(OutputOverflow { attempted, limit: self.limit });
        }
        self.chunks.push_back(bytes.to_vec());
        self.bytes = attempted;
        Ok(())
    }

    /// Writes queued chunks until the queue is empty or the kernel pushes
    /// back. A partial write shrinks the head in place and stops; never
    /// blocks.
    pub fn drain(&mut self, stream: &mut impl Write) -> DrainResult {
        while let Some(head) = self.chunks.front_mut() {
            match stream.write(head) {
                Ok(0) => return DrainResult::Failed,

                Ok(n) if n == head.len() => {
                    self.bytes -= n + CHUNK_OVERHEAD;
                    self.chunks.pop_front();
                }

                Ok(n) => {
                    head.drain(..n);
                    self.bytes -= n;
                    return DrainResult::Blocked;
                }

                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    return DrainResult::Blocked;
                }

                Err(err) => {
                    debug!(?err, "deferred write");
                    return DrainResult::Failed;
                }
            }
        }
        DrainResult::Empty
    }
}
