//! # Buffer Reuse Pool
//!
//! Free-list of byte buffers for hot-path packet assembly: outbound symbol
//! headers, recovery workspaces, and pong frames all borrow from here so
//! the steady state recycles instead of reallocating.

/// Instance-local free-list of `Vec<u8>` buffers.
pub struct BufferPool {
    free: Vec<Vec<u8>>,
    retain: usize,
}

impl BufferPool {
    /// Pool that keeps at most `retain` buffers around.
    pub fn new(retain: usize) -> Self {
        BufferPool {
            free: Vec::with_capacity(retain),
            retain,
        }
    }

    /// Take an empty buffer with at least `capacity` bytes reserved.
    pub fn take(&mut self, capacity: usize) -> Vec<u8> {
        match self.free.pop() {
            Some(mut buf) => {
                buf.reserve(capacity);
                buf
            }
            None => Vec::with_capacity(capacity),
        }
    }

    /// Return a buffer. Dropped on the floor once the pool is full.
    pub fn give(&mut self, mut buf: Vec<u8>) {
        if self.free.len() < self.retain {
            buf.clear();
            self.free.push(buf);
        }
    }

    /// Buffers currently held.
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}
