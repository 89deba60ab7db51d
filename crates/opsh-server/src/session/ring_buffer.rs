//! Circular buffer for output replay on subscribe.
//!
//! Stores the last N bytes of PTY output so that a newly attached or
//! reconnecting viewer can receive a scrollback snapshot without the
//! server keeping unbounded history.

use std::sync::{Mutex, PoisonError};

/// A fixed-capacity circular byte buffer, safe to share between threads.
#[derive(Debug)]
pub struct RingBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

#[derive(Debug)]
struct Inner {
    buf: Vec<u8>,
    /// Next write position (wraps around).
    write_pos: usize,
    /// Whether the buffer has wrapped at least once.
    full: bool,
    /// Total bytes ever written.
    total_written: u64,
}

impl RingBuffer {
    /// Create a new ring buffer with the given capacity in bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity],
                write_pos: 0,
                full: false,
                total_written: 0,
            }),
            capacity,
        }
    }

    /// Append data, evicting the oldest bytes once full.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.total_written += data.len() as u64;

        // Only the tail can survive a write larger than the buffer.
        if data.len() >= self.capacity {
            inner.full = true;
            inner.write_pos = 0;
            inner.buf.copy_from_slice(&data[data.len() - self.capacity..]);
            return;
        }

        let pos = inner.write_pos;
        let first = data.len().min(self.capacity - pos);
        inner.buf[pos..pos + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            inner.buf[..rest].copy_from_slice(&data[first..]);
        }

        let end = pos + data.len();
        if end >= self.capacity {
            inner.full = true;
        }
        inner.write_pos = end % self.capacity;
    }

    /// Copy of all buffered data in chronological order.
    pub fn read_all(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.full {
            return inner.buf[..inner.write_pos].to_vec();
        }
        // Wrapped: oldest data starts at write_pos.
        let mut result = Vec::with_capacity(self.capacity);
        result.extend_from_slice(&inner.buf[inner.write_pos..]);
        result.extend_from_slice(&inner.buf[..inner.write_pos]);
        result
    }

    /// Number of valid bytes currently stored.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.full {
            self.capacity
        } else {
            inner.write_pos
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes ever written through this buffer.
    pub fn total_written(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total_written
    }
}
