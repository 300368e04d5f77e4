//! Decoded units and the buffer pools backing them
//!
//! A [`DecodedUnit`] owns exactly one pooled buffer. Ownership moves with the
//! unit from the reader thread to whichever consumer dequeues it; the buffer
//! goes back to its pool when the unit is released or dropped, so a unit can
//! never be returned twice.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Media track a unit belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Track {
    Audio,
    Video,
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Track::Audio => write!(f, "audio"),
            Track::Video => write!(f, "video"),
        }
    }
}

/// Free buffers kept around per pool
const MAX_IDLE_BUFFERS: usize = 32;

struct PoolInner {
    track: Track,
    capacity: usize,
    idle: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
}

/// Fixed-capacity buffer pool for one track
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool handing out buffers of `capacity` bytes
    pub fn new(track: Track, capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                track,
                capacity,
                idle: Mutex::new(Vec::new()),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Take an empty unit from the pool
    pub fn acquire(&self) -> DecodedUnit {
        let buf = self
            .inner
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0; self.inner.capacity]);
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);

        DecodedUnit {
            track: self.inner.track,
            timestamp_us: 0,
            units: 0,
            len: 0,
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Buffer size in bytes
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Units handed out and not yet released
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("track", &self.inner.track)
            .field("capacity", &self.inner.capacity)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// One timestamped chunk of decoded audio or one video frame
pub struct DecodedUnit {
    track: Track,
    timestamp_us: i64,
    units: usize,
    len: usize,
    buf: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
}

impl DecodedUnit {
    pub fn track(&self) -> Track {
        self.track
    }

    /// Presentation time in microseconds
    pub fn timestamp_us(&self) -> i64 {
        self.timestamp_us
    }

    /// Presentation time in milliseconds
    pub fn timestamp_ms(&self) -> i64 {
        crate::utils::micros_to_millis(self.timestamp_us)
    }

    /// Decoder units consumed to fill this buffer (more than one when frames were skipped)
    pub fn units(&self) -> usize {
        self.units
    }

    /// Filled payload
    pub fn data(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf[..self.len],
            None => &[],
        }
    }

    /// Whole buffer, for the decoder to fill
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        match &mut self.buf {
            Some(buf) => buf.as_mut_slice(),
            None => &mut [],
        }
    }

    /// Record what the decoder wrote into the buffer
    pub fn set_filled(&mut self, len: usize, timestamp_us: i64, units: usize) {
        self.len = len.min(self.pool.capacity);
        self.timestamp_us = timestamp_us;
        self.units = units;
    }

    /// Copy this unit into a second buffer from the same pool
    pub fn duplicate(&self) -> DecodedUnit {
        let mut copy = BufferPool {
            inner: Arc::clone(&self.pool),
        }
        .acquire();
        copy.buffer_mut()[..self.len].copy_from_slice(self.data());
        copy.set_filled(self.len, self.timestamp_us, self.units);
        copy
    }

    /// Give the buffer back to its pool
    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
            let mut idle = self.pool.idle.lock();
            if idle.len() < MAX_IDLE_BUFFERS {
                idle.push(buf);
            }
        }
    }
}

impl Drop for DecodedUnit {
    fn drop(&mut self) {
        self.give_back();
    }
}

impl fmt::Debug for DecodedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedUnit")
            .field("track", &self.track)
            .field("timestamp_us", &self.timestamp_us)
            .field("units", &self.units)
            .field("len", &self.len)
            .finish()
    }
}
