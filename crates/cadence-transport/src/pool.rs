//! # Buffer Pool
//!
//! Fixed-capacity pool of equally sized byte buffers for the real-time path.
//! Every buffer is allocated once at construction; afterwards acquire and
//! release only move storage between the free list and its current owners.
//!
//! A freshly acquired buffer is a [`SliceMut`]: the single writer. Sealing it
//! with [`SliceMut::freeze`] yields a plain [`Bytes`] that any number of
//! readers may clone and slice. When the last clone drops, the storage goes
//! back to the free list, never to the allocator.
//!
//! The free list is a bounded crossbeam channel sized to the pool, so
//! concurrent acquire (producer threads) and release (whichever thread drops
//! the last reference) never contend on a lock and a release never blocks.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, TransportError};

// ─── Acquire Mode ───────────────────────────────────────────────────────────

/// What [`BufferPool::acquire`] does when the pool is empty.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Fail immediately with `OutOfBuffers`.
    #[default]
    NonBlocking,
    /// Wait up to the given duration for a release, then fail.
    Blocking(Duration),
}

// ─── BufferPool ─────────────────────────────────────────────────────────────

struct PoolShared {
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
    capacity: usize,
    buffer_size: usize,
    exhausted: AtomicU64,
}

/// Shared handle to a fixed-capacity buffer pool. Cloning is cheap and all
/// clones draw from the same free list.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
    mode: AcquireMode,
}

impl BufferPool {
    /// Pre-allocate `capacity` buffers of `buffer_size` bytes each.
    pub fn new(capacity: usize, buffer_size: usize, mode: AcquireMode) -> Self {
        let (free_tx, free_rx) = bounded(capacity);
        for _ in 0..capacity {
            // Channel capacity equals the buffer count, so this cannot fail.
            let _ = free_tx.try_send(vec![0u8; buffer_size]);
        }
        BufferPool {
            shared: Arc::new(PoolShared {
                free_tx,
                free_rx,
                capacity,
                buffer_size,
                exhausted: AtomicU64::new(0),
            }),
            mode,
        }
    }

    /// Acquire a zeroed buffer using the pool's configured [`AcquireMode`].
    pub fn acquire(&self) -> Result<SliceMut> {
        match self.mode {
            AcquireMode::NonBlocking => self.try_acquire(),
            AcquireMode::Blocking(timeout) => self.acquire_timeout(timeout),
        }
    }

    /// Acquire without waiting, regardless of the configured mode.
    pub fn try_acquire(&self) -> Result<SliceMut> {
        match self.shared.free_rx.try_recv() {
            Ok(data) => Ok(self.wrap(data)),
            Err(_) => Err(self.exhausted()),
        }
    }

    /// Acquire, waiting at most `timeout` for another owner to release.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<SliceMut> {
        match self.shared.free_rx.recv_timeout(timeout) {
            Ok(data) => Ok(self.wrap(data)),
            Err(_) => Err(self.exhausted()),
        }
    }

    fn wrap(&self, mut data: Vec<u8>) -> SliceMut {
        data.fill(0);
        SliceMut {
            len: data.len(),
            storage: PooledStorage {
                data,
                shared: Arc::clone(&self.shared),
            },
        }
    }

    fn exhausted(&self) -> TransportError {
        self.shared.exhausted.fetch_add(1, Ordering::Relaxed);
        TransportError::OutOfBuffers {
            capacity: self.shared.capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Size in bytes of every buffer handed out.
    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    /// Buffers currently on the free list.
    pub fn available(&self) -> usize {
        self.shared.free_rx.len()
    }

    /// Buffers currently held by some owner.
    pub fn in_use(&self) -> usize {
        self.shared.capacity - self.available()
    }

    /// Number of acquire calls that failed with `OutOfBuffers`.
    pub fn exhausted_count(&self) -> u64 {
        self.shared.exhausted.load(Ordering::Relaxed)
    }

    pub fn mode(&self) -> AcquireMode {
        self.mode
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity())
            .field("buffer_size", &self.buffer_size())
            .field("available", &self.available())
            .field("mode", &self.mode)
            .finish()
    }
}

// ─── Slices ─────────────────────────────────────────────────────────────────

/// Owner of one pooled buffer. Returns the storage on drop.
struct PooledStorage {
    data: Vec<u8>,
    shared: Arc<PoolShared>,
}

impl AsRef<[u8]> for PooledStorage {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PooledStorage {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        let _ = self.shared.free_tx.try_send(data);
    }
}

/// Exclusive, writable view of a pooled buffer.
///
/// Derefs to the first `len()` bytes, initially the whole buffer.
pub struct SliceMut {
    storage: PooledStorage,
    len: usize,
}

impl SliceMut {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Full size of the underlying buffer.
    pub fn capacity(&self) -> usize {
        self.storage.data.len()
    }

    /// Shorten the visible region. Has no effect if `len` is not smaller.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Seal the buffer into a shareable read-only slice.
    pub fn freeze(self) -> Bytes {
        let len = self.len;
        Bytes::from_owner(self.storage).slice(..len)
    }
}

impl Deref for SliceMut {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.storage.data[..self.len]
    }
}

impl DerefMut for SliceMut {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.storage.data[..self.len]
    }
}

impl fmt::Debug for SliceMut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SliceMut")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

// ─── Sequence Generator ─────────────────────────────────────────────────────

/// Per-stream packet sequence counter. Wraps at `u32::MAX`.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    next: u32,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(first: u32) -> Self {
        SequenceGenerator { next: first }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u32 {
        let seq = self.next;
        self.next = self.next.wrapping_add(1);
        seq
    }

    pub fn current(&self) -> u32 {
        self.next
    }
}
