//! Per-connection receive buffer pool.
//!
//! Every connection keeps a small free list of equally sized buffers so the
//! receive path does not allocate on every packet. When the list runs dry a
//! fresh buffer is allocated; it joins the list when released, so the pool
//! grows to the connection's actual working set and no further.
//!
//! All methods here are "no-lock" primitives: the caller must already own the
//! connection's protocol state (see [`Connection`](super::Connection)).

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};

use tracing::trace;

use crate::core::SdgResult;

/// A fixed-size receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    data: Box<[u8]>,
}

impl Buffer {
    /// Allocate a zeroed buffer, reporting allocation failure instead of
    /// aborting.
    pub fn try_new(size: usize) -> SdgResult<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)?;
        data.resize(size, 0);
        Ok(Self {
            data: data.into_boxed_slice(),
        })
    }

    /// Buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Counters describing where a pool's buffers are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers ever allocated by this pool and not yet dropped.
    pub allocated: usize,
    /// Buffers currently sitting in the free list.
    pub free: usize,
}

impl PoolStats {
    /// Buffers handed out and not yet returned.
    pub fn in_use(&self) -> usize {
        self.allocated - self.free
    }
}

/// Free list of reusable receive buffers.
#[derive(Debug)]
pub struct BufferPool {
    free: VecDeque<Buffer>,
    buffer_size: usize,
    prime_count: usize,
    primed: bool,
    allocated: usize,
}

impl BufferPool {
    /// Create an empty pool handing out buffers of `buffer_size` bytes.
    ///
    /// `prime_count` buffers are allocated by [`BufferPool::prime`].
    pub fn new(buffer_size: usize, prime_count: usize) -> Self {
        Self {
            free: VecDeque::new(),
            buffer_size,
            prime_count,
            primed: false,
            allocated: 0,
        }
    }

    /// Size of every buffer in this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Fill the free list on first use. Calling it again is a no-op.
    ///
    /// On allocation failure the buffers that were obtained stay in the
    /// list and the next call retries.
    pub fn prime(&mut self) -> SdgResult<()> {
        if self.primed {
            return Ok(());
        }

        self.free.try_reserve(self.prime_count)?;
        for _ in 0..self.prime_count {
            let buffer = Buffer::try_new(self.buffer_size)?;
            self.allocated += 1;
            self.free.push_back(buffer);
        }

        self.primed = true;
        Ok(())
    }

    /// Take a buffer from the free list, allocating one if it is empty.
    pub fn acquire(&mut self) -> SdgResult<Buffer> {
        if let Some(buffer) = self.free.pop_front() {
            return Ok(buffer);
        }

        let buffer = Buffer::try_new(self.buffer_size)?;
        self.allocated += 1;
        trace!(
            size = self.buffer_size,
            allocated = self.allocated,
            "buffer pool empty, allocated overflow buffer"
        );
        Ok(buffer)
    }

    /// Return a buffer to the free list.
    pub fn release(&mut self, buffer: Buffer) {
        debug_assert_eq!(buffer.capacity(), self.buffer_size);
        if self.free.try_reserve(1).is_err() {
            // Can't grow the list; let the buffer go instead.
            self.discard(buffer);
            return;
        }
        self.free.push_back(buffer);
    }

    /// Free a buffer this pool handed out instead of keeping it.
    pub fn discard(&mut self, buffer: Buffer) {
        debug_assert_eq!(buffer.capacity(), self.buffer_size);
        self.allocated = self.allocated.saturating_sub(1);
        drop(buffer);
    }

    /// Drop every pooled buffer.
    pub fn clear(&mut self) {
        self.allocated -= self.free.len();
        self.free.clear();
        self.primed = false;
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated,
            free: self.free.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ErrorKind, DEFAULT_BUFFER_SIZE, PRIMED_BUFFERS};

    #[test]
    fn test_prime_is_idempotent() {
        let mut pool = BufferPool::new(DEFAULT_BUFFER_SIZE, PRIMED_BUFFERS);
        pool.prime().unwrap();
        pool.prime().unwrap();

        let stats = pool.stats();
        assert_eq!(stats.allocated, PRIMED_BUFFERS);
        assert_eq!(stats.free, PRIMED_BUFFERS);
    }

    #[test]
    fn test_acquire_reuses_released_buffers() {
        let mut pool = BufferPool::new(64, 3);
        pool.prime().unwrap();

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.stats().in_use(), 2);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.stats(), PoolStats { allocated: 3, free: 3 });
    }

    #[test]
    fn test_acquire_from_empty_pool_allocates() {
        let mut pool = BufferPool::new(64, 3);

        // Never primed: every acquire must still succeed
        let buffers: Vec<_> = (0..5).map(|_| pool.acquire().unwrap()).collect();
        assert!(buffers.iter().all(|b| b.capacity() == 64));
        assert_eq!(pool.stats(), PoolStats { allocated: 5, free: 0 });

        for b in buffers {
            pool.release(b);
        }
        assert_eq!(pool.stats().in_use(), 0);
    }

    #[test]
    fn test_allocation_failure_is_reported() {
        let mut pool = BufferPool::new(usize::MAX, 3);

        let err = pool.acquire().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MemoryError);

        let err = pool.prime().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MemoryError);
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn test_clear_accounts_for_pooled_buffers() {
        let mut pool = BufferPool::new(32, 3);
        pool.prime().unwrap();
        let held = pool.acquire().unwrap();

        pool.clear();
        assert_eq!(pool.stats(), PoolStats { allocated: 1, free: 0 });

        pool.release(held);
        assert_eq!(pool.stats().in_use(), 0);
    }

    #[test]
    fn test_discard_forgets_buffer() {
        let mut pool = BufferPool::new(32, 2);
        pool.prime().unwrap();
        let held = pool.acquire().unwrap();

        pool.clear();
        pool.discard(held);
        assert_eq!(pool.stats(), PoolStats::default());
    }
}
