//! Shared memory accounting for write buffers.
//!
//! All writers of one task share a single pool sized by the task's write
//! buffer budget. A writer reserves bytes as records arrive and releases them
//! on flush or spill; an individual writer can transiently exceed its fair
//! share when other writers have released memory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct MemoryPool {
    capacity: usize,
    used: AtomicUsize,
}

impl MemoryPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            used: AtomicUsize::new(0),
        })
    }

    /// Attempts to reserve `bytes`; returns false when the pool is exhausted.
    pub fn try_reserve(&self, bytes: usize) -> bool {
        let mut used = self.used.load(Ordering::SeqCst);
        loop {
            if used + bytes > self.capacity {
                return false;
            }
            match self.used.compare_exchange(
                used,
                used + bytes,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => used = actual,
            }
        }
    }

    pub fn release(&self, bytes: usize) {
        let previous = self.used.fetch_sub(bytes, Ordering::SeqCst);
        debug_assert!(previous >= bytes, "memory pool release underflow");
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let pool = MemoryPool::new(100);
        assert!(pool.try_reserve(60));
        assert!(pool.try_reserve(40));
        assert!(!pool.try_reserve(1));
        pool.release(40);
        assert!(pool.try_reserve(30));
        assert_eq!(pool.used(), 90);
    }
}
